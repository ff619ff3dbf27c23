//! IG-013: Execution journal: durable per-action state keyed by
//! `(module, action)`.
//!
//! `FileJournal` keeps one YAML file per key under
//! `<state_dir>/<module>/journal/`, each written atomically (temp + rename).
//! Writes touch only their own key, so independent branches never contend.

use super::error::JournalError;
use super::types::{ActionId, ActionStatus, JournalEntry};
use crate::tripwire::{eventlog, hasher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Durable store of journal entries.
pub trait JournalStore: Send + Sync {
    fn get(&self, module: &str, action: &ActionId) -> Result<Option<JournalEntry>, JournalError>;

    /// Conditional write: a Completed entry can only be replaced by another
    /// Completed entry.
    fn put(&self, module: &str, action: &ActionId, entry: &JournalEntry) -> Result<(), JournalError>;

    /// Operator reset: return the entry to Pending and clear its result.
    /// Returns the previous entry, if any.
    fn reset(&self, module: &str, action: &ActionId) -> Result<Option<JournalEntry>, JournalError>;

    /// Every entry recorded for a module.
    fn load(&self, module: &str) -> Result<HashMap<ActionId, JournalEntry>, JournalError>;
}

fn check_transition(
    action: &ActionId,
    current: Option<&JournalEntry>,
    next: &JournalEntry,
) -> Result<(), JournalError> {
    match current {
        Some(prev) if prev.status == ActionStatus::Completed && next.status != ActionStatus::Completed => {
            Err(JournalError::IllegalTransition {
                action: action.clone(),
                from: prev.status,
                to: next.status,
            })
        }
        _ => Ok(()),
    }
}

fn reset_entry(module: &str, action: &ActionId, previous: Option<&JournalEntry>) -> JournalEntry {
    let mut entry = JournalEntry::pending(module, action);
    if let Some(prev) = previous {
        entry.attempts = prev.attempts;
    }
    entry.updated_at = Some(eventlog::now_iso8601());
    entry
}

// ============================================================================
// File-backed journal
// ============================================================================

/// One YAML file per `(module, action)` key.
#[derive(Debug, Clone)]
pub struct FileJournal {
    state_dir: PathBuf,
}

impl FileJournal {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
        }
    }

    pub fn journal_dir(&self, module: &str) -> PathBuf {
        self.state_dir.join(module).join("journal")
    }

    /// Entry file path: `<state_dir>/<module>/journal/<digest>.yaml`.
    pub fn entry_path(&self, module: &str, action: &ActionId) -> PathBuf {
        self.journal_dir(module)
            .join(format!("{}.yaml", hasher::action_digest(action)))
    }

    fn read_entry(&self, path: &Path) -> Result<JournalEntry, JournalError> {
        let content = std::fs::read_to_string(path).map_err(|e| JournalError::IoFailure {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_yaml_ng::from_str(&content).map_err(|e| JournalError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn read_keyed(
        &self,
        path: &Path,
        module: &str,
        action: &ActionId,
    ) -> Result<JournalEntry, JournalError> {
        let entry = self.read_entry(path)?;
        if entry.module_id != module || &entry.action_id != action {
            return Err(JournalError::Corrupt {
                path: path.display().to_string(),
                reason: format!(
                    "entry is keyed ({}, {}), expected ({}, {})",
                    entry.module_id, entry.action_id, module, action
                ),
            });
        }
        Ok(entry)
    }

    fn write_entry(&self, path: &Path, entry: &JournalEntry) -> Result<(), JournalError> {
        let io_err = |p: &Path, e: std::io::Error| JournalError::IoFailure {
            path: p.display().to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let yaml = serde_yaml_ng::to_string(entry).map_err(|e| JournalError::Corrupt {
            path: path.display().to_string(),
            reason: format!("serialize error: {}", e),
        })?;

        // Atomic write: temp file + rename
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml).map_err(|e| io_err(&tmp_path, e))?;
        std::fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
        Ok(())
    }
}

impl JournalStore for FileJournal {
    fn get(&self, module: &str, action: &ActionId) -> Result<Option<JournalEntry>, JournalError> {
        let path = self.entry_path(module, action);
        if !path.exists() {
            return Ok(None);
        }
        self.read_keyed(&path, module, action).map(Some)
    }

    fn put(&self, module: &str, action: &ActionId, entry: &JournalEntry) -> Result<(), JournalError> {
        let current = self.get(module, action)?;
        check_transition(action, current.as_ref(), entry)?;
        let mut entry = entry.clone();
        entry.updated_at = Some(eventlog::now_iso8601());
        self.write_entry(&self.entry_path(module, action), &entry)
    }

    fn reset(&self, module: &str, action: &ActionId) -> Result<Option<JournalEntry>, JournalError> {
        let previous = self.get(module, action)?;
        let entry = reset_entry(module, action, previous.as_ref());
        self.write_entry(&self.entry_path(module, action), &entry)?;
        Ok(previous)
    }

    fn load(&self, module: &str) -> Result<HashMap<ActionId, JournalEntry>, JournalError> {
        let dir = self.journal_dir(module);
        let mut entries = HashMap::new();
        if !dir.exists() {
            return Ok(entries);
        }
        let read_dir = std::fs::read_dir(&dir).map_err(|e| JournalError::IoFailure {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        for dirent in read_dir {
            let dirent = dirent.map_err(|e| JournalError::IoFailure {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let entry = self.read_entry(&path)?;
            if entry.module_id != module || path != self.entry_path(module, &entry.action_id) {
                return Err(JournalError::Corrupt {
                    path: path.display().to_string(),
                    reason: format!("entry for ({}, {}) stored under the wrong key", entry.module_id, entry.action_id),
                });
            }
            entries.insert(entry.action_id.clone(), entry);
        }
        Ok(entries)
    }
}

// ============================================================================
// In-memory journal
// ============================================================================

/// Journal held in memory; for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: RwLock<HashMap<(String, ActionId), JournalEntry>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all modules.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JournalStore for MemoryJournal {
    fn get(&self, module: &str, action: &ActionId) -> Result<Option<JournalEntry>, JournalError> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(&(module.to_string(), action.clone())).cloned())
    }

    fn put(&self, module: &str, action: &ActionId, entry: &JournalEntry) -> Result<(), JournalError> {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let key = (module.to_string(), action.clone());
        check_transition(action, map.get(&key), entry)?;
        let mut entry = entry.clone();
        entry.updated_at = Some(eventlog::now_iso8601());
        map.insert(key, entry);
        Ok(())
    }

    fn reset(&self, module: &str, action: &ActionId) -> Result<Option<JournalEntry>, JournalError> {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let key = (module.to_string(), action.clone());
        let previous = map.get(&key).cloned();
        map.insert(key, reset_entry(module, action, previous.as_ref()));
        Ok(previous)
    }

    fn load(&self, module: &str) -> Result<HashMap<ActionId, JournalEntry>, JournalError> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .iter()
            .filter(|((m, _), _)| m == module)
            .map(|((_, id), entry)| (id.clone(), entry.clone()))
            .collect())
    }
}

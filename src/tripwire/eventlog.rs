//! IG-015: Append-only JSONL provenance event log.

use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use chrono::{SecondsFormat, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current UTC time, RFC 3339 with a `Z` suffix.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .unsigned_abs();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path for a module.
pub fn event_log_path(state_dir: &Path, module: &str) -> PathBuf {
    state_dir.join(module).join("events.jsonl")
}

/// Append an event to the module's event log.
pub fn append_event(state_dir: &Path, module: &str, event: ProvenanceEvent) -> Result<(), String> {
    let path = event_log_path(state_dir, module);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create state dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let mut line = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;
    line.push('\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;

    // One write per line keeps concurrent appends from interleaving.
    file.write_all(line.as_bytes())
        .map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Event sink handed to the executor. Provenance is best effort: a failed
/// append is logged and never fails the run.
#[derive(Debug, Clone)]
pub struct EventLog {
    target: Option<(PathBuf, String)>,
}

impl EventLog {
    pub fn new(state_dir: &Path, module: &str) -> Self {
        Self {
            target: Some((state_dir.to_path_buf(), module.to_string())),
        }
    }

    pub fn disabled() -> Self {
        Self { target: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    pub fn record(&self, event: ProvenanceEvent) {
        if let Some((state_dir, module)) = &self.target {
            if let Err(e) = append_event(state_dir, module, event) {
                tracing::warn!(module = %module, error = %e, "event log append failed");
            }
        }
    }
}

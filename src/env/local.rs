//! IG-021: Deterministic in-process chain.
//!
//! Addresses are derived with BLAKE3 from the deployer, its nonce and the
//! artifact name, so the same sequence of deployments always yields the same
//! addresses. Every submission is indexed by its key: resubmitting a key
//! returns the original receipt, and `get_status` answers for any key seen.
//! State can be saved to JSON so consecutive CLI runs share one chain.

use super::{CallReceipt, DeployReceipt, EnvironmentAdapter, TxStatus};
use crate::core::error::ExecutionError;
use crate::core::types::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

const DEFAULT_DEPLOYER: &str = "0x00000000000000000000000000000000000000d1";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContractRecord {
    artifact: String,
    args: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainState {
    deployer: String,
    nonce: u64,
    #[serde(default)]
    contracts: BTreeMap<String, ContractRecord>,
    /// `"{address}:{method}"` → last value written by a call
    #[serde(default)]
    storage: BTreeMap<String, Value>,
    /// Submission key → result it produced
    #[serde(default)]
    submissions: BTreeMap<String, Value>,
}

impl Default for ChainState {
    fn default() -> Self {
        Self {
            deployer: DEFAULT_DEPLOYER.to_string(),
            nonce: 0,
            contracts: BTreeMap::new(),
            storage: BTreeMap::new(),
            submissions: BTreeMap::new(),
        }
    }
}

/// Per-operation call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub deploys: usize,
    pub calls: usize,
    pub static_calls: usize,
    pub status_queries: usize,
}

impl CallCounts {
    /// Operations that reach the environment (status queries excluded).
    pub fn external(&self) -> usize {
        self.deploys + self.calls + self.static_calls
    }
}

/// In-process environment adapter.
#[derive(Debug, Default)]
pub struct LocalChain {
    state: Mutex<ChainState>,
    deploys: AtomicUsize,
    calls: AtomicUsize,
    static_calls: AtomicUsize,
    status_queries: AtomicUsize,
}

impl LocalChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a saved chain; a missing file yields a fresh chain.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let state: ChainState = serde_json::from_str(&content)
            .map_err(|e| format!("invalid chain file {}: {}", path.display(), e))?;
        Ok(Self {
            state: Mutex::new(state),
            ..Self::default()
        })
    }

    /// Save the chain atomically (write to temp, then rename).
    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
            }
        }
        let json = serde_json::to_string_pretty(&*self.lock())
            .map_err(|e| format!("JSON serialize error: {}", e))?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
        std::fs::rename(&tmp_path, path)
            .map_err(|e| format!("cannot rename {}: {}", tmp_path.display(), e))?;
        Ok(())
    }

    pub fn counts(&self) -> CallCounts {
        CallCounts {
            deploys: self.deploys.load(Ordering::SeqCst),
            calls: self.calls.load(Ordering::SeqCst),
            static_calls: self.static_calls.load(Ordering::SeqCst),
            status_queries: self.status_queries.load(Ordering::SeqCst),
        }
    }

    pub fn contract_count(&self) -> usize {
        self.lock().contracts.len()
    }

    /// Artifact deployed at an address.
    pub fn artifact_at(&self, address: &str) -> Option<String> {
        self.lock().contracts.get(address).map(|c| c.artifact.clone())
    }

    /// Constructor arguments recorded for a deployment.
    pub fn deployment_args(&self, address: &str) -> Option<Vec<Value>> {
        self.lock().contracts.get(address).map(|c| c.args.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn derive_address(deployer: &str, nonce: u64, artifact: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(deployer.as_bytes());
    hasher.update(b"\0");
    hasher.update(&nonce.to_be_bytes());
    hasher.update(artifact.as_bytes());
    let hex = hasher.finalize().to_hex();
    format!("0x{}", &hex[..40])
}

fn no_contract(address: &str) -> ExecutionError {
    ExecutionError::Permanent(format!("no contract at {}", address))
}

#[async_trait]
impl EnvironmentAdapter for LocalChain {
    async fn deploy(
        &self,
        key: &str,
        artifact: &str,
        args: &[Value],
    ) -> Result<DeployReceipt, ExecutionError> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if let Some(Value::Address(address)) = state.submissions.get(key) {
            return Ok(DeployReceipt {
                address: address.clone(),
                external_ref: key.to_string(),
            });
        }
        if artifact.is_empty() {
            return Err(ExecutionError::Permanent("empty artifact name".to_string()));
        }
        state.nonce += 1;
        let address = derive_address(&state.deployer, state.nonce, artifact);
        state.contracts.insert(
            address.clone(),
            ContractRecord {
                artifact: artifact.to_string(),
                args: args.to_vec(),
            },
        );
        state
            .submissions
            .insert(key.to_string(), Value::Address(address.clone()));
        tracing::debug!(artifact, address = %address, "local deploy");
        Ok(DeployReceipt {
            address,
            external_ref: key.to_string(),
        })
    }

    async fn call(
        &self,
        key: &str,
        address: &str,
        method: &str,
        args: &[Value],
    ) -> Result<CallReceipt, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if let Some(value) = state.submissions.get(key) {
            return Ok(CallReceipt {
                value: value.clone(),
                external_ref: key.to_string(),
            });
        }
        if !state.contracts.contains_key(address) {
            return Err(no_contract(address));
        }
        let value = args.first().cloned().unwrap_or(Value::Unit);
        state
            .storage
            .insert(format!("{}:{}", address, method), value.clone());
        state.submissions.insert(key.to_string(), value.clone());
        Ok(CallReceipt {
            value,
            external_ref: key.to_string(),
        })
    }

    async fn static_call(
        &self,
        address: &str,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, ExecutionError> {
        self.static_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        if !state.contracts.contains_key(address) {
            return Err(no_contract(address));
        }
        Ok(state
            .storage
            .get(&format!("{}:{}", address, method))
            .cloned()
            .unwrap_or(Value::Unit))
    }

    async fn get_status(&self, external_ref: &str) -> Result<TxStatus, ExecutionError> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        Ok(match self.lock().submissions.get(external_ref) {
            Some(result) => TxStatus::Confirmed {
                result: result.clone(),
            },
            None => TxStatus::Unknown,
        })
    }
}

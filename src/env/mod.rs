//! IG-020: External environment adapter.
//!
//! The executor never talks to a chain directly; every external effect goes
//! through an `EnvironmentAdapter`. Submitting operations receive the
//! engine-assigned submission key so a later run can ask what became of it.

pub mod local;

use crate::core::error::ExecutionError;
use crate::core::types::Value;
use async_trait::async_trait;

/// Receipt of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReceipt {
    pub address: String,
    pub external_ref: String,
}

/// Receipt of a submitted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReceipt {
    pub value: Value,
    pub external_ref: String,
}

/// What the environment knows about a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    /// Submitted, outcome not yet final
    Pending,
    /// Took effect; `result` is what the operation produced
    Confirmed { result: Value },
    /// Submitted and rejected
    Reverted { reason: String },
    /// Never seen
    Unknown,
}

#[async_trait]
pub trait EnvironmentAdapter: Send + Sync {
    async fn deploy(
        &self,
        key: &str,
        artifact: &str,
        args: &[Value],
    ) -> Result<DeployReceipt, ExecutionError>;

    async fn call(
        &self,
        key: &str,
        address: &str,
        method: &str,
        args: &[Value],
    ) -> Result<CallReceipt, ExecutionError>;

    /// Read-only; nothing is submitted.
    async fn static_call(
        &self,
        address: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Value, ExecutionError>;

    /// Status of a submission by key or external ref.
    async fn get_status(&self, external_ref: &str) -> Result<TxStatus, ExecutionError>;
}

//! IG-002: Error taxonomy per engine phase.
//!
//! Build and resolution errors abort before any external call. Execution
//! errors classify adapter outcomes. Journal errors are fatal for a run.

use super::types::{ActionId, ActionStatus, ParamType, RunReport};
use thiserror::Error;

/// Graph construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("duplicate action id '{0}'")]
    DuplicateActionId(ActionId),

    #[error("invalid reference to '{reference}' in '{context}': {reason}")]
    InvalidReference {
        context: String,
        reference: String,
        reason: String,
    },

    #[error("duplicate export '{0}'")]
    DuplicateExport(String),

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid literal in '{context}': {reason}")]
    InvalidLiteral { context: String, reason: String },

    #[error("dependency cycle detected: {}", join_path(.path))]
    Cycle { path: Vec<ActionId> },
}

fn join_path(path: &[ActionId]) -> String {
    path.iter()
        .map(ActionId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Parameter and input resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("missing parameter '{name}': no override and no default")]
    MissingParameter { name: String },

    #[error("parameter '{name}' expects {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: ParamType,
        found: String,
    },

    #[error("unknown parameter '{name}'")]
    UnknownParameter { name: String },

    #[error("future '{future}' read by '{action}' before its action completed")]
    FutureNotReady { action: ActionId, future: String },
}

/// Classified outcome of a failed external call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Network/timeout class; retried per policy.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Rejected/reverted class; never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl ExecutionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(r) | Self::Permanent(r) => r,
        }
    }
}

/// Journal store errors. All are fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalError {
    #[error("journal I/O failure at {path}: {reason}")]
    IoFailure { path: String, reason: String },

    #[error("corrupt journal entry {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("illegal journal transition for {action}: {from} -> {to}")]
    IllegalTransition {
        action: ActionId,
        from: ActionStatus,
        to: ActionStatus,
    },
}

/// A Completed action whose inputs no longer match the description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriftError {
    #[error("inputs of completed action {action} changed ({recorded} -> {current}); reset it to redeploy")]
    InputsChanged {
        action: ActionId,
        recorded: String,
        current: String,
    },
}

/// Run-level error returned by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Drift(#[from] DriftError),

    #[error("all {failed} attempted action(s) failed")]
    AllActionsFailed {
        failed: usize,
        report: Box<RunReport>,
    },

    #[error("executor task aborted: {0}")]
    TaskAborted(String),
}

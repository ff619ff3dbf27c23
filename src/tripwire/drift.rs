//! IG-016: Input drift detection for completed actions.
//!
//! A Completed journal entry records the fingerprint of the inputs it ran
//! with. If the description or parameters now resolve to different inputs,
//! reusing the stored result would silently diverge, so the run stops.

use super::hasher;
use crate::core::error::DriftError;
use crate::core::types::{Action, JournalEntry, Value};

/// Fingerprint of an action's resolved inputs and call target.
pub fn inputs_fingerprint(action: &Action, target: Option<&str>, inputs: &[Value]) -> String {
    let mut components: Vec<String> = vec![action.id.to_string(), action.kind().to_string()];
    components.push(target.unwrap_or("-").to_string());
    for value in inputs {
        components.push(format!("{}:{}", value.type_name(), value));
    }
    let refs: Vec<&str> = components.iter().map(String::as_str).collect();
    hasher::composite_hash(&refs)
}

/// Compare a Completed entry's recorded fingerprint with the current one.
/// Entries written without a fingerprint are accepted.
pub fn check_inputs(entry: &JournalEntry, current: &str) -> Result<(), DriftError> {
    match &entry.inputs_hash {
        Some(recorded) if recorded != current => Err(DriftError::InputsChanged {
            action: entry.action_id.clone(),
            recorded: recorded.clone(),
            current: current.to_string(),
        }),
        _ => Ok(()),
    }
}

//! IG-004: Parameter binding and input resolution.
//!
//! Binds declared parameters to invocation overrides or defaults, coerces
//! raw strings into the declared type, and substitutes resolved futures into
//! action inputs. Every error here is raised before any external call.

use super::error::ResolutionError;
use super::types::*;
use indexmap::IndexMap;
use std::collections::HashMap;

/// Bind every declared parameter. Precedence: override, then default.
pub fn resolve_parameters(
    module: &Module,
    overrides: &HashMap<String, Value>,
) -> Result<IndexMap<String, Value>, ResolutionError> {
    let mut unknown: Vec<&String> = overrides
        .keys()
        .filter(|name| !module.parameters.contains_key(name.as_str()))
        .collect();
    unknown.sort();
    if let Some(name) = unknown.first() {
        return Err(ResolutionError::UnknownParameter {
            name: (*name).clone(),
        });
    }

    let mut resolved = IndexMap::new();
    for (name, decl) in &module.parameters {
        let raw = overrides
            .get(name)
            .or(decl.default.as_ref())
            .ok_or_else(|| ResolutionError::MissingParameter { name: name.clone() })?;
        let value = coerce(name, decl.param_type, raw)?;
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

/// Check a value against a declared type. Strings are parsed into the
/// declared type, so `--param supply=1000` binds a uint.
pub fn coerce(name: &str, expected: ParamType, value: &Value) -> Result<Value, ResolutionError> {
    let mismatch = || ResolutionError::TypeMismatch {
        name: name.to_string(),
        expected,
        found: format!("{} {}", value.type_name(), value),
    };

    match (expected, value) {
        (ParamType::Uint, Value::Uint(_))
        | (ParamType::Int, Value::Int(_))
        | (ParamType::Bool, Value::Bool(_))
        | (ParamType::Address, Value::Address(_))
        | (ParamType::String, Value::String(_)) => Ok(value.clone()),

        (ParamType::Uint, Value::Int(n)) => u128::try_from(*n).map(Value::Uint).map_err(|_| mismatch()),
        (ParamType::Int, Value::Uint(n)) => i128::try_from(*n).map(Value::Int).map_err(|_| mismatch()),

        (ParamType::Uint, Value::String(s)) => parse_number(s).map(Value::Uint).ok_or_else(mismatch),
        (ParamType::Int, Value::String(s)) => parse_number(s).map(Value::Int).ok_or_else(mismatch),
        (ParamType::Bool, Value::String(s)) => match s.trim() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(mismatch()),
        },
        (ParamType::Address, Value::String(s)) if is_address(s.trim()) => {
            Ok(Value::Address(s.trim().to_string()))
        }

        _ => Err(mismatch()),
    }
}

/// Decimal number, `_` separators allowed.
fn parse_number<T: std::str::FromStr>(raw: &str) -> Option<T> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != '_').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// `0x` followed by 40 hex digits.
pub fn is_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Seed the result table with bound parameters, keyed by their
/// ReadParameter action ids.
pub fn parameter_results(
    module: &Module,
    resolved: &IndexMap<String, Value>,
) -> HashMap<ActionId, Value> {
    module
        .actions
        .values()
        .filter_map(|action| match &action.operation {
            Operation::ReadParameter { parameter } => resolved
                .get(parameter)
                .map(|value| (action.id.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

/// Substitute literals and resolved futures into an action's inputs.
pub fn resolve_inputs(
    action: &Action,
    results: &HashMap<ActionId, Value>,
) -> Result<Vec<Value>, ResolutionError> {
    action
        .inputs
        .iter()
        .map(|input| match input {
            Input::Literal(value) => Ok(value.clone()),
            Input::Future(future) => lookup(action, future, results),
        })
        .collect()
}

/// Address a call or static call is sent to.
pub fn resolve_target(
    action: &Action,
    results: &HashMap<ActionId, Value>,
) -> Result<Option<String>, ResolutionError> {
    let Some(target) = action.target() else {
        return Ok(None);
    };
    match lookup(action, target, results)? {
        Value::Address(addr) => Ok(Some(addr)),
        other => Err(ResolutionError::TypeMismatch {
            name: target.id.clone(),
            expected: ParamType::Address,
            found: format!("{} {}", other.type_name(), other),
        }),
    }
}

fn lookup(
    action: &Action,
    future: &Future,
    results: &HashMap<ActionId, Value>,
) -> Result<Value, ResolutionError> {
    results
        .get(&future.producer)
        .cloned()
        .ok_or_else(|| ResolutionError::FutureNotReady {
            action: action.id.clone(),
            future: future.id.clone(),
        })
}

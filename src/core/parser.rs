//! IG-010: Description parsing, validation and module construction.
//!
//! Parses ignis.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Module name must be a valid identifier
//! - Each action sets exactly one of contract / call / static_call
//! - `on`, `after`, `{{ref}}` and export names must exist
//!
//! `build_module` then replays the description through `ModuleBuilder`.

use super::builder::{validate_name, ActionOptions, ModuleBuilder};
use super::error::BuildError;
use super::resolver::is_address;
use super::types::*;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse an ignis.yaml file from disk.
pub fn parse_description_file(path: &Path) -> Result<Description, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_description(&content)
}

/// Parse an ignis.yaml from a string.
pub fn parse_description(yaml: &str) -> Result<Description, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Parse, validate and build in one step.
pub fn load_module(path: &Path) -> Result<(Description, Module), String> {
    let desc = parse_description_file(path)?;
    let errors = validate_description(&desc);
    if !errors.is_empty() {
        let lines: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
        return Err(format!(
            "{} validation error(s) in {}:\n{}",
            errors.len(),
            path.display(),
            lines.join("\n")
        ));
    }
    let module = build_module(&desc).map_err(|e| e.to_string())?;
    Ok((desc, module))
}

/// A `{{...}}` argument.
#[derive(Debug, PartialEq, Eq)]
enum Template<'a> {
    Param(&'a str),
    Action(&'a str),
}

/// Classify a string argument: `Ok(None)` for a plain literal.
fn parse_template(raw: &str) -> Result<Option<Template<'_>>, String> {
    let s = raw.trim();
    let whole = s.starts_with("{{") && s.ends_with("}}") && s.len() >= 4;
    if !whole {
        if s.contains("{{") {
            return Err(format!("'{}' mixes a template with literal text", raw));
        }
        return Ok(None);
    }
    let inner = s[2..s.len() - 2].trim();
    if inner.is_empty() || inner.contains("{{") || inner.contains("}}") {
        return Err(format!("'{}' is not a single template", raw));
    }
    Ok(Some(match inner.strip_prefix("params.") {
        Some(param) => Template::Param(param.trim()),
        None => Template::Action(inner),
    }))
}

/// Which kinds an action spec sets.
fn kinds_of(spec: &ActionSpec) -> Vec<ActionKind> {
    let mut kinds = Vec::new();
    if spec.contract.is_some() {
        kinds.push(ActionKind::Deploy);
    }
    if spec.call.is_some() {
        kinds.push(ActionKind::Call);
    }
    if spec.static_call.is_some() {
        kinds.push(ActionKind::StaticCall);
    }
    kinds
}

/// Validate a parsed description. Returns a list of errors (empty = valid).
pub fn validate_description(desc: &Description) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if desc.version != "1.0" {
        push(format!("version must be \"1.0\", got \"{}\"", desc.version));
    }

    if desc.module.is_empty() {
        push("module must not be empty".to_string());
    } else if let Err(e) = validate_name(&desc.module) {
        push(e.to_string());
    }

    for (name, spec) in &desc.actions {
        let kinds = kinds_of(spec);
        match kinds.as_slice() {
            [] => push(format!(
                "action '{}' sets none of contract, call, static_call",
                name
            )),
            [ActionKind::Deploy] => {
                if spec.on.is_some() {
                    push(format!("action '{}' (contract) must not set 'on'", name));
                }
            }
            [_] => match &spec.on {
                None => push(format!("action '{}' needs an 'on' target", name)),
                Some(target) if !desc.actions.contains_key(target) => push(format!(
                    "action '{}' targets unknown action '{}'",
                    name, target
                )),
                Some(target) if target == name => {
                    push(format!("action '{}' targets itself", name))
                }
                Some(_) => {}
            },
            _ => push(format!(
                "action '{}' sets more than one of contract, call, static_call",
                name
            )),
        }

        for dep in &spec.after {
            if dep == name {
                push(format!("action '{}' runs after itself", name));
            } else if !desc.actions.contains_key(dep) {
                push(format!("action '{}' runs after unknown action '{}'", name, dep));
            }
        }

        for arg in &spec.args {
            let serde_yaml_ng::Value::String(s) = arg else {
                continue;
            };
            match parse_template(s) {
                Ok(Some(Template::Param(p))) if !desc.parameters.contains_key(p) => push(
                    format!("action '{}' references unknown parameter '{}'", name, p),
                ),
                Ok(Some(Template::Action(a))) if !desc.actions.contains_key(a) => push(
                    format!("action '{}' references unknown action '{}'", name, a),
                ),
                Ok(_) => {}
                Err(e) => push(format!("action '{}': {}", name, e)),
            }
        }
    }

    for export in &desc.exports {
        if !desc.actions.contains_key(export) {
            push(format!("export '{}' names an unknown action", export));
        }
    }

    errors
}

/// Convert a YAML literal into a value.
pub fn yaml_to_value(context: &str, raw: &serde_yaml_ng::Value) -> Result<Value, BuildError> {
    use serde_yaml_ng::Value as Yaml;
    let invalid = |reason: String| BuildError::InvalidLiteral {
        context: context.to_string(),
        reason,
    };
    match raw {
        Yaml::Null => Ok(Value::Unit),
        Yaml::Bool(b) => Ok(Value::Bool(*b)),
        Yaml::Number(n) => {
            if let Some(u) = n.as_u64() {
                Ok(Value::Uint(u128::from(u)))
            } else if let Some(i) = n.as_i64() {
                Ok(Value::Int(i128::from(i)))
            } else {
                Err(invalid(format!(
                    "{} is not an integer; quote large or fractional numbers",
                    n
                )))
            }
        }
        Yaml::String(s) if is_address(s) => Ok(Value::Address(s.clone())),
        Yaml::String(s) => Ok(Value::String(s.clone())),
        Yaml::Sequence(_) | Yaml::Mapping(_) => {
            Err(invalid("lists and maps are not supported as arguments".to_string()))
        }
        Yaml::Tagged(t) => Err(invalid(format!("unsupported YAML tag {}", t.tag))),
    }
}

/// Replay a description through the builder. Parameters are declared first,
/// in order, then actions in order; references may point forward.
pub fn build_module(desc: &Description) -> Result<Module, BuildError> {
    let mut m = ModuleBuilder::new(&desc.module);

    for (name, spec) in &desc.parameters {
        let default = spec
            .default
            .as_ref()
            .map(|raw| yaml_to_value(&format!("parameter {}", name), raw))
            .transpose()?;
        let param_type = spec
            .param_type
            .or_else(|| default.as_ref().and_then(Value::param_type))
            .unwrap_or(ParamType::String);
        m.get_parameter_typed(name, param_type, default);
    }

    let kind_of = |context: &str, name: &str| -> Result<ActionKind, BuildError> {
        let spec = desc
            .actions
            .get(name)
            .ok_or_else(|| BuildError::InvalidReference {
                context: context.to_string(),
                reference: name.to_string(),
                reason: "no such action".to_string(),
            })?;
        kinds_of(spec)
            .first()
            .copied()
            .ok_or_else(|| BuildError::InvalidReference {
                context: context.to_string(),
                reference: name.to_string(),
                reason: "action has no kind".to_string(),
            })
    };

    for (name, spec) in &desc.actions {
        let mut args = Vec::with_capacity(spec.args.len());
        for raw in &spec.args {
            let input = match raw {
                serde_yaml_ng::Value::String(s) => {
                    match parse_template(s).map_err(|reason| BuildError::InvalidLiteral {
                        context: name.clone(),
                        reason,
                    })? {
                        Some(Template::Param(p)) => {
                            let Some(decl) = desc.parameters.get(p) else {
                                return Err(BuildError::InvalidReference {
                                    context: name.clone(),
                                    reference: format!("params.{}", p),
                                    reason: "no such parameter".to_string(),
                                });
                            };
                            // Already declared above; this only returns the future.
                            let param_type = decl.param_type.unwrap_or(ParamType::String);
                            Input::Future(m.get_parameter_typed(p, param_type, None))
                        }
                        Some(Template::Action(a)) => Input::Future(m.reference(a, kind_of(name, a)?)),
                        None => Input::Literal(yaml_to_value(name, raw)?),
                    }
                }
                other => Input::Literal(yaml_to_value(name, other)?),
            };
            args.push(input);
        }

        let mut after = Vec::with_capacity(spec.after.len());
        for dep in &spec.after {
            after.push(m.reference(dep, kind_of(name, dep)?));
        }
        let options = ActionOptions {
            id: Some(name.clone()),
            after,
        };

        let target = |on: &Option<String>| -> Result<Future, BuildError> {
            let on = on.as_deref().ok_or_else(|| BuildError::InvalidReference {
                context: name.clone(),
                reference: String::new(),
                reason: "call needs an 'on' target".to_string(),
            })?;
            Ok(m.reference(on, kind_of(name, on)?))
        };

        match (&spec.contract, &spec.call, &spec.static_call) {
            (Some(artifact), None, None) => {
                m.contract(artifact, args, options)?;
            }
            (None, Some(method), None) => {
                let on = target(&spec.on)?;
                m.call(&on, method, args, options)?;
            }
            (None, None, Some(method)) => {
                let on = target(&spec.on)?;
                m.static_call(&on, method, args, options)?;
            }
            _ => {
                return Err(BuildError::InvalidName {
                    name: name.clone(),
                    reason: "exactly one of contract, call, static_call must be set".to_string(),
                })
            }
        }
    }

    for export in &desc.exports {
        let future = m.reference(export, kind_of("exports", export)?);
        m.export(export, &future)?;
    }

    m.build()
}

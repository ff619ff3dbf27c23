//! IG-003: Declarative module builder.
//!
//! Every operation records graph structure into an explicit `ModuleBuilder`;
//! nothing executes here. Dependencies are derived from the futures found in
//! an action's inputs, its call target and its `after` list. Composed modules
//! keep their own qualified ids (`Sub#Name`) and qualified parameter names
//! (`Sub.param`).

use super::error::BuildError;
use super::types::*;
use indexmap::IndexMap;
use std::collections::BTreeSet;

/// Options accepted by `contract`, `call` and `static_call`.
#[derive(Debug, Clone, Default)]
pub struct ActionOptions {
    /// Declared name override (defaults to artifact or `target.method`)
    pub id: Option<String>,

    /// Extra ordering dependencies
    pub after: Vec<Future>,
}

impl ActionOptions {
    pub fn with_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            after: Vec::new(),
        }
    }
}

/// Exports of a composed module, as seen from the parent.
#[derive(Debug, Clone)]
pub struct SubmoduleHandle {
    pub name: String,
    exports: IndexMap<String, Future>,
}

impl SubmoduleHandle {
    pub fn export(&self, name: &str) -> Option<&Future> {
        self.exports.get(name)
    }
}

/// Accumulates actions, parameters and exports into a `Module`.
#[derive(Debug)]
pub struct ModuleBuilder {
    name: String,
    actions: IndexMap<ActionId, Action>,
    parameters: IndexMap<String, ParameterDeclaration>,
    exports: IndexMap<String, Future>,
    submodules: BTreeSet<String>,
    next_order: u32,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            actions: IndexMap::new(),
            parameters: IndexMap::new(),
            exports: IndexMap::new(),
            submodules: BTreeSet::new(),
            next_order: 0,
        }
    }

    /// Declare (or re-read) a parameter; its type is inferred from the default.
    pub fn get_parameter(&mut self, name: &str, default: Option<Value>) -> Future {
        let param_type = default
            .as_ref()
            .and_then(Value::param_type)
            .unwrap_or(ParamType::String);
        self.get_parameter_typed(name, param_type, default)
    }

    /// Declare (or re-read) a parameter with an explicit type.
    pub fn get_parameter_typed(
        &mut self,
        name: &str,
        param_type: ParamType,
        default: Option<Value>,
    ) -> Future {
        let id = ActionId::derive(&self.name, name, ActionKind::ReadParameter);
        if !self.actions.contains_key(&id) {
            self.parameters
                .entry(name.to_string())
                .or_insert_with(|| ParameterDeclaration {
                    name: name.to_string(),
                    param_type,
                    default,
                });
            let action = Action {
                id: id.clone(),
                name: name.to_string(),
                operation: Operation::ReadParameter {
                    parameter: name.to_string(),
                },
                inputs: Vec::new(),
                dependencies: BTreeSet::new(),
                declared_order: self.take_order(),
            };
            self.actions.insert(id.clone(), action);
        }
        self.future_for(id, name, FutureType::Value)
    }

    /// Declare a contract deployment.
    pub fn contract(
        &mut self,
        artifact: &str,
        args: Vec<Input>,
        options: ActionOptions,
    ) -> Result<Future, BuildError> {
        let name = options.id.clone().unwrap_or_else(|| artifact.to_string());
        let operation = Operation::Deploy {
            artifact: artifact.to_string(),
        };
        self.add_action(&name, operation, args, options.after, FutureType::Address)
    }

    /// Declare a submitted call on a deployed contract.
    pub fn call(
        &mut self,
        target: &Future,
        method: &str,
        args: Vec<Input>,
        options: ActionOptions,
    ) -> Result<Future, BuildError> {
        let name = options
            .id
            .clone()
            .unwrap_or_else(|| format!("{}.{}", target.name, method));
        let operation = Operation::Call {
            target: target.clone(),
            method: method.to_string(),
        };
        self.add_action(&name, operation, args, options.after, FutureType::Value)
    }

    /// Declare a read-only call; it is never submitted.
    pub fn static_call(
        &mut self,
        target: &Future,
        method: &str,
        args: Vec<Input>,
        options: ActionOptions,
    ) -> Result<Future, BuildError> {
        let name = options
            .id
            .clone()
            .unwrap_or_else(|| format!("{}.{}", target.name, method));
        let operation = Operation::StaticCall {
            target: target.clone(),
            method: method.to_string(),
        };
        self.add_action(&name, operation, args, options.after, FutureType::Value)
    }

    /// Reference an action by declared name before (or after) it is declared.
    /// The reference is checked when the module is built.
    pub fn reference(&self, name: &str, kind: ActionKind) -> Future {
        let id = ActionId::derive(&self.name, name, kind);
        let future_type = match kind {
            ActionKind::Deploy => FutureType::Address,
            _ => FutureType::Value,
        };
        self.future_for(id, name, future_type)
    }

    /// Export a future under a name.
    pub fn export(&mut self, name: &str, future: &Future) -> Result<(), BuildError> {
        self.check_scope(name, future)?;
        if self.exports.contains_key(name) {
            return Err(BuildError::DuplicateExport(name.to_string()));
        }
        self.exports.insert(name.to_string(), future.clone());
        Ok(())
    }

    /// Compose a built module into this one.
    pub fn use_module(&mut self, sub: Module) -> Result<SubmoduleHandle, BuildError> {
        if sub.name == self.name {
            return Err(BuildError::InvalidName {
                name: sub.name,
                reason: "a module cannot include itself".to_string(),
            });
        }
        let handle = SubmoduleHandle {
            name: sub.name.clone(),
            exports: sub.exports.clone(),
        };
        if self.submodules.contains(&sub.name) {
            // Same description included twice: ids are identical, nothing to add.
            let prefix = format!("{}#", sub.name);
            let merged: BTreeSet<&ActionId> = self
                .actions
                .keys()
                .filter(|id| id.as_str().starts_with(&prefix))
                .collect();
            let incoming: BTreeSet<&ActionId> = sub
                .actions
                .keys()
                .filter(|id| id.as_str().starts_with(&prefix))
                .collect();
            return match incoming.symmetric_difference(&merged).next() {
                Some(clash) => Err(BuildError::DuplicateActionId((*clash).clone())),
                None => Ok(handle),
            };
        }

        for id in sub.actions.keys() {
            if self.actions.contains_key(id) {
                return Err(BuildError::DuplicateActionId(id.clone()));
            }
        }
        let prefix = format!("{}.", sub.name);
        for name in sub.parameters.keys() {
            let qualified = format!("{}{}", prefix, name);
            if self.parameters.contains_key(&qualified) {
                return Err(BuildError::InvalidName {
                    name: qualified,
                    reason: "parameter already declared by the including module".to_string(),
                });
            }
        }

        for (id, mut action) in sub.actions {
            action.declared_order = self.take_order();
            if let Operation::ReadParameter { parameter } = &mut action.operation {
                *parameter = format!("{}{}", prefix, parameter);
            }
            self.actions.insert(id, action);
        }
        for (name, mut decl) in sub.parameters {
            let qualified = format!("{}{}", prefix, name);
            decl.name.clone_from(&qualified);
            self.parameters.insert(qualified, decl);
        }
        self.submodules.insert(sub.name);
        self.submodules.extend(sub.submodules);

        Ok(handle)
    }

    /// Finish the description: check references and return the module.
    /// Cycles are reported by the planner.
    pub fn build(self) -> Result<Module, BuildError> {
        validate_name(&self.name)?;
        for action in self.actions.values() {
            for dep in &action.dependencies {
                if !self.actions.contains_key(dep) {
                    return Err(BuildError::InvalidReference {
                        context: action.id.to_string(),
                        reference: dep.to_string(),
                        reason: "no such action in module".to_string(),
                    });
                }
            }
        }
        for (name, future) in &self.exports {
            if !self.actions.contains_key(&future.producer) {
                return Err(BuildError::InvalidReference {
                    context: format!("export {}", name),
                    reference: future.producer.to_string(),
                    reason: "no such action in module".to_string(),
                });
            }
        }

        Ok(Module {
            name: self.name,
            actions: self.actions,
            parameters: self.parameters,
            exports: self.exports,
            submodules: self.submodules,
        })
    }

    fn add_action(
        &mut self,
        name: &str,
        operation: Operation,
        inputs: Vec<Input>,
        after: Vec<Future>,
        future_type: FutureType,
    ) -> Result<Future, BuildError> {
        if name.contains('#') || name.is_empty() {
            return Err(BuildError::InvalidName {
                name: name.to_string(),
                reason: "action names must be non-empty and must not contain '#'".to_string(),
            });
        }
        let kind = match operation {
            Operation::Deploy { .. } => ActionKind::Deploy,
            Operation::Call { .. } => ActionKind::Call,
            Operation::StaticCall { .. } => ActionKind::StaticCall,
            Operation::ReadParameter { .. } => ActionKind::ReadParameter,
        };
        let id = ActionId::derive(&self.name, name, kind);
        if self.actions.contains_key(&id) {
            return Err(BuildError::DuplicateActionId(id));
        }

        let mut dependencies = BTreeSet::new();
        let referenced = inputs
            .iter()
            .filter_map(Input::future)
            .chain(after.iter())
            .chain(target_of(&operation));
        for future in referenced {
            self.check_scope(id.as_str(), future)?;
            dependencies.insert(future.producer.clone());
        }

        let action = Action {
            id: id.clone(),
            name: name.to_string(),
            operation,
            inputs,
            dependencies,
            declared_order: self.take_order(),
        };
        self.actions.insert(id.clone(), action);
        Ok(self.future_for(id, name, future_type))
    }

    /// Reject futures created by an unrelated module.
    fn check_scope(&self, context: &str, future: &Future) -> Result<(), BuildError> {
        if future.module == self.name || self.submodules.contains(&future.module) {
            return Ok(());
        }
        Err(BuildError::InvalidReference {
            context: context.to_string(),
            reference: future.id.clone(),
            reason: format!("future belongs to module '{}'", future.module),
        })
    }

    fn future_for(&self, producer: ActionId, name: &str, future_type: FutureType) -> Future {
        Future {
            id: producer.to_string(),
            future_type,
            module: producer.module().to_string(),
            producer,
            name: name.to_string(),
        }
    }

    fn take_order(&mut self) -> u32 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }
}

fn target_of(operation: &Operation) -> Option<&Future> {
    match operation {
        Operation::Call { target, .. } | Operation::StaticCall { target, .. } => Some(target),
        _ => None,
    }
}

/// Module names become id prefixes and directory names.
pub fn validate_name(name: &str) -> Result<(), BuildError> {
    let bad = name.is_empty()
        || name
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    if bad {
        return Err(BuildError::InvalidName {
            name: name.to_string(),
            reason: "module names must be non-empty [A-Za-z0-9_-]".to_string(),
        });
    }
    Ok(())
}

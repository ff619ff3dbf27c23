//! IG-005: Plan generation.
//!
//! Rejects cyclic graphs with the full cycle path, orders actions with Kahn's
//! algorithm (ties broken by declared order), and records which actions may
//! run concurrently. `review` annotates a plan with journal state.

use super::error::BuildError;
use super::types::*;
use indexmap::IndexMap;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

/// Build the execution plan for a module.
pub fn plan(module: &Module) -> Result<ExecutionPlan, BuildError> {
    detect_cycle(module)?;
    let order = execution_order(module);
    let concurrent = concurrency_sets(module, &order);
    Ok(ExecutionPlan {
        module: module.name.clone(),
        order,
        concurrent,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Three-colour DFS over dependency edges, roots visited in declared order.
/// The reported path repeats its first id: `[A, B, A]`.
pub fn detect_cycle(module: &Module) -> Result<(), BuildError> {
    let mut marks: HashMap<&ActionId, Mark> = module
        .actions
        .keys()
        .map(|id| (id, Mark::Unvisited))
        .collect();

    for root in module.actions.keys() {
        if marks.get(root) != Some(&Mark::Unvisited) {
            continue;
        }
        // Explicit stack of (node, next dependency index)
        let mut stack: Vec<(&ActionId, usize)> = vec![(root, 0)];
        let mut path: Vec<&ActionId> = vec![root];
        marks.insert(root, Mark::InProgress);

        while let Some((node, idx)) = stack.last_mut() {
            let deps: Vec<&ActionId> = module
                .actions
                .get(*node)
                .map(|a| a.dependencies.iter().collect())
                .unwrap_or_default();
            if *idx >= deps.len() {
                marks.insert(*node, Mark::Done);
                stack.pop();
                path.pop();
                continue;
            }
            let next = deps[*idx];
            *idx += 1;
            match marks.get(next).copied() {
                Some(Mark::Unvisited) => {
                    marks.insert(next, Mark::InProgress);
                    stack.push((next, 0));
                    path.push(next);
                }
                Some(Mark::InProgress) => {
                    let start = path.iter().position(|id| *id == next).unwrap_or(0);
                    // Dependency edges point backwards; reverse to producer -> consumer.
                    let mut cycle: Vec<ActionId> =
                        path[start..].iter().rev().map(|id| (*id).clone()).collect();
                    cycle.rotate_right(1);
                    cycle.push(cycle[0].clone());
                    return Err(BuildError::Cycle { path: cycle });
                }
                // Done, or an id outside the module (rejected at build time)
                _ => {}
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm; among ready actions the lowest declared order goes first.
pub fn execution_order(module: &Module) -> Vec<ActionId> {
    let mut in_degree: HashMap<&ActionId, usize> = HashMap::new();
    let mut dependents: HashMap<&ActionId, Vec<&ActionId>> = HashMap::new();

    for (id, action) in &module.actions {
        let known = action
            .dependencies
            .iter()
            .filter(|d| module.actions.contains_key(*d));
        let mut degree = 0;
        for dep in known {
            dependents.entry(dep).or_default().push(id);
            degree += 1;
        }
        in_degree.insert(id, degree);
    }

    let mut ready: BinaryHeap<Reverse<(u32, &ActionId)>> = module
        .actions
        .values()
        .filter(|a| in_degree.get(&a.id) == Some(&0))
        .map(|a| Reverse((a.declared_order, &a.id)))
        .collect();

    let mut order = Vec::with_capacity(module.actions.len());
    while let Some(Reverse((_, current))) = ready.pop() {
        order.push(current.clone());
        for next in dependents.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(*next) {
                *degree -= 1;
                if *degree == 0 {
                    let declared = module.actions[*next].declared_order;
                    ready.push(Reverse((declared, *next)));
                }
            }
        }
    }
    order
}

/// Transitive dependencies of every action, computed along a topological order.
pub fn ancestors(module: &Module, order: &[ActionId]) -> HashMap<ActionId, BTreeSet<ActionId>> {
    let mut result: HashMap<ActionId, BTreeSet<ActionId>> = HashMap::new();
    for id in order {
        let mut set = BTreeSet::new();
        if let Some(action) = module.actions.get(id) {
            for dep in &action.dependencies {
                set.insert(dep.clone());
                if let Some(upstream) = result.get(dep) {
                    set.extend(upstream.iter().cloned());
                }
            }
        }
        result.insert(id.clone(), set);
    }
    result
}

/// For each action, the actions with no path to or from it.
pub fn concurrency_sets(
    module: &Module,
    order: &[ActionId],
) -> IndexMap<ActionId, BTreeSet<ActionId>> {
    let ancestors = ancestors(module, order);
    let empty = BTreeSet::new();
    order
        .iter()
        .map(|id| {
            let mine = ancestors.get(id).unwrap_or(&empty);
            let set = order
                .iter()
                .filter(|other| *other != id)
                .filter(|other| !mine.contains(*other))
                .filter(|other| {
                    !ancestors
                        .get(*other)
                        .map(|theirs| theirs.contains(id))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            (id.clone(), set)
        })
        .collect()
}

/// Every action that transitively depends on `failed`.
pub fn dependents_of(module: &Module, failed: &ActionId) -> BTreeSet<ActionId> {
    let mut found = BTreeSet::new();
    let mut frontier = vec![failed.clone()];
    while let Some(current) = frontier.pop() {
        for action in module.actions.values() {
            if action.dependencies.contains(&current) && found.insert(action.id.clone()) {
                frontier.push(action.id.clone());
            }
        }
    }
    found
}

/// Annotate a plan with what a run would do given the journal.
pub fn review(
    module: &Module,
    plan: &ExecutionPlan,
    entries: &HashMap<ActionId, JournalEntry>,
) -> PlanReview {
    let mut steps = Vec::with_capacity(plan.order.len());
    let (mut to_execute, mut to_reuse, mut to_reconcile, mut to_retry) = (0u32, 0u32, 0u32, 0u32);

    for id in &plan.order {
        let Some(action) = module.actions.get(id) else {
            continue;
        };
        let disposition = disposition_for(action, entries.get(id));
        match disposition {
            Disposition::Execute => to_execute += 1,
            Disposition::Reuse => to_reuse += 1,
            Disposition::Reconcile => to_reconcile += 1,
            Disposition::Retry => to_retry += 1,
            Disposition::Bind => {}
        }
        steps.push(PlannedStep {
            action_id: id.clone(),
            kind: action.kind(),
            disposition,
            description: describe(action, disposition),
        });
    }

    PlanReview {
        module: plan.module.clone(),
        steps,
        to_execute,
        to_reuse,
        to_reconcile,
        to_retry,
    }
}

fn disposition_for(action: &Action, entry: Option<&JournalEntry>) -> Disposition {
    if action.kind() == ActionKind::ReadParameter {
        return Disposition::Bind;
    }
    match entry.map(|e| e.status) {
        None => Disposition::Execute,
        Some(ActionStatus::Completed) => Disposition::Reuse,
        Some(ActionStatus::Executing) => Disposition::Reconcile,
        Some(ActionStatus::Pending) | Some(ActionStatus::Failed) => Disposition::Retry,
    }
}

fn describe(action: &Action, disposition: Disposition) -> String {
    let what = match &action.operation {
        Operation::Deploy { artifact } => format!("deploy {}", artifact),
        Operation::Call { target, method } => format!("call {}.{}", target.name, method),
        Operation::StaticCall { target, method } => format!("read {}.{}", target.name, method),
        Operation::ReadParameter { parameter } => format!("bind parameter {}", parameter),
    };
    match disposition {
        Disposition::Bind | Disposition::Execute => what,
        Disposition::Reuse => format!("{} (completed, reused)", what),
        Disposition::Reconcile => format!("{} (in flight earlier, reconcile)", what),
        Disposition::Retry => format!("{} (retry)", what),
    }
}

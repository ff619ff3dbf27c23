//! IG-012: Executor. Drives a planned module against the environment.
//!
//! Pipeline: plan → bind parameters → load journal → settle completed and
//! in-flight entries → dispatch ready actions → report.
//!
//! Before every submission the journal entry is written Executing with the
//! submission key, so an interrupted run leaves enough behind to reconcile.
//! Independent actions run concurrently up to `max_in_flight`; a permanent
//! failure skips only its dependents.
//!
//! A Completed entry is reused only while its inputs still fingerprint the
//! same. When its dependencies are themselves re-executed in this run, the
//! check waits until they have produced their new results.

use super::error::{EngineError, ExecutionError, JournalError, ResolutionError};
use super::journal::JournalStore;
use super::planner;
use super::resolver;
use super::types::*;
use crate::env::{EnvironmentAdapter, TxStatus};
use crate::tripwire::drift;
use crate::tripwire::eventlog::{self, EventLog};
use crate::tripwire::hasher;
use indexmap::IndexMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs modules against one environment and one journal.
pub struct Executor {
    adapter: Arc<dyn EnvironmentAdapter>,
    journal: Arc<dyn JournalStore>,
    policy: Policy,
    events: EventLog,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(adapter: Arc<dyn EnvironmentAdapter>, journal: Arc<dyn JournalStore>) -> Self {
        Self {
            adapter,
            journal,
            policy: Policy::default(),
            events: EventLog::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// Use an externally owned token; cancelling it stops new dispatch.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute a module. Build, resolution and drift errors are returned
    /// before any submission; a journal error stops dispatch, lets in-flight
    /// actions finish, and is returned.
    pub async fn run(
        &self,
        module: &Module,
        overrides: &HashMap<String, Value>,
    ) -> Result<RunReport, EngineError> {
        let start = Instant::now();
        let plan = planner::plan(module)?;
        let params = resolver::resolve_parameters(module, overrides)?;
        let entries = self.journal.load(&module.name)?;
        let run_id = eventlog::generate_run_id();

        tracing::info!(module = %module.name, run_id = %run_id, actions = plan.order.len(), "run started");
        self.events.record(ProvenanceEvent::RunStarted {
            module: module.name.clone(),
            run_id: run_id.clone(),
            ignis_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        let mut run = RunState {
            module,
            plan: &plan,
            results: resolver::parameter_results(module, &params),
            settled: HashMap::new(),
            deferred: HashMap::new(),
        };
        self.settle_from_journal(&mut run, &entries).await?;
        self.dispatch(&mut run, &entries).await?;

        let RunState {
            mut settled,
            results,
            ..
        } = run;
        let outcomes: IndexMap<ActionId, ActionOutcome> = plan
            .order
            .iter()
            .filter_map(|id| settled.remove(id).map(|o| (id.clone(), o)))
            .collect();
        let exports = module
            .exports
            .iter()
            .filter(|(_, future)| {
                outcomes
                    .get(&future.producer)
                    .map(ActionOutcome::is_completed)
                    .unwrap_or(false)
            })
            .filter_map(|(name, future)| {
                results
                    .get(&future.producer)
                    .map(|v| (name.clone(), v.clone()))
            })
            .collect();

        let report = RunReport {
            module: module.name.clone(),
            run_id: run_id.clone(),
            outcomes,
            exports,
            total_duration: start.elapsed(),
        };

        tracing::info!(
            module = %module.name,
            completed = report.completed(),
            failed = report.failed(),
            skipped = report.skipped(),
            "run finished"
        );
        self.events.record(ProvenanceEvent::RunCompleted {
            module: module.name.clone(),
            run_id,
            actions_completed: report.completed() as u32,
            actions_failed: report.failed() as u32,
            actions_skipped: report.skipped() as u32,
            total_seconds: report.total_duration.as_secs_f64(),
        });

        // Bound parameters do not count as progress.
        let progressed = report.outcomes.iter().any(|(id, outcome)| {
            outcome.is_completed()
                && module
                    .actions
                    .get(id)
                    .map(|a| a.kind() != ActionKind::ReadParameter)
                    .unwrap_or(false)
        });
        if report.failed() > 0 && !progressed {
            return Err(EngineError::AllActionsFailed {
                failed: report.failed(),
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    /// Settle what the journal already knows: bind parameters, reuse
    /// Completed results (after an input drift check) and reconcile entries
    /// left Executing by an earlier run.
    async fn settle_from_journal(
        &self,
        run: &mut RunState<'_>,
        entries: &HashMap<ActionId, JournalEntry>,
    ) -> Result<(), EngineError> {
        let module = run.module;
        let plan = run.plan;
        for id in &plan.order {
            let Some(action) = module.actions.get(id) else {
                continue;
            };
            if action.kind() == ActionKind::ReadParameter {
                if let Some(value) = run.results.get(id).cloned() {
                    run.settled.insert(
                        id.clone(),
                        ActionOutcome::Completed {
                            result: value,
                            reused: false,
                        },
                    );
                }
                continue;
            }
            if run.settled.contains_key(id) {
                continue;
            }
            let Some(entry) = entries.get(id) else {
                continue;
            };
            match entry.status {
                ActionStatus::Completed => {
                    let result = entry.result.clone().ok_or_else(|| JournalError::Corrupt {
                        path: format!("{}/{}", module.name, id),
                        reason: "completed entry has no result".to_string(),
                    })?;
                    let Some(current) = current_fingerprint(action, &run.results) else {
                        tracing::debug!(action = %id, "dependencies pending; input check deferred");
                        run.deferred.insert(id.clone(), entry.clone());
                        continue;
                    };
                    drift::check_inputs(entry, &current)?;
                    tracing::debug!(action = %id, "reusing completed result");
                    run.results.insert(id.clone(), result.clone());
                    run.settled.insert(
                        id.clone(),
                        ActionOutcome::Completed {
                            result,
                            reused: true,
                        },
                    );
                }
                ActionStatus::Executing => self.reconcile(run, action, entry).await?,
                ActionStatus::Pending | ActionStatus::Failed => {}
            }
        }
        Ok(())
    }

    /// Ask the environment what became of a submission left Executing.
    async fn reconcile(
        &self,
        run: &mut RunState<'_>,
        action: &Action,
        entry: &JournalEntry,
    ) -> Result<(), EngineError> {
        let declaring = run.module;
        let module = &declaring.name;
        let Some(external_ref) = entry.external_ref.as_deref() else {
            self.record_reconciled(module, &action.id, "no submission recorded; re-dispatching");
            return Ok(());
        };

        match self.adapter.get_status(external_ref).await {
            Ok(TxStatus::Confirmed { result }) => {
                let mut done = entry.clone();
                done.status = ActionStatus::Completed;
                done.result = Some(result.clone());
                done.error = None;
                done.inputs_hash = current_fingerprint(action, &run.results);
                self.journal.put(module, &action.id, &done)?;
                self.record_reconciled(module, &action.id, "confirmed");
                run.results.insert(action.id.clone(), result.clone());
                run.settled.insert(
                    action.id.clone(),
                    ActionOutcome::Completed {
                        result,
                        reused: true,
                    },
                );
            }
            Ok(TxStatus::Reverted { reason }) => {
                self.record_reconciled(module, &action.id, &format!("reverted ({}); re-dispatching", reason));
            }
            Ok(TxStatus::Unknown) => {
                self.record_reconciled(module, &action.id, "unknown; re-dispatching");
            }
            Ok(TxStatus::Pending) => {
                self.record_reconciled(module, &action.id, "still pending");
                let error = format!("submission {} still pending; rerun to reconcile", external_ref);
                self.fail(run, &action.id, error);
            }
            Err(e) => {
                let error = format!("status query for {} failed: {}", external_ref, e);
                self.fail(run, &action.id, error);
            }
        }
        Ok(())
    }

    /// Dispatch ready actions until nothing is ready or in flight.
    async fn dispatch(
        &self,
        run: &mut RunState<'_>,
        entries: &HashMap<ActionId, JournalEntry>,
    ) -> Result<(), EngineError> {
        let module = run.module;
        let plan = run.plan;

        let mut frontier = Frontier::default();
        for action in module.actions.values() {
            for dep in &action.dependencies {
                frontier.dependents.entry(dep).or_default().push(&action.id);
            }
        }

        for id in &plan.order {
            if run.settled.contains_key(id) {
                continue;
            }
            let Some(action) = module.actions.get(id) else {
                continue;
            };
            let unresolved = action
                .dependencies
                .iter()
                .filter(|d| !run.results.contains_key(*d))
                .count();
            if unresolved == 0 {
                frontier.ready.push(Reverse((action.declared_order, id.clone())));
            } else {
                frontier.waiting.insert(id.clone(), unresolved);
            }
        }

        let max_in_flight = self.policy.max_in_flight.max(1);
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut fatal: Option<EngineError> = None;

        loop {
            while fatal.is_none() && !self.cancel.is_cancelled() && tasks.len() < max_in_flight {
                let Some(Reverse((_, id))) = frontier.ready.pop() else {
                    break;
                };
                if run.settled.contains_key(&id) {
                    continue;
                }
                let Some(action) = module.actions.get(&id) else {
                    continue;
                };
                if let Some(entry) = run.deferred.remove(&id) {
                    if self.reuse_deferred(run, action, &entry) {
                        frontier.release(module, &id);
                    }
                    continue;
                }
                match self.prepare(&module.name, action, &run.results, entries.get(&id)) {
                    Ok(task) => {
                        tasks.spawn(task.run());
                    }
                    Err(e) => fatal = Some(e.into()),
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((id, Ok(TaskOutcome::Completed { result }))) => {
                    run.results.insert(id.clone(), result.clone());
                    run.settled.insert(
                        id.clone(),
                        ActionOutcome::Completed {
                            result,
                            reused: false,
                        },
                    );
                    frontier.release(module, &id);
                }
                Ok((id, Ok(TaskOutcome::Failed { error }))) => self.fail(run, &id, error),
                Ok((id, Err(e))) => {
                    tracing::error!(action = %id, error = %e, "journal write failed; stopping dispatch");
                    run.settled.insert(id, ActionOutcome::Failed { error: e.to_string() });
                    fatal.get_or_insert(e.into());
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "action task aborted");
                    fatal.get_or_insert(EngineError::TaskAborted(join_err.to_string()));
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        for id in &plan.order {
            if !run.settled.contains_key(id) {
                self.events.record(ProvenanceEvent::ActionSkipped {
                    module: module.name.clone(),
                    action: id.to_string(),
                    reason: SkipReason::Cancelled.to_string(),
                });
                run.settled.insert(
                    id.clone(),
                    ActionOutcome::Skipped {
                        reason: SkipReason::Cancelled,
                    },
                );
            }
        }
        if self.cancel.is_cancelled() {
            tracing::warn!(module = %module.name, "run cancelled; undispatched actions skipped");
        }
        Ok(())
    }

    /// Input check for a Completed entry whose dependencies settled during
    /// this run. Returns whether the stored result was reused.
    fn reuse_deferred(&self, run: &mut RunState<'_>, action: &Action, entry: &JournalEntry) -> bool {
        let checked = match (current_fingerprint(action, &run.results), &entry.result) {
            (Some(current), Some(result)) => drift::check_inputs(entry, &current)
                .map(|()| result.clone())
                .map_err(|e| e.to_string()),
            (None, _) => Err(format!("inputs of completed action {} could not be resolved", action.id)),
            (_, None) => Err(format!("completed entry for {} has no result", action.id)),
        };
        match checked {
            Ok(result) => {
                tracing::debug!(action = %action.id, "inputs unchanged; reusing completed result");
                run.results.insert(action.id.clone(), result.clone());
                run.settled.insert(
                    action.id.clone(),
                    ActionOutcome::Completed {
                        result,
                        reused: true,
                    },
                );
                true
            }
            Err(error) => {
                self.fail(run, &action.id, error);
                false
            }
        }
    }

    fn prepare(
        &self,
        module: &str,
        action: &Action,
        results: &HashMap<ActionId, Value>,
        previous: Option<&JournalEntry>,
    ) -> Result<ActionTask, ResolutionError> {
        let inputs = resolver::resolve_inputs(action, results)?;
        let target = resolver::resolve_target(action, results)?;
        let fingerprint = drift::inputs_fingerprint(action, target.as_deref(), &inputs);
        Ok(ActionTask {
            adapter: Arc::clone(&self.adapter),
            journal: Arc::clone(&self.journal),
            policy: self.policy.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            module: module.to_string(),
            action: action.clone(),
            inputs,
            target,
            fingerprint,
            previous: previous.cloned(),
        })
    }

    /// Record a failure and skip every transitive dependent.
    fn fail(&self, run: &mut RunState<'_>, id: &ActionId, error: String) {
        let declaring = run.module;
        let module = &declaring.name;
        tracing::warn!(module = %module, action = %id, error = %error, "action failed");
        self.events.record(ProvenanceEvent::ActionFailed {
            module: module.clone(),
            action: id.to_string(),
            error: error.clone(),
        });
        run.settled
            .insert(id.clone(), ActionOutcome::Failed { error });

        for dependent in planner::dependents_of(declaring, id) {
            if run.settled.contains_key(&dependent) {
                continue;
            }
            let reason = SkipReason::DependencyFailed(id.clone());
            self.events.record(ProvenanceEvent::ActionSkipped {
                module: module.clone(),
                action: dependent.to_string(),
                reason: reason.to_string(),
            });
            run.settled
                .insert(dependent, ActionOutcome::Skipped { reason });
        }
    }

    fn record_reconciled(&self, module: &str, id: &ActionId, outcome: &str) {
        tracing::info!(module, action = %id, outcome, "reconciled in-flight action");
        self.events.record(ProvenanceEvent::ActionReconciled {
            module: module.to_string(),
            action: id.to_string(),
            outcome: outcome.to_string(),
        });
    }
}

/// Fingerprint of an action's inputs, if every dependency has a result.
fn current_fingerprint(action: &Action, results: &HashMap<ActionId, Value>) -> Option<String> {
    let inputs = resolver::resolve_inputs(action, results).ok()?;
    let target = resolver::resolve_target(action, results).ok()?;
    Some(drift::inputs_fingerprint(action, target.as_deref(), &inputs))
}

/// Mutable bookkeeping for one run.
struct RunState<'a> {
    module: &'a Module,
    plan: &'a ExecutionPlan,
    /// Resolved future values, keyed by producing action
    results: HashMap<ActionId, Value>,
    settled: HashMap<ActionId, ActionOutcome>,
    /// Completed entries waiting on dependencies before their input check
    deferred: HashMap<ActionId, JournalEntry>,
}

/// Ready queue ordered by declaration, plus unmet-dependency counts.
#[derive(Default)]
struct Frontier<'a> {
    dependents: HashMap<&'a ActionId, Vec<&'a ActionId>>,
    waiting: HashMap<ActionId, usize>,
    ready: BinaryHeap<Reverse<(u32, ActionId)>>,
}

impl Frontier<'_> {
    /// `id` produced a result; queue dependents with nothing left to wait on.
    fn release(&mut self, module: &Module, id: &ActionId) {
        let Some(next) = self.dependents.get(id) else {
            return;
        };
        for dependent in next {
            let Some(count) = self.waiting.get_mut(*dependent) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.waiting.remove(*dependent);
                if let Some(action) = module.actions.get(*dependent) {
                    self.ready
                        .push(Reverse((action.declared_order, action.id.clone())));
                }
            }
        }
    }
}

/// What the environment reports for a submission whose outcome was lost.
enum Landing {
    Confirmed(Value),
    /// Still pending, or the status could not be read
    Unresolved(String),
    Absent,
}

enum TaskOutcome {
    Completed { result: Value },
    Failed { error: String },
}

type TaskResult = (ActionId, Result<TaskOutcome, JournalError>);

/// Everything one spawned action needs; owns its data so it can be `'static`.
struct ActionTask {
    adapter: Arc<dyn EnvironmentAdapter>,
    journal: Arc<dyn JournalStore>,
    policy: Policy,
    events: EventLog,
    cancel: CancellationToken,
    module: String,
    action: Action,
    inputs: Vec<Value>,
    target: Option<String>,
    fingerprint: String,
    previous: Option<JournalEntry>,
}

impl ActionTask {
    async fn run(self) -> TaskResult {
        let outcome = self.execute().await;
        (self.action.id.clone(), outcome)
    }

    async fn execute(&self) -> Result<TaskOutcome, JournalError> {
        let id = &self.action.id;
        let mut entry = match &self.previous {
            Some(prev) => prev.clone(),
            None => {
                let fresh = JournalEntry::pending(&self.module, id);
                self.journal.put(&self.module, id, &fresh)?;
                fresh
            }
        };
        let submits = self.action.kind() != ActionKind::StaticCall;
        let max_attempts = self.policy.retry.max_attempts.max(1);
        let timeout = Duration::from_millis(self.policy.timeout_ms);
        let mut tries = 0u32;

        loop {
            tries += 1;
            entry.attempts += 1;
            let key = hasher::submission_key(&self.module, id, entry.attempts);
            entry.status = ActionStatus::Executing;
            entry.external_ref = submits.then(|| key.clone());
            entry.error = None;
            self.journal.put(&self.module, id, &entry)?;

            tracing::info!(module = %self.module, action = %id, attempt = entry.attempts, "dispatching");
            self.events.record(ProvenanceEvent::ActionStarted {
                module: self.module.clone(),
                action: id.to_string(),
                attempt: entry.attempts,
            });
            let started = Instant::now();

            let outcome = match tokio::time::timeout(timeout, self.invoke(&key)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ExecutionError::Transient(format!(
                    "timed out after {}ms",
                    self.policy.timeout_ms
                ))),
            };
            let error = match outcome {
                Ok((result, external_ref)) => {
                    let external_ref = external_ref.or_else(|| submits.then(|| key.clone()));
                    return self.complete(entry, result, external_ref, started);
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                return self.record_failure(entry, error.reason().to_string());
            }

            let mut give_up = (tries >= max_attempts).then(|| {
                format!("retries exhausted after {} attempt(s): {}", tries, error.reason())
            });
            if give_up.is_none() {
                let delay = self.policy.retry.delay_for(tries);
                tracing::warn!(
                    action = %id,
                    attempt = entry.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure; retrying"
                );
                self.events.record(ProvenanceEvent::ActionRetrying {
                    module: self.module.clone(),
                    action: id.to_string(),
                    attempt: entry.attempts,
                    delay_ms: delay.as_millis() as u64,
                    reason: error.reason().to_string(),
                });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => {
                        give_up = Some(format!("cancelled after {} attempt(s): {}", tries, error.reason()));
                    }
                }
            }

            // A submission that timed out may still have landed.
            if submits {
                match self.landing(&key, timeout).await {
                    Landing::Confirmed(result) => {
                        tracing::info!(action = %id, "earlier submission confirmed; not resubmitting");
                        return self.complete(entry, result, Some(key), started);
                    }
                    Landing::Unresolved(status) => {
                        // The entry stays Executing so the next run reconciles it.
                        let error = format!("submission {} {}; rerun to reconcile", key, status);
                        tracing::warn!(action = %id, error = %error, "outcome unresolved");
                        return Ok(TaskOutcome::Failed { error });
                    }
                    Landing::Absent => {}
                }
            }
            if let Some(reason) = give_up {
                return self.record_failure(entry, reason);
            }
        }
    }

    async fn landing(&self, key: &str, timeout: Duration) -> Landing {
        match tokio::time::timeout(timeout, self.adapter.get_status(key)).await {
            Ok(Ok(TxStatus::Confirmed { result })) => Landing::Confirmed(result),
            Ok(Ok(TxStatus::Pending)) => Landing::Unresolved("still pending".to_string()),
            Ok(Ok(TxStatus::Reverted { .. } | TxStatus::Unknown)) => Landing::Absent,
            Ok(Err(e)) => Landing::Unresolved(format!("status unknown ({})", e)),
            Err(_) => Landing::Unresolved("status query timed out".to_string()),
        }
    }

    async fn invoke(&self, key: &str) -> Result<(Value, Option<String>), ExecutionError> {
        let target = || {
            self.target
                .as_deref()
                .ok_or_else(|| ExecutionError::Permanent("call target has no address".to_string()))
        };
        match &self.action.operation {
            Operation::Deploy { artifact } => {
                let receipt = self.adapter.deploy(key, artifact, &self.inputs).await?;
                Ok((Value::Address(receipt.address), Some(receipt.external_ref)))
            }
            Operation::Call { method, .. } => {
                let receipt = self.adapter.call(key, target()?, method, &self.inputs).await?;
                Ok((receipt.value, Some(receipt.external_ref)))
            }
            Operation::StaticCall { method, .. } => {
                let value = self.adapter.static_call(target()?, method, &self.inputs).await?;
                Ok((value, None))
            }
            Operation::ReadParameter { parameter } => Err(ExecutionError::Permanent(format!(
                "parameter '{}' is bound locally",
                parameter
            ))),
        }
    }

    fn complete(
        &self,
        mut entry: JournalEntry,
        result: Value,
        external_ref: Option<String>,
        started: Instant,
    ) -> Result<TaskOutcome, JournalError> {
        entry.status = ActionStatus::Completed;
        entry.result = Some(result.clone());
        entry.external_ref = external_ref.clone();
        entry.inputs_hash = Some(self.fingerprint.clone());
        entry.error = None;
        self.journal.put(&self.module, &self.action.id, &entry)?;

        tracing::info!(module = %self.module, action = %self.action.id, result = %result, "completed");
        self.events.record(ProvenanceEvent::ActionCompleted {
            module: self.module.clone(),
            action: self.action.id.to_string(),
            duration_seconds: started.elapsed().as_secs_f64(),
            external_ref,
            inputs_hash: self.fingerprint.clone(),
        });
        Ok(TaskOutcome::Completed { result })
    }

    fn record_failure(
        &self,
        mut entry: JournalEntry,
        error: String,
    ) -> Result<TaskOutcome, JournalError> {
        entry.status = ActionStatus::Failed;
        entry.error = Some(error.clone());
        self.journal.put(&self.module, &self.action.id, &entry)?;
        Ok(TaskOutcome::Failed { error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::{ActionOptions, ModuleBuilder};
    use crate::core::error::{BuildError, DriftError};
    use crate::core::journal::{FileJournal, MemoryJournal};
    use crate::env::local::LocalChain;
    use crate::env::{CallReceipt, DeployReceipt};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// LocalChain with scripted failures, latency and a concurrency gauge.
    #[derive(Default)]
    struct ScriptedEnv {
        chain: LocalChain,
        permanent: Mutex<HashSet<String>>,
        transient: Mutex<HashMap<String, u32>>,
        hang: HashSet<String>,
        /// Deployments that land but whose receipt never arrives
        lost_receipts: Mutex<HashMap<String, u32>>,
        statuses: Mutex<HashMap<String, TxStatus>>,
        delay: Duration,
        cancel_on: Option<(String, CancellationToken)>,
        attempts: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedEnv {
        fn failing(self, name: &str) -> Self {
            self.permanent.lock().unwrap().insert(name.to_string());
            self
        }

        fn flaky(self, name: &str, times: u32) -> Self {
            self.transient.lock().unwrap().insert(name.to_string(), times);
            self
        }

        fn losing_receipt(self, name: &str, times: u32) -> Self {
            self.lost_receipts
                .lock()
                .unwrap()
                .insert(name.to_string(), times);
            self
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        async fn enter(&self, name: &str) -> Result<(), ExecutionError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang.contains(name) {
                std::future::pending::<()>().await;
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some((trigger, token)) = &self.cancel_on {
                if trigger == name {
                    token.cancel();
                }
            }
            if self.permanent.lock().unwrap().contains(name) {
                return Err(ExecutionError::Permanent("execution reverted".to_string()));
            }
            let mut transient = self.transient.lock().unwrap();
            if let Some(left) = transient.get_mut(name) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ExecutionError::Transient("connection reset".to_string()));
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EnvironmentAdapter for ScriptedEnv {
        async fn deploy(
            &self,
            key: &str,
            artifact: &str,
            args: &[Value],
        ) -> Result<DeployReceipt, ExecutionError> {
            self.enter(artifact).await?;
            let receipt = self.chain.deploy(key, artifact, args).await?;
            let lost = match self.lost_receipts.lock().unwrap().get_mut(artifact) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            if lost {
                std::future::pending::<()>().await;
            }
            Ok(receipt)
        }

        async fn call(
            &self,
            key: &str,
            address: &str,
            method: &str,
            args: &[Value],
        ) -> Result<CallReceipt, ExecutionError> {
            self.enter(method).await?;
            self.chain.call(key, address, method, args).await
        }

        async fn static_call(
            &self,
            address: &str,
            method: &str,
            args: &[Value],
        ) -> Result<Value, ExecutionError> {
            self.enter(method).await?;
            self.chain.static_call(address, method, args).await
        }

        async fn get_status(&self, external_ref: &str) -> Result<TxStatus, ExecutionError> {
            let scripted = self.statuses.lock().unwrap().get(external_ref).cloned();
            match scripted {
                Some(status) => Ok(status),
                None => self.chain.get_status(external_ref).await,
            }
        }
    }

    /// Journal whose writes always fail.
    struct BrokenJournal;

    impl JournalStore for BrokenJournal {
        fn get(&self, _: &str, _: &ActionId) -> Result<Option<JournalEntry>, JournalError> {
            Ok(None)
        }
        fn put(&self, _: &str, _: &ActionId, _: &JournalEntry) -> Result<(), JournalError> {
            Err(JournalError::IoFailure {
                path: "/state".to_string(),
                reason: "disk full".to_string(),
            })
        }
        fn reset(&self, _: &str, _: &ActionId) -> Result<Option<JournalEntry>, JournalError> {
            Ok(None)
        }
        fn load(&self, _: &str) -> Result<HashMap<ActionId, JournalEntry>, JournalError> {
            Ok(HashMap::new())
        }
    }

    fn fast_policy(max_in_flight: usize) -> Policy {
        Policy {
            max_in_flight,
            timeout_ms: 2_000,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                backoff_multiplier: 2.0,
                max_delay_ms: 5,
            },
            tripwire: false,
        }
    }

    fn executor(env: &Arc<ScriptedEnv>, journal: &Arc<MemoryJournal>, policy: Policy) -> Executor {
        Executor::new(env.clone(), journal.clone()).with_policy(policy)
    }

    fn deploy_id(name: &str) -> ActionId {
        ActionId::derive("M", name, ActionKind::Deploy)
    }

    fn no_overrides() -> HashMap<String, Value> {
        HashMap::new()
    }

    /// initialSupply = "1000"; X = contract([param]); Y = contract([]); Z = contract([X, Y])
    fn xyz() -> Module {
        let mut m = ModuleBuilder::new("M");
        let supply = m.get_parameter("initialSupply", Some(Value::from("1000")));
        let x = m
            .contract("X", vec![supply.into()], ActionOptions::default())
            .unwrap();
        let y = m.contract("Y", vec![], ActionOptions::default()).unwrap();
        let z = m
            .contract("Z", vec![x.into(), y.into()], ActionOptions::default())
            .unwrap();
        m.export("z", &z).unwrap();
        m.build().unwrap()
    }

    /// A and B independent; C depends on both.
    fn fan_in() -> Module {
        let mut m = ModuleBuilder::new("M");
        let a = m.contract("A", vec![], ActionOptions::default()).unwrap();
        let b = m.contract("B", vec![], ActionOptions::default()).unwrap();
        m.contract("C", vec![a.into(), b.into()], ActionOptions::default())
            .unwrap();
        m.build().unwrap()
    }

    fn address_of(report: &RunReport, name: &str) -> String {
        match report.outcome(&deploy_id(name)) {
            Some(ActionOutcome::Completed {
                result: Value::Address(a),
                ..
            }) => a.clone(),
            other => panic!("{} not completed: {:?}", name, other),
        }
    }

    #[tokio::test]
    async fn test_ig012_xyz_scenario() {
        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        let report = executor(&env, &journal, fast_policy(2))
            .run(&xyz(), &no_overrides())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(env.attempts(), 3);
        let (x, y, z) = (
            address_of(&report, "X"),
            address_of(&report, "Y"),
            address_of(&report, "Z"),
        );
        assert_eq!(
            env.chain.deployment_args(&z).unwrap(),
            vec![Value::Address(x.clone()), Value::Address(y)]
        );
        assert_eq!(
            env.chain.deployment_args(&x).unwrap(),
            vec![Value::String("1000".into())]
        );
        assert_eq!(report.exports["z"], Value::Address(z));

        let entry = journal.get("M", &deploy_id("Z")).unwrap().unwrap();
        assert_eq!(entry.status, ActionStatus::Completed);
        assert_eq!(entry.attempts, 1);
        assert!(entry.external_ref.is_some());
        assert!(entry.inputs_hash.is_some());
    }

    #[tokio::test]
    async fn test_ig012_rerun_makes_no_calls() {
        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        let exec = executor(&env, &journal, fast_policy(2));
        let first = exec.run(&xyz(), &no_overrides()).await.unwrap();
        let calls = env.attempts();

        let second = exec.run(&xyz(), &no_overrides()).await.unwrap();
        assert_eq!(env.attempts(), calls);
        assert_eq!(second.exports, first.exports);
        assert!(matches!(
            second.outcome(&deploy_id("Z")),
            Some(ActionOutcome::Completed { reused: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_ig012_resume_retries_only_failed() {
        let env = Arc::new(ScriptedEnv::default().failing("C"));
        let journal = Arc::new(MemoryJournal::new());
        let exec = executor(&env, &journal, fast_policy(2));

        let report = exec.run(&fan_in(), &no_overrides()).await.unwrap();
        assert_eq!(report.completed(), 2);
        assert!(matches!(
            report.outcome(&deploy_id("C")),
            Some(ActionOutcome::Failed { .. })
        ));
        assert_eq!(
            journal.get("M", &deploy_id("C")).unwrap().unwrap().status,
            ActionStatus::Failed
        );

        env.permanent.lock().unwrap().clear();
        let before = env.attempts();
        let report = exec.run(&fan_in(), &no_overrides()).await.unwrap();
        assert_eq!(env.attempts() - before, 1);
        assert!(report.is_success());
        assert_eq!(journal.get("M", &deploy_id("C")).unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_ig012_failure_skips_dependents_only() {
        let mut m = ModuleBuilder::new("M");
        let a = m.contract("A", vec![], ActionOptions::default()).unwrap();
        let b = m
            .contract("B", vec![a.into()], ActionOptions::default())
            .unwrap();
        m.contract("C", vec![b.into()], ActionOptions::default())
            .unwrap();
        m.contract("D", vec![], ActionOptions::default()).unwrap();
        let module = m.build().unwrap();

        let env = Arc::new(ScriptedEnv::default().failing("A"));
        let journal = Arc::new(MemoryJournal::new());
        let report = executor(&env, &journal, fast_policy(1))
            .run(&module, &no_overrides())
            .await
            .unwrap();

        assert_eq!(
            report.outcome(&deploy_id("B")),
            Some(&ActionOutcome::Skipped {
                reason: SkipReason::DependencyFailed(deploy_id("A"))
            })
        );
        assert!(report.outcome(&deploy_id("C")).unwrap().is_skipped());
        assert!(report.outcome(&deploy_id("D")).unwrap().is_completed());
        // Skipped actions are never journaled
        assert!(journal.get("M", &deploy_id("B")).unwrap().is_none());
        assert_eq!(env.attempts(), 2);
    }

    #[tokio::test]
    async fn test_ig012_transient_then_success() {
        let env = Arc::new(ScriptedEnv::default().flaky("Y", 2));
        let journal = Arc::new(MemoryJournal::new());
        let report = executor(&env, &journal, fast_policy(1))
            .run(&xyz(), &no_overrides())
            .await
            .unwrap();
        assert!(report.is_success());
        let entry = journal.get("M", &deploy_id("Y")).unwrap().unwrap();
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn test_ig012_retries_exhausted_is_permanent() {
        let mut m = ModuleBuilder::new("M");
        m.contract("Only", vec![], ActionOptions::default()).unwrap();
        let env = Arc::new(ScriptedEnv::default().flaky("Only", 10));
        let journal = Arc::new(MemoryJournal::new());
        let err = executor(&env, &journal, fast_policy(1))
            .run(&m.build().unwrap(), &no_overrides())
            .await
            .unwrap_err();

        match err {
            EngineError::AllActionsFailed { failed, report } => {
                assert_eq!(failed, 1);
                match report.outcome(&deploy_id("Only")) {
                    Some(ActionOutcome::Failed { error }) => {
                        assert!(error.contains("retries exhausted after 3"))
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(env.attempts(), 3);
        let entry = journal.get("M", &deploy_id("Only")).unwrap().unwrap();
        assert_eq!(entry.status, ActionStatus::Failed);
    }

    #[tokio::test]
    async fn test_ig012_timeout_is_transient() {
        let mut m = ModuleBuilder::new("M");
        m.contract("Slow", vec![], ActionOptions::default()).unwrap();
        m.contract("Fast", vec![], ActionOptions::default()).unwrap();
        let env = Arc::new(ScriptedEnv {
            hang: HashSet::from(["Slow".to_string()]),
            ..ScriptedEnv::default()
        });
        let journal = Arc::new(MemoryJournal::new());
        let mut policy = fast_policy(2);
        policy.timeout_ms = 20;
        policy.retry.max_attempts = 2;

        let report = executor(&env, &journal, policy)
            .run(&m.build().unwrap(), &no_overrides())
            .await
            .unwrap();
        match report.outcome(&deploy_id("Slow")) {
            Some(ActionOutcome::Failed { error }) => assert!(error.contains("timed out after 20ms")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(report.outcome(&deploy_id("Fast")).unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_ig012_missing_parameter_before_any_call() {
        let mut m = ModuleBuilder::new("M");
        let p = m.get_parameter_typed("owner", ParamType::Address, None);
        m.contract("T", vec![p.into()], ActionOptions::default())
            .unwrap();
        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        let err = executor(&env, &journal, fast_policy(1))
            .run(&m.build().unwrap(), &no_overrides())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Resolution(ResolutionError::MissingParameter { .. })
        ));
        assert_eq!(env.attempts(), 0);
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn test_ig012_cycle_before_any_call() {
        let mut m = ModuleBuilder::new("M");
        let b_ref = m.reference("B", ActionKind::Deploy);
        let a = m
            .contract("A", vec![b_ref.into()], ActionOptions::default())
            .unwrap();
        m.contract("B", vec![a.into()], ActionOptions::default())
            .unwrap();
        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        let err = executor(&env, &journal, fast_policy(1))
            .run(&m.build().unwrap(), &no_overrides())
            .await
            .unwrap_err();
        match err {
            EngineError::Build(BuildError::Cycle { path }) => {
                assert_eq!(path, vec![deploy_id("A"), deploy_id("B"), deploy_id("A")])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(env.attempts(), 0);
        assert!(journal.is_empty());
    }

    fn executing_entry(name: &str, external_ref: Option<&str>) -> JournalEntry {
        let mut entry = JournalEntry::pending("M", &deploy_id(name));
        entry.status = ActionStatus::Executing;
        entry.attempts = 1;
        entry.external_ref = external_ref.map(str::to_string);
        entry
    }

    #[tokio::test]
    async fn test_ig012_reconcile_confirmed_does_not_redeploy() {
        let env = Arc::new(ScriptedEnv::default());
        // The earlier run's submission landed before the crash
        let landed = env.chain.deploy("sub-landed", "A", &[]).await.unwrap();
        let journal = Arc::new(MemoryJournal::new());
        journal
            .put("M", &deploy_id("A"), &executing_entry("A", Some("sub-landed")))
            .unwrap();

        let report = executor(&env, &journal, fast_policy(2))
            .run(&fan_in(), &no_overrides())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(address_of(&report, "A"), landed.address);
        // Only B and C were submitted
        assert_eq!(env.attempts(), 2);
        let entry = journal.get("M", &deploy_id("A")).unwrap().unwrap();
        assert_eq!(entry.status, ActionStatus::Completed);
        assert_eq!(entry.result, Some(Value::Address(landed.address)));
    }

    #[tokio::test]
    async fn test_ig012_reconcile_reverted_redispatches() {
        let env = Arc::new(ScriptedEnv::default());
        env.statuses.lock().unwrap().insert(
            "sub-lost".to_string(),
            TxStatus::Reverted {
                reason: "nonce too low".to_string(),
            },
        );
        let journal = Arc::new(MemoryJournal::new());
        journal
            .put("M", &deploy_id("A"), &executing_entry("A", Some("sub-lost")))
            .unwrap();
        journal
            .put("M", &deploy_id("B"), &executing_entry("B", None))
            .unwrap();

        let report = executor(&env, &journal, fast_policy(2))
            .run(&fan_in(), &no_overrides())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(env.attempts(), 3);
        let entry = journal.get("M", &deploy_id("A")).unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn test_ig012_reconcile_pending_left_executing() {
        let mut m = ModuleBuilder::new("M");
        let a = m.contract("A", vec![], ActionOptions::default()).unwrap();
        m.contract("B", vec![a.into()], ActionOptions::default())
            .unwrap();
        m.contract("C", vec![], ActionOptions::default()).unwrap();
        let module = m.build().unwrap();

        let env = Arc::new(ScriptedEnv::default());
        env.statuses
            .lock()
            .unwrap()
            .insert("sub-mempool".to_string(), TxStatus::Pending);
        let journal = Arc::new(MemoryJournal::new());
        journal
            .put("M", &deploy_id("A"), &executing_entry("A", Some("sub-mempool")))
            .unwrap();

        let report = executor(&env, &journal, fast_policy(2))
            .run(&module, &no_overrides())
            .await
            .unwrap();
        assert!(report.outcome(&deploy_id("A")).unwrap().is_failed());
        assert!(report.outcome(&deploy_id("B")).unwrap().is_skipped());
        assert!(report.outcome(&deploy_id("C")).unwrap().is_completed());
        assert_eq!(env.attempts(), 1);
        assert_eq!(
            journal.get("M", &deploy_id("A")).unwrap().unwrap().status,
            ActionStatus::Executing
        );
    }

    #[tokio::test]
    async fn test_ig012_input_drift_detected() {
        let mut m = ModuleBuilder::new("M");
        let supply = m.get_parameter("supply", Some(Value::Uint(1000)));
        m.contract("Token", vec![supply.into()], ActionOptions::default())
            .unwrap();
        let module = m.build().unwrap();

        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        let exec = executor(&env, &journal, fast_policy(1));
        exec.run(&module, &no_overrides()).await.unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("supply".to_string(), Value::Uint(2000));
        let err = exec.run(&module, &overrides).await.unwrap_err();
        match err {
            EngineError::Drift(DriftError::InputsChanged { action, .. }) => {
                assert_eq!(action, deploy_id("Token"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(env.attempts(), 1);

        // After an operator reset the new supply is deployed
        journal.reset("M", &deploy_id("Token")).unwrap();
        let report = exec.run(&module, &overrides).await.unwrap();
        assert!(report.is_success());
        assert_eq!(env.attempts(), 2);
    }

    #[tokio::test]
    async fn test_ig012_cancelled_before_start() {
        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        let exec = executor(&env, &journal, fast_policy(2));
        exec.cancellation_token().cancel();

        let report = exec.run(&xyz(), &no_overrides()).await.unwrap();
        assert_eq!(env.attempts(), 0);
        assert_eq!(report.skipped(), 3);
        assert_eq!(
            report.outcome(&deploy_id("X")),
            Some(&ActionOutcome::Skipped {
                reason: SkipReason::Cancelled
            })
        );
        assert!(report.exports.is_empty());
    }

    #[tokio::test]
    async fn test_ig012_cancel_stops_new_dispatch() {
        let token = CancellationToken::new();
        let env = Arc::new(ScriptedEnv {
            cancel_on: Some(("A".to_string(), token.clone())),
            ..ScriptedEnv::default()
        });
        let journal = Arc::new(MemoryJournal::new());
        let mut m = ModuleBuilder::new("M");
        m.contract("A", vec![], ActionOptions::default()).unwrap();
        m.contract("B", vec![], ActionOptions::default()).unwrap();

        let report = executor(&env, &journal, fast_policy(1))
            .with_cancellation(token)
            .run(&m.build().unwrap(), &no_overrides())
            .await
            .unwrap();
        // In-flight A finishes; B is never dispatched
        assert!(report.outcome(&deploy_id("A")).unwrap().is_completed());
        assert_eq!(
            report.outcome(&deploy_id("B")),
            Some(&ActionOutcome::Skipped {
                reason: SkipReason::Cancelled
            })
        );
        assert!(journal.get("M", &deploy_id("B")).unwrap().is_none());
    }

    fn independent(n: usize) -> Module {
        let mut m = ModuleBuilder::new("M");
        for i in 0..n {
            m.contract(&format!("C{}", i), vec![], ActionOptions::default())
                .unwrap();
        }
        m.build().unwrap()
    }

    #[tokio::test]
    async fn test_ig012_max_in_flight_bound() {
        for (limit, expected) in [(2usize, 2usize), (1, 1)] {
            let env = Arc::new(ScriptedEnv {
                delay: Duration::from_millis(20),
                ..ScriptedEnv::default()
            });
            let journal = Arc::new(MemoryJournal::new());
            let report = executor(&env, &journal, fast_policy(limit))
                .run(&independent(4), &no_overrides())
                .await
                .unwrap();
            assert_eq!(report.completed(), 4);
            assert_eq!(env.peak.load(Ordering::SeqCst), expected);
        }
    }

    #[tokio::test]
    async fn test_ig012_journal_failure_is_fatal() {
        let env = Arc::new(ScriptedEnv::default());
        let exec = Executor::new(env.clone(), Arc::new(BrokenJournal)).with_policy(fast_policy(2));
        let err = exec.run(&fan_in(), &no_overrides()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Journal(JournalError::IoFailure { .. })
        ));
        assert_eq!(env.attempts(), 0);
    }

    #[tokio::test]
    async fn test_ig012_call_and_static_call() {
        let mut m = ModuleBuilder::new("M");
        let oracle = m.contract("Oracle", vec![], ActionOptions::default()).unwrap();
        let vault = m.contract("Vault", vec![], ActionOptions::default()).unwrap();
        let set = m
            .call(&vault, "oracle", vec![(&oracle).into()], ActionOptions::default())
            .unwrap();
        let read = m
            .static_call(
                &vault,
                "oracle",
                vec![],
                ActionOptions {
                    id: Some("readOracle".into()),
                    after: vec![set.clone()],
                },
            )
            .unwrap();
        m.export("configured", &read).unwrap();
        let module = m.build().unwrap();

        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        let report = executor(&env, &journal, fast_policy(2))
            .run(&module, &no_overrides())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(
            report.exports["configured"],
            Value::Address(address_of(&report, "Oracle"))
        );
        let read_entry = journal.get("M", &read.producer).unwrap().unwrap();
        assert_eq!(read_entry.status, ActionStatus::Completed);
        assert!(read_entry.external_ref.is_none());
        let set_entry = journal.get("M", &set.producer).unwrap().unwrap();
        assert!(set_entry.external_ref.is_some());
    }

    #[tokio::test]
    async fn test_ig012_parameters_never_journaled() {
        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        executor(&env, &journal, fast_policy(2))
            .run(&xyz(), &no_overrides())
            .await
            .unwrap();
        let param = ActionId::derive("M", "initialSupply", ActionKind::ReadParameter);
        assert!(journal.get("M", &param).unwrap().is_none());
        assert_eq!(journal.len(), 3);
    }

    #[tokio::test]
    async fn test_ig012_event_log_and_file_journal() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(FileJournal::new(dir.path()));
        let exec = Executor::new(env.clone(), journal.clone())
            .with_policy(fast_policy(2))
            .with_event_log(EventLog::new(dir.path(), "M"));
        exec.run(&xyz(), &no_overrides()).await.unwrap();

        let log = std::fs::read_to_string(dir.path().join("M/events.jsonl")).unwrap();
        assert!(log.contains("\"run_started\""));
        assert_eq!(log.matches("\"action_completed\"").count(), 3);
        assert!(log.lines().last().unwrap().contains("\"run_completed\""));
        assert_eq!(journal.load("M").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_ig012_landed_submission_not_redeployed_after_timeout() {
        let mut m = ModuleBuilder::new("M");
        m.contract("Token", vec![], ActionOptions::default()).unwrap();
        m.contract("Other", vec![], ActionOptions::default()).unwrap();
        let module = m.build().unwrap();

        let env = Arc::new(ScriptedEnv::default().losing_receipt("Token", 1));
        let journal = Arc::new(MemoryJournal::new());
        let mut policy = fast_policy(2);
        policy.timeout_ms = 20;
        policy.retry.max_attempts = 1;
        let exec = executor(&env, &journal, policy);

        let first = exec.run(&module, &no_overrides()).await.unwrap();
        assert!(first.is_success());
        assert!(matches!(
            first.outcome(&deploy_id("Token")),
            Some(ActionOutcome::Completed { reused: false, .. })
        ));
        let entry = journal.get("M", &deploy_id("Token")).unwrap().unwrap();
        assert_eq!(entry.status, ActionStatus::Completed);
        assert_eq!(entry.attempts, 1);

        let second = exec.run(&module, &no_overrides()).await.unwrap();
        assert!(matches!(
            second.outcome(&deploy_id("Token")),
            Some(ActionOutcome::Completed { reused: true, .. })
        ));
        assert_eq!(env.chain.contract_count(), 2);
        assert_eq!(env.attempts(), 2);
    }

    #[tokio::test]
    async fn test_ig012_retry_confirms_earlier_submission() {
        let mut m = ModuleBuilder::new("M");
        m.contract("Token", vec![], ActionOptions::default()).unwrap();
        let env = Arc::new(ScriptedEnv::default().losing_receipt("Token", 1));
        let journal = Arc::new(MemoryJournal::new());
        let mut policy = fast_policy(1);
        policy.timeout_ms = 20;

        let report = executor(&env, &journal, policy)
            .run(&m.build().unwrap(), &no_overrides())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(env.attempts(), 1);
        assert_eq!(env.chain.contract_count(), 1);
        let entry = journal.get("M", &deploy_id("Token")).unwrap().unwrap();
        assert_eq!(entry.status, ActionStatus::Completed);
        assert_eq!(entry.attempts, 1);
        assert_eq!(
            entry.external_ref,
            Some(hasher::submission_key("M", &deploy_id("Token"), 1))
        );
    }

    #[tokio::test]
    async fn test_ig012_pending_submission_not_resubmitted() {
        let mut m = ModuleBuilder::new("M");
        m.contract("Only", vec![], ActionOptions::default()).unwrap();
        let env = Arc::new(ScriptedEnv::default().flaky("Only", 1));
        let key = hasher::submission_key("M", &deploy_id("Only"), 1);
        env.statuses
            .lock()
            .unwrap()
            .insert(key.clone(), TxStatus::Pending);
        let journal = Arc::new(MemoryJournal::new());

        let err = executor(&env, &journal, fast_policy(1))
            .run(&m.build().unwrap(), &no_overrides())
            .await
            .unwrap_err();
        match err {
            EngineError::AllActionsFailed { report, .. } => {
                match report.outcome(&deploy_id("Only")) {
                    Some(ActionOutcome::Failed { error }) => assert!(error.contains("still pending")),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(env.attempts(), 1);
        let entry = journal.get("M", &deploy_id("Only")).unwrap().unwrap();
        assert_eq!(entry.status, ActionStatus::Executing);
        assert_eq!(entry.external_ref, Some(key));
    }

    #[tokio::test]
    async fn test_ig012_cancel_during_backoff_records_failed() {
        let token = CancellationToken::new();
        let env = Arc::new(
            ScriptedEnv {
                cancel_on: Some(("Only".to_string(), token.clone())),
                ..ScriptedEnv::default()
            }
            .flaky("Only", 10),
        );
        let journal = Arc::new(MemoryJournal::new());
        let mut policy = fast_policy(1);
        policy.retry.base_delay_ms = 60_000;
        policy.retry.max_delay_ms = 60_000;
        let mut m = ModuleBuilder::new("M");
        m.contract("Only", vec![], ActionOptions::default()).unwrap();

        let err = executor(&env, &journal, policy)
            .with_cancellation(token)
            .run(&m.build().unwrap(), &no_overrides())
            .await
            .unwrap_err();
        match err {
            EngineError::AllActionsFailed { report, .. } => {
                match report.outcome(&deploy_id("Only")) {
                    Some(ActionOutcome::Failed { error }) => {
                        assert!(error.contains("cancelled after 1 attempt(s)"), "{}", error)
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(env.attempts(), 1);
        let entry = journal.get("M", &deploy_id("Only")).unwrap().unwrap();
        assert_eq!(entry.status, ActionStatus::Failed);
    }

    #[tokio::test]
    async fn test_ig012_upstream_reset_checks_dependent_inputs() {
        let mut m = ModuleBuilder::new("M");
        let token = m.contract("Token", vec![], ActionOptions::default()).unwrap();
        m.contract("Vault", vec![token.into()], ActionOptions::default())
            .unwrap();
        let module = m.build().unwrap();

        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        let exec = executor(&env, &journal, fast_policy(1));
        let first = exec.run(&module, &no_overrides()).await.unwrap();
        let old_vault = address_of(&first, "Vault");

        journal.reset("M", &deploy_id("Token")).unwrap();
        let second = exec.run(&module, &no_overrides()).await.unwrap();
        assert!(second.outcome(&deploy_id("Token")).unwrap().is_completed());
        match second.outcome(&deploy_id("Vault")) {
            Some(ActionOutcome::Failed { error }) => {
                assert!(error.contains("inputs of completed action M#Vault changed"), "{}", error)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!second.is_success());
        // The stale vault stays recorded until the operator resets it
        let entry = journal.get("M", &deploy_id("Vault")).unwrap().unwrap();
        assert_eq!(entry.status, ActionStatus::Completed);
        assert_eq!(entry.result, Some(Value::Address(old_vault)));

        journal.reset("M", &deploy_id("Vault")).unwrap();
        let third = exec.run(&module, &no_overrides()).await.unwrap();
        assert!(third.is_success());
        assert_eq!(
            env.chain
                .deployment_args(&address_of(&third, "Vault"))
                .unwrap(),
            vec![Value::Address(address_of(&third, "Token"))]
        );
    }

    #[tokio::test]
    async fn test_ig012_deferred_check_reuses_unchanged_inputs() {
        let mut m = ModuleBuilder::new("M");
        let token = m.contract("Token", vec![], ActionOptions::default()).unwrap();
        let owner = m
            .static_call(&token, "owner", vec![], ActionOptions::default())
            .unwrap();
        m.contract("Vault", vec![(&owner).into()], ActionOptions::default())
            .unwrap();
        let module = m.build().unwrap();

        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        let exec = executor(&env, &journal, fast_policy(1));
        exec.run(&module, &no_overrides()).await.unwrap();
        assert_eq!(env.attempts(), 3);

        // The read runs again and yields the same value, so Vault is kept
        journal.reset("M", &owner.producer).unwrap();
        let report = exec.run(&module, &no_overrides()).await.unwrap();
        assert!(report.is_success());
        assert!(matches!(
            report.outcome(&owner.producer),
            Some(ActionOutcome::Completed { reused: false, .. })
        ));
        assert!(matches!(
            report.outcome(&deploy_id("Vault")),
            Some(ActionOutcome::Completed { reused: true, .. })
        ));
        assert_eq!(env.attempts(), 4);
    }

    #[tokio::test]
    async fn test_ig012_nested_module_keys() {
        let mut sub = ModuleBuilder::new("Token");
        let supply = sub.get_parameter("supply", None);
        let erc20 = sub
            .contract("ERC20", vec![supply.into()], ActionOptions::default())
            .unwrap();
        sub.export("token", &erc20).unwrap();

        let mut root = ModuleBuilder::new("Root");
        let handle = root.use_module(sub.build().unwrap()).unwrap();
        let token = handle.export("token").unwrap().clone();
        root.contract("Vault", vec![token.into()], ActionOptions::default())
            .unwrap();
        let module = root.build().unwrap();

        let env = Arc::new(ScriptedEnv::default());
        let journal = Arc::new(MemoryJournal::new());
        let mut overrides = HashMap::new();
        overrides.insert("Token.supply".to_string(), Value::from("42"));
        let report = executor(&env, &journal, fast_policy(1))
            .run(&module, &overrides)
            .await
            .unwrap();
        assert!(report.is_success());

        let entries = journal.load("Root").unwrap();
        assert!(entries.contains_key(&ActionId::derive("Token", "ERC20", ActionKind::Deploy)));
        assert!(entries.contains_key(&ActionId::derive("Root", "Vault", ActionKind::Deploy)));
        assert!(journal.load("Token").unwrap().is_empty());
    }
}

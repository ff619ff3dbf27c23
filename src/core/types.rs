//! IG-001: All types of the deployment model.
//!
//! Defines the YAML description schema, the action/future graph, journal
//! entries, plans, run reports and provenance events. Persisted types derive
//! Serialize/Deserialize for YAML and JSON roundtripping.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Top-level ignis.yaml
// ============================================================================

/// Root description: the desired deployment of one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Description {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Module name; the root of every action id
    pub module: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Declared parameters (order-preserving)
    #[serde(default)]
    pub parameters: IndexMap<String, ParameterSpec>,

    /// Action declarations (order-preserving; order is the declared order)
    #[serde(default)]
    pub actions: IndexMap<String, ActionSpec>,

    /// Names of actions whose results are returned by a run
    #[serde(default)]
    pub exports: Vec<String>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,
}

/// A parameter as written in the description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Expected type; inferred from the default when absent
    #[serde(rename = "type", default)]
    pub param_type: Option<ParamType>,

    /// Default value used when no override is supplied
    #[serde(default)]
    pub default: Option<serde_yaml_ng::Value>,
}

/// An action as written in the description. Exactly one of
/// `contract`, `call` or `static_call` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Artifact to deploy
    #[serde(default)]
    pub contract: Option<String>,

    /// Method to invoke with a submitted transaction
    #[serde(default)]
    pub call: Option<String>,

    /// Method to read without submission
    #[serde(default)]
    pub static_call: Option<String>,

    /// Target action for call/static_call
    #[serde(default)]
    pub on: Option<String>,

    /// Positional arguments: literals or `{{ref}}` templates
    #[serde(default)]
    pub args: Vec<serde_yaml_ng::Value>,

    /// Extra ordering dependencies (action names)
    #[serde(default)]
    pub after: Vec<String>,
}

// ============================================================================
// Values
// ============================================================================

/// A concrete value: a literal, a resolved parameter or an action result.
///
/// 128-bit numbers are carried as decimal strings so they survive YAML and
/// JSON unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Uint(#[serde(with = "decimal")] u128),
    Int(#[serde(with = "decimal")] i128),
    Bool(bool),
    Address(String),
    String(String),
    Unit,
}

impl Value {
    /// The parameter type this value satisfies without coercion.
    pub fn param_type(&self) -> Option<ParamType> {
        match self {
            Self::Uint(_) => Some(ParamType::Uint),
            Self::Int(_) => Some(ParamType::Int),
            Self::Bool(_) => Some(ParamType::Bool),
            Self::Address(_) => Some(ParamType::Address),
            Self::String(_) => Some(ParamType::String),
            Self::Unit => None,
        }
    }

    /// Short type label for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Uint(_) => "uint",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Address(_) => "address",
            Self::String(_) => "string",
            Self::Unit => "unit",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint(n) => write!(f, "{}", n),
            Self::Int(n) => write!(f, "{}", n),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Address(a) => write!(f, "{}", a),
            Self::String(s) => write!(f, "{:?}", s),
            Self::Unit => write!(f, "()"),
        }
    }
}

impl From<u128> for Value {
    fn from(n: u128) -> Self {
        Self::Uint(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Uint(u128::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Serde helper: integers as decimal strings.
mod decimal {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T: Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(d: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Declared parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Uint,
    Int,
    Bool,
    Address,
    String,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint => write!(f, "uint"),
            Self::Int => write!(f, "int"),
            Self::Bool => write!(f, "bool"),
            Self::Address => write!(f, "address"),
            Self::String => write!(f, "string"),
        }
    }
}

// ============================================================================
// Actions and futures
// ============================================================================

/// Kind of work an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Deploy,
    Call,
    StaticCall,
    ReadParameter,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploy => write!(f, "deploy"),
            Self::Call => write!(f, "call"),
            Self::StaticCall => write!(f, "static_call"),
            Self::ReadParameter => write!(f, "read_parameter"),
        }
    }
}

/// Stable action identifier, derived from `(module, name, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Derive the id of an action. The same inputs always give the same id.
    pub fn derive(module: &str, name: &str, kind: ActionKind) -> Self {
        match kind {
            ActionKind::Deploy => Self(format!("{}#{}", module, name)),
            ActionKind::Call => Self(format!("{}#call:{}", module, name)),
            ActionKind::StaticCall => Self(format!("{}#static:{}", module, name)),
            ActionKind::ReadParameter => Self(format!("{}#param:{}", module, name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The module that declared this action (text before `#`).
    pub fn module(&self) -> &str {
        self.0.split_once('#').map(|(m, _)| m).unwrap_or(&self.0)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type of value a future will carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FutureType {
    Address,
    Value,
}

/// A symbolic placeholder for an action's not-yet-produced result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Future {
    /// Future id (same text as the producing action id)
    pub id: String,

    /// Value type carried once resolved
    pub future_type: FutureType,

    /// Action whose completion resolves this future
    pub producer: ActionId,

    /// Declared name of the producing action
    pub name: String,

    /// Module (builder) the future was created in
    pub module: String,
}

/// One positional input of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Literal(Value),
    Future(Future),
}

impl Input {
    pub fn future(&self) -> Option<&Future> {
        match self {
            Self::Future(f) => Some(f),
            Self::Literal(_) => None,
        }
    }
}

impl From<Value> for Input {
    fn from(v: Value) -> Self {
        Self::Literal(v)
    }
}

impl From<Future> for Input {
    fn from(f: Future) -> Self {
        Self::Future(f)
    }
}

impl From<&Future> for Input {
    fn from(f: &Future) -> Self {
        Self::Future(f.clone())
    }
}

impl From<&str> for Input {
    fn from(s: &str) -> Self {
        Self::Literal(Value::from(s))
    }
}

impl From<u64> for Input {
    fn from(n: u64) -> Self {
        Self::Literal(Value::from(n))
    }
}

/// What an action does, with its kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Deploy { artifact: String },
    Call { target: Future, method: String },
    StaticCall { target: Future, method: String },
    ReadParameter { parameter: String },
}

/// A unit of work in the module graph.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: ActionId,

    /// Declared name (artifact, explicit id, or parameter name)
    pub name: String,

    pub operation: Operation,

    /// Ordered positional inputs
    pub inputs: Vec<Input>,

    /// Producing actions this action waits for
    pub dependencies: BTreeSet<ActionId>,

    /// Builder call sequence index; the planner's tie-breaker
    pub declared_order: u32,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self.operation {
            Operation::Deploy { .. } => ActionKind::Deploy,
            Operation::Call { .. } => ActionKind::Call,
            Operation::StaticCall { .. } => ActionKind::StaticCall,
            Operation::ReadParameter { .. } => ActionKind::ReadParameter,
        }
    }

    /// Call/static-call target, if any.
    pub fn target(&self) -> Option<&Future> {
        match &self.operation {
            Operation::Call { target, .. } | Operation::StaticCall { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// A declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDeclaration {
    pub name: String,
    pub param_type: ParamType,
    pub default: Option<Value>,
}

/// A built module: the graph the planner and executor consume.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,

    /// Actions in declared order
    pub actions: IndexMap<ActionId, Action>,

    /// Parameter declarations keyed by (qualified) name
    pub parameters: IndexMap<String, ParameterDeclaration>,

    /// Exported futures keyed by export name
    pub exports: IndexMap<String, Future>,

    /// Names of modules merged into this one
    pub submodules: BTreeSet<String>,
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum actions in flight at once (1 = strictly sequential submission)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Timeout per external call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Write the provenance event log
    #[serde(default = "default_true")]
    pub tripwire: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
            tripwire: true,
        }
    }
}

fn default_max_in_flight() -> usize {
    1
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

// ============================================================================
// Journal
// ============================================================================

/// Lifecycle status of an action in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Durable per-action record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub module_id: String,

    pub action_id: ActionId,

    pub status: ActionStatus,

    /// Result once Completed
    #[serde(default)]
    pub result: Option<Value>,

    /// Submission key or environment reference of the latest attempt
    #[serde(default)]
    pub external_ref: Option<String>,

    /// Attempts made across all runs
    #[serde(default)]
    pub attempts: u32,

    /// BLAKE3 fingerprint of the resolved inputs
    #[serde(default)]
    pub inputs_hash: Option<String>,

    /// Last failure reason
    #[serde(default)]
    pub error: Option<String>,

    /// When the entry was last written
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl JournalEntry {
    /// A fresh Pending entry.
    pub fn pending(module_id: &str, action_id: &ActionId) -> Self {
        Self {
            module_id: module_id.to_string(),
            action_id: action_id.clone(),
            status: ActionStatus::Pending,
            result: None,
            external_ref: None,
            attempts: 0,
            inputs_hash: None,
            error: None,
            updated_at: None,
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Deterministic execution plan for a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub module: String,

    /// Topological order, ties broken by declared order
    pub order: Vec<ActionId>,

    /// For each action, the actions with no path to or from it
    pub concurrent: IndexMap<ActionId, BTreeSet<ActionId>>,
}

/// What a run would do with an action, given the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Parameter bound locally, no external call
    Bind,
    /// Never attempted: will be executed
    Execute,
    /// Completed earlier: result reused
    Reuse,
    /// Left Executing by an earlier run: status queried first
    Reconcile,
    /// Pending or Failed earlier: executed again
    Retry,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind => write!(f, "BIND"),
            Self::Execute => write!(f, "EXECUTE"),
            Self::Reuse => write!(f, "REUSE"),
            Self::Reconcile => write!(f, "RECONCILE"),
            Self::Retry => write!(f, "RETRY"),
        }
    }
}

/// A single reviewed step.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub action_id: ActionId,
    pub kind: ActionKind,
    pub disposition: Disposition,
    pub description: String,
}

/// Plan annotated with journal state, for operator review.
#[derive(Debug, Clone)]
pub struct PlanReview {
    pub module: String,
    pub steps: Vec<PlannedStep>,
    pub to_execute: u32,
    pub to_reuse: u32,
    pub to_reconcile: u32,
    pub to_retry: u32,
}

// ============================================================================
// Run report
// ============================================================================

/// Why an action was not attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A direct or transitive dependency failed
    DependencyFailed(ActionId),
    /// Cancellation stopped dispatch before this action
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed(id) => write!(f, "dependency {} failed", id),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final per-action status of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed { result: Value, reused: bool },
    Failed { error: String },
    Skipped { reason: SkipReason },
}

impl ActionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { result, reused: true } => write!(f, "COMPLETED (reused) {}", result),
            Self::Completed { result, .. } => write!(f, "COMPLETED {}", result),
            Self::Failed { error } => write!(f, "FAILED {}", error),
            Self::Skipped { reason } => write!(f, "SKIPPED ({})", reason),
        }
    }
}

/// Result of running a module.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub module: String,
    pub run_id: String,

    /// Outcome per action, in plan order
    pub outcomes: IndexMap<ActionId, ActionOutcome>,

    /// Exported values for every Completed export target
    pub exports: IndexMap<String, Value>,

    pub total_duration: Duration,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_failed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_skipped()).count()
    }

    pub fn outcome(&self, id: &ActionId) -> Option<&ActionOutcome> {
        self.outcomes.get(id)
    }

    /// True when nothing failed or was skipped.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        module: String,
        run_id: String,
        ignis_version: String,
    },
    ActionStarted {
        module: String,
        action: String,
        attempt: u32,
    },
    ActionRetrying {
        module: String,
        action: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    ActionCompleted {
        module: String,
        action: String,
        duration_seconds: f64,
        external_ref: Option<String>,
        inputs_hash: String,
    },
    ActionFailed {
        module: String,
        action: String,
        error: String,
    },
    ActionSkipped {
        module: String,
        action: String,
        reason: String,
    },
    ActionReconciled {
        module: String,
        action: String,
        outcome: String,
    },
    RunCompleted {
        module: String,
        run_id: String,
        actions_completed: u32,
        actions_failed: u32,
        actions_skipped: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Tests
// ============================================================================

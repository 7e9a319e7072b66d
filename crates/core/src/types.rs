use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a workflow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an approval gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GateId(pub Uuid);

impl GateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a node, unique within one workflow graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status of a single node's execution within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Decision recorded on an approval gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Pending,
    Approved,
    Rejected,
    Overridden,
}

/// Side-effect category of a step type, consulted for retry eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    Pure,
    ExternalRead,
    ExternalWrite,
}

/// What happens to the run when a node terminally fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    HaltOnError,
    ContinueOnError,
}

/// Classified cause of a step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    ExecutorFailure,
    Timeout,
    ApprovalRejected,
    CancelledWhileRunning,
    InvalidInput,
}

/// A single step in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique within this graph (referenced by edges)
    pub id: NodeId,
    /// Maps to a descriptor in the step registry
    pub step_type: String,
    /// Arbitrary configuration passed to the executor at dispatch time
    #[serde(default)]
    pub config: Value,
    /// Required inputs declared on the node itself, unioned with the
    /// registry's per-type declaration during validation
    #[serde(default)]
    pub required_inputs: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Overrides the step type's default timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Directed edge between two nodes, optionally guarded by a condition
/// evaluated against the run's working data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// An immutable workflow graph value. Every structural edit produces a
/// new version; runs freeze the version they execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: WorkflowId,
    pub version: u32,
    pub name: String,
    /// Insertion order is the deterministic dispatch tie-break
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    /// Overrides the engine's retry ceiling for this workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Overrides the engine's fixed retry delay for this workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<u64>,
}

impl WorkflowGraph {
    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Content digest of the graph document (SHA-256 over canonical JSON)
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(bytes))
    }
}

/// How a workflow is started. A workflow has at most one active trigger;
/// replacing it supersedes the previous one atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Runs are created directly by an external request
    Manual,
    /// Fires on a cron schedule, optionally confined to a daily window
    Cron {
        /// Standard cron expression
        expression: String,
        /// IANA timezone name (e.g. "America/New_York")
        timezone: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window_start: Option<NaiveTime>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window_end: Option<NaiveTime>,
    },
    /// Fires when an external event source notifies
    Event { source_id: String },
}

/// Why a run was created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerReason {
    Manual,
    Scheduled { fire_time: DateTime<Utc> },
    Event { source_id: String },
}

/// Active trigger for a workflow, with scheduler bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub workflow_id: WorkflowId,
    pub trigger: Trigger,
    /// Next computed fire time, persisted so missed fires can be caught
    /// up (at most once) after a restart
    pub next_fire: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A published workflow version as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub graph: WorkflowGraph,
    pub digest: String,
    pub published_at: DateTime<Utc>,
}

/// Execution state of one node within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub node_id: NodeId,
    pub status: StepStatus,
    /// 1-based; 0 until the first dispatch
    pub attempt: u32,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<StepErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn pending(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: StepStatus::Pending,
            attempt: 0,
            input: Value::Null,
            output: None,
            error_kind: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// One execution instance of a workflow graph version.
///
/// The graph is frozen at run creation; later edits to the workflow never
/// affect an in-flight run, and history stays interpretable after the
/// live graph changes or is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub trigger_reason: TriggerReason,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Step outputs accumulated under their node id
    pub working_data: BTreeMap<String, Value>,
    /// Total retry attempts across all steps of this run
    pub retry_count: u32,
    pub steps: Vec<StepExecution>,
    /// Frozen copy of the graph version this run executes
    pub graph: WorkflowGraph,
}

impl Run {
    pub fn step(&self, node_id: &NodeId) -> Option<&StepExecution> {
        self.steps.iter().find(|s| &s.node_id == node_id)
    }

    pub fn step_mut(&mut self, node_id: &NodeId) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| &s.node_id == node_id)
    }
}

/// Durable record of a pending human decision blocking run progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub id: GateId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub requested_at: DateTime<Utc>,
    pub decision: GateDecision,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    /// Replacement output merged into working data when the decision is
    /// `Overridden`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_output: Option<Value>,
}

/// A decision submitted against a gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRuling {
    pub decision: GateDecision,
    pub decided_by: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub override_output: Option<Value>,
}

/// Condensed per-step view used in run snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub node_id: NodeId,
    pub status: StepStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<StepErrorKind>,
}

/// The pending gate surfaced on a waiting run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSummary {
    pub gate_id: GateId,
    pub node_id: NodeId,
    pub requested_at: DateTime<Utc>,
}

/// The first terminally failed step of a failed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSummary {
    pub node_id: NodeId,
    pub error_kind: Option<StepErrorKind>,
    pub attempts: u32,
}

/// External view of a run: a failed run exposes its first failed step, a
/// waiting run its pending gate, never a raw internal error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_gate: Option<GateSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<FailureSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> WorkflowGraph {
        WorkflowGraph {
            id: WorkflowId::new(),
            version: 1,
            name: "digest-test".to_string(),
            nodes: vec![
                NodeSpec {
                    id: NodeId::new("a"),
                    step_type: "transform".to_string(),
                    config: serde_json::json!({"expr": "x"}),
                    required_inputs: vec![],
                    requires_approval: false,
                    on_failure: FailurePolicy::HaltOnError,
                    timeout_secs: None,
                },
                NodeSpec {
                    id: NodeId::new("b"),
                    step_type: "email".to_string(),
                    config: Value::Null,
                    required_inputs: vec![],
                    requires_approval: false,
                    on_failure: FailurePolicy::HaltOnError,
                    timeout_secs: None,
                },
            ],
            edges: vec![EdgeSpec {
                from: NodeId::new("a"),
                to: NodeId::new("b"),
                condition: None,
            }],
            max_retries: None,
            retry_delay_secs: None,
        }
    }

    #[test]
    fn digest_is_stable_for_equal_graphs() {
        let graph = two_node_graph();
        assert_eq!(graph.digest(), graph.clone().digest());
    }

    #[test]
    fn digest_changes_with_structure() {
        let graph = two_node_graph();
        let mut edited = graph.clone();
        edited.edges.push(EdgeSpec {
            from: NodeId::new("b"),
            to: NodeId::new("a"),
            condition: Some("never".to_string()),
        });
        assert_ne!(graph.digest(), edited.digest());
    }

    #[test]
    fn trigger_round_trips_through_json() {
        let trigger = Trigger::Cron {
            expression: "0 9 * * *".to_string(),
            timezone: "UTC".to_string(),
            window_start: Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            window_end: Some(NaiveTime::from_hms_opt(9, 30, 0).unwrap()),
        };
        let json = serde_json::to_string(&trigger).unwrap();
        let back: Trigger = serde_json::from_str(&json).unwrap();
        assert_eq!(trigger, back);
    }

    #[test]
    fn step_statuses_classify_terminal() {
        assert!(StepStatus::Succeeded.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::WaitingApproval.is_terminal());
        assert!(!RunStatus::WaitingApproval.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }
}

use crate::types::{GateId, NodeId, RunId};
use thiserror::Error;

/// Structural or input error found while validating a workflow graph.
///
/// Hard errors block activation; a graph that fails validation never
/// reaches the scheduler or the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("edge references unknown node {node}")]
    UnknownEdgeNode { node: NodeId },

    #[error("duplicate node id {node}")]
    DuplicateNode { node: NodeId },

    #[error("cycle detected through nodes {}", nodes.iter().map(|n| n.0.as_str()).collect::<Vec<_>>().join(" -> "))]
    Cycle { nodes: Vec<NodeId> },

    #[error("graph has no entry node")]
    NoEntryNode,

    #[error("node {node} uses unknown step type {step_type}")]
    UnknownStepType { node: NodeId, step_type: String },

    #[error("node {node} is missing required input {input}")]
    MissingRequiredInput { node: NodeId, input: String },
}

/// Non-fatal findings attached to an otherwise valid graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphWarning {
    #[error("node {node} is unreachable from any entry node")]
    Unreachable { node: NodeId },
}

/// Trigger misconfiguration, rejected at trigger-set time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("unknown timezone {timezone:?}")]
    UnknownTimezone { timezone: String },

    #[error("window start {start} is not before window end {end}")]
    InvalidWindow { start: String, end: String },

    #[error("window requires both start and end")]
    IncompleteWindow,
}

/// Run control failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("run {0} is already finished and cannot be cancelled")]
    NotCancellable(RunId),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Approval gate decision failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("approval gate {0} not found")]
    NotFound(GateId),

    #[error("approval gate {0} already has a decision")]
    AlreadyDecided(GateId),

    #[error("a gate decision cannot be pending")]
    PendingDecision,

    #[error("storage failure: {0}")]
    Storage(String),
}

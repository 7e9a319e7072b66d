use crate::types::{GateDecision, GateId, NodeId, RunId, StepErrorKind, TriggerReason, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// An event emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl EngineEvent {
    pub fn new(run_id: RunId, kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Run and step lifecycle events.
///
/// Delivery is at-least-once: events are appended to the durable log
/// before fan-out, and consumers de-duplicate by (run, node, status).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        workflow_id: WorkflowId,
        workflow_version: u32,
        trigger_reason: TriggerReason,
    },
    StepStarted {
        node_id: NodeId,
        attempt: u32,
    },
    StepCompleted {
        node_id: NodeId,
        attempt: u32,
        duration_ms: u64,
    },
    StepFailed {
        node_id: NodeId,
        attempt: u32,
        error_kind: StepErrorKind,
        error: String,
        will_retry: bool,
    },
    StepSkipped {
        node_id: NodeId,
        reason: String,
    },
    RunWaitingApproval {
        gate_id: GateId,
        node_id: NodeId,
    },
    ApprovalDecided {
        gate_id: GateId,
        node_id: NodeId,
        decision: GateDecision,
    },
    RunCompleted {
        duration_ms: u64,
    },
    RunFailed {
        node_id: Option<NodeId>,
        error: String,
        duration_ms: u64,
    },
    RunCancelled {
        reason: String,
    },
}

/// Append-only event log
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: EngineEvent) -> anyhow::Result<()>;

    /// Get all events for a run, in timestamp order
    async fn run_events(&self, run_id: RunId) -> anyhow::Result<Vec<EngineEvent>>;

    /// Get events for a run within a time range
    async fn run_events_range(
        &self,
        run_id: RunId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<EngineEvent>>;
}

/// Durable log plus live broadcast fan-out for subscribed observers
#[derive(Clone)]
pub struct EventBus {
    log: Arc<dyn EventLog>,
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { log, tx }
    }

    /// Persist an event, then push it to live subscribers. A lagging
    /// subscriber can miss broadcast messages; the log is the source of
    /// truth.
    pub async fn emit(&self, run_id: RunId, kind: EventKind) -> anyhow::Result<()> {
        let event = EngineEvent::new(run_id, kind);
        self.log.append(event.clone()).await?;
        let _ = self.tx.send(event);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn log(&self) -> Arc<dyn EventLog> {
        self.log.clone()
    }
}

//! Approval gates. A gate is a durable record of a pending human
//! decision, not an in-memory suspended call, so a paused run survives a
//! process restart. Recording a decision wakes the owning run back up.

use crate::error::GateError;
use crate::events::{EventBus, EventKind};
use crate::storage::RunStore;
use crate::types::{ApprovalGate, GateDecision, GateId, GateRuling, NodeId, RunId};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) struct ApprovalGates {
    store: Arc<RunStore>,
    events: EventBus,
    /// Re-enqueues a run for driving once its gate is decided
    queue: mpsc::UnboundedSender<RunId>,
}

impl ApprovalGates {
    pub fn new(store: Arc<RunStore>, events: EventBus, queue: mpsc::UnboundedSender<RunId>) -> Self {
        Self { store, events, queue }
    }

    /// Open a gate for a step that requires approval.
    pub fn open(&self, run_id: RunId, node_id: NodeId) -> anyhow::Result<ApprovalGate> {
        let gate = ApprovalGate {
            id: GateId::new(),
            run_id,
            node_id,
            requested_at: Utc::now(),
            decision: GateDecision::Pending,
            decided_by: None,
            decided_at: None,
            note: None,
            override_output: None,
        };
        self.store.put_gate(&gate)?;
        tracing::info!("opened approval gate {} for run {} node {}", gate.id, run_id, gate.node_id);
        Ok(gate)
    }

    /// Record a decision on a gate. Fails if the gate is unknown or
    /// already decided; a decision can never be `Pending`.
    pub async fn record_decision(&self, gate_id: GateId, ruling: GateRuling) -> Result<(), GateError> {
        if ruling.decision == GateDecision::Pending {
            return Err(GateError::PendingDecision);
        }

        let mut gate = self
            .store
            .get_gate(&gate_id)
            .map_err(|e| GateError::Storage(e.to_string()))?
            .ok_or(GateError::NotFound(gate_id))?;

        if gate.decision != GateDecision::Pending {
            return Err(GateError::AlreadyDecided(gate_id));
        }

        gate.decision = ruling.decision;
        gate.decided_by = Some(ruling.decided_by);
        gate.decided_at = Some(Utc::now());
        gate.note = ruling.note;
        gate.override_output = ruling.override_output;

        self.store
            .put_gate(&gate)
            .map_err(|e| GateError::Storage(e.to_string()))?;

        if let Err(e) = self
            .events
            .emit(
                gate.run_id,
                EventKind::ApprovalDecided {
                    gate_id: gate.id,
                    node_id: gate.node_id.clone(),
                    decision: gate.decision,
                },
            )
            .await
        {
            tracing::warn!("failed to record approval decision event: {e:#}");
        }

        tracing::info!(
            "gate {} decided {:?}, resuming run {}",
            gate.id,
            gate.decision,
            gate.run_id
        );
        let _ = self.queue.send(gate.run_id);
        Ok(())
    }

    pub fn pending(&self) -> anyhow::Result<Vec<ApprovalGate>> {
        self.store.pending_gates()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::MemoryLog;
    use tempfile::TempDir;

    fn gates() -> (TempDir, ApprovalGates, mpsc::UnboundedReceiver<RunId>) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(RunStore::new(temp.path().join("trellis.redb")).unwrap());
        let events = EventBus::new(Arc::new(MemoryLog::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        (temp, ApprovalGates::new(store, events, tx), rx)
    }

    fn ruling(decision: GateDecision) -> GateRuling {
        GateRuling {
            decision,
            decided_by: "ops@example.com".to_string(),
            note: None,
            override_output: None,
        }
    }

    #[tokio::test]
    async fn decision_resumes_the_owning_run() {
        let (_temp, gates, mut rx) = gates();
        let run_id = RunId::new();
        let gate = gates.open(run_id, NodeId::new("publish")).unwrap();

        gates
            .record_decision(gate.id, ruling(GateDecision::Approved))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), run_id);
        assert!(gates.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_decision_is_rejected() {
        let (_temp, gates, _rx) = gates();
        let gate = gates.open(RunId::new(), NodeId::new("publish")).unwrap();

        gates
            .record_decision(gate.id, ruling(GateDecision::Rejected))
            .await
            .unwrap();

        let err = gates
            .record_decision(gate.id, ruling(GateDecision::Approved))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::AlreadyDecided(id) if id == gate.id));
    }

    #[tokio::test]
    async fn unknown_gate_is_not_found() {
        let (_temp, gates, _rx) = gates();
        let ghost = GateId::new();
        let err = gates
            .record_decision(ghost, ruling(GateDecision::Approved))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::NotFound(id) if id == ghost));
    }

    #[tokio::test]
    async fn pending_is_not_a_valid_decision() {
        let (_temp, gates, _rx) = gates();
        let gate = gates.open(RunId::new(), NodeId::new("publish")).unwrap();
        let err = gates
            .record_decision(gate.id, ruling(GateDecision::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::PendingDecision));
    }
}

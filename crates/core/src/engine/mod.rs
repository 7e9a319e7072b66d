//! The execution engine: a pool of workers pulls queued runs, claims
//! each behind a per-run lease, and walks the frozen graph to a terminal
//! state. Approval gates suspend a run durably; decisions re-enqueue it.

pub mod approval;
pub mod dispatch;
pub mod executor;
pub mod lease;

pub use dispatch::{StepContext, StepOutcome, StepRunner};
pub use lease::{LeaseRegistry, RunLease};

use crate::error::{GateError, RunError};
use crate::events::{EngineEvent, EventBus};
use crate::registry::StepRegistry;
use crate::storage::RunStore;
use crate::types::{
    ApprovalGate, FailureSummary, GateRuling, GateId, GateSummary, Run, RunId, RunSnapshot,
    RunStatus, StepExecution, StepSnapshot, StepStatus, TriggerReason, WorkflowGraph, WorkflowId,
};
use approval::ApprovalGates;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Engine tunables. Workflow documents may override the retry ceiling
/// and delay for their own runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker routines pulling runs from the queue
    pub workers: usize,
    /// Concurrent step dispatches within one run
    pub fan_out: usize,
    /// Retry ceiling per step
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    /// How long an in-flight executor call gets to confirm an abort
    pub cancel_grace: Duration,
    /// Lease time bound; only matters if a worker dies mid-run
    pub lease_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            fan_out: 4,
            max_retries: 3,
            retry_delay: Duration::from_secs(300),
            cancel_grace: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(600),
        }
    }
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<StepRegistry>,
    pub(crate) runner: Arc<dyn StepRunner>,
    pub(crate) store: Arc<RunStore>,
    pub(crate) events: EventBus,
    pub(crate) leases: Arc<LeaseRegistry>,
    gates: ApprovalGates,
    queue_tx: mpsc::UnboundedSender<RunId>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<RunId>>>,
    cancels: Mutex<HashMap<RunId, watch::Sender<bool>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<StepRegistry>,
        runner: Arc<dyn StepRunner>,
        store: Arc<RunStore>,
        events: EventBus,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let gates = ApprovalGates::new(store.clone(), events.clone(), queue_tx.clone());
        let leases = Arc::new(LeaseRegistry::new(config.lease_ttl));

        Arc::new(Self {
            config,
            registry,
            runner,
            store,
            events,
            leases,
            gates,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            cancels: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the worker pool. Each worker owns at most one run at a time
    /// (enforced by the lease registry, not by worker count).
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let rx = self
            .queue_rx
            .lock()
            .expect("engine queue lock poisoned")
            .take()
            .expect("engine already started");
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        (0..self.config.workers)
            .map(|worker| {
                let engine = Arc::clone(self);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    tracing::debug!("engine worker {worker} started");
                    loop {
                        let run_id = { rx.lock().await.recv().await };
                        let Some(run_id) = run_id else { break };
                        engine.drive(run_id).await;
                    }
                    tracing::debug!("engine worker {worker} stopped");
                })
            })
            .collect()
    }

    /// Re-enqueue every non-terminal run, for startup after a crash or
    /// shutdown. Parked runs whose gate is still undecided simply check
    /// their gate and go back to waiting.
    pub fn recover(&self) -> anyhow::Result<usize> {
        let mut recovered = 0;
        for run in self.store.list_runs()? {
            if !run.status.is_terminal() {
                let _ = self.queue_tx.send(run.id);
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!("re-enqueued {recovered} in-flight runs");
        }
        Ok(recovered)
    }

    /// Create a run of the latest published version of a workflow and
    /// queue it for execution.
    pub fn start_run(
        &self,
        workflow_id: WorkflowId,
        reason: TriggerReason,
    ) -> Result<RunId, RunError> {
        let record = self
            .store
            .latest_workflow(&workflow_id)
            .map_err(|e| RunError::Storage(e.to_string()))?
            .ok_or_else(|| RunError::WorkflowNotFound(workflow_id.to_string()))?;
        self.start_run_of(record.graph, reason)
    }

    /// Create a run of a specific frozen graph.
    pub fn start_run_of(
        &self,
        graph: WorkflowGraph,
        reason: TriggerReason,
    ) -> Result<RunId, RunError> {
        let run = Run {
            id: RunId::new(),
            workflow_id: graph.id,
            workflow_version: graph.version,
            trigger_reason: reason,
            status: RunStatus::Queued,
            started_at: Utc::now(),
            ended_at: None,
            working_data: Default::default(),
            retry_count: 0,
            steps: graph
                .nodes
                .iter()
                .map(|n| StepExecution::pending(n.id.clone()))
                .collect(),
            graph,
        };
        self.store
            .put_run(&run)
            .map_err(|e| RunError::Storage(e.to_string()))?;

        tracing::info!(
            "queued run {} for workflow {} v{}",
            run.id,
            run.workflow_id,
            run.workflow_version
        );
        let _ = self.queue_tx.send(run.id);
        Ok(run.id)
    }

    /// Request cooperative cancellation of a run.
    pub fn cancel_run(&self, run_id: RunId) -> Result<(), RunError> {
        let run = self
            .store
            .get_run(&run_id)
            .map_err(|e| RunError::Storage(e.to_string()))?
            .ok_or(RunError::NotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(RunError::NotCancellable(run_id));
        }

        self.request_cancel(run_id);
        tracing::info!("cancellation requested for run {run_id}");
        let _ = self.queue_tx.send(run_id);
        Ok(())
    }

    /// External view of a run.
    pub fn run_snapshot(&self, run_id: RunId) -> Result<RunSnapshot, RunError> {
        let run = self
            .store
            .get_run(&run_id)
            .map_err(|e| RunError::Storage(e.to_string()))?
            .ok_or(RunError::NotFound(run_id))?;

        let pending_gate = if run.status == RunStatus::WaitingApproval {
            self.store
                .pending_gate_for_run(&run_id)
                .map_err(|e| RunError::Storage(e.to_string()))?
                .map(|g| GateSummary {
                    gate_id: g.id,
                    node_id: g.node_id,
                    requested_at: g.requested_at,
                })
        } else {
            None
        };

        let first_failure = run
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .min_by_key(|s| s.ended_at)
            .map(|s| FailureSummary {
                node_id: s.node_id.clone(),
                error_kind: s.error_kind,
                attempts: s.attempt,
            });

        Ok(RunSnapshot {
            run_id: run.id,
            workflow_id: run.workflow_id,
            workflow_version: run.workflow_version,
            status: run.status,
            started_at: run.started_at,
            ended_at: run.ended_at,
            steps: run
                .steps
                .iter()
                .map(|s| StepSnapshot {
                    node_id: s.node_id.clone(),
                    status: s.status,
                    attempt: s.attempt,
                    error_kind: s.error_kind,
                })
                .collect(),
            pending_gate,
            first_failure,
        })
    }

    /// Record a human decision on an approval gate.
    pub async fn record_approval_decision(
        &self,
        gate_id: GateId,
        ruling: GateRuling,
    ) -> Result<(), GateError> {
        self.gates.record_decision(gate_id, ruling).await
    }

    pub fn pending_approvals(&self) -> anyhow::Result<Vec<ApprovalGate>> {
        self.gates.pending()
    }

    /// Live event feed. Delivery is at-least-once via the durable log;
    /// this stream can lag.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> Arc<RunStore> {
        self.store.clone()
    }

    // --- internals shared with the executor ---

    fn request_cancel(&self, run_id: RunId) {
        let mut cancels = self.cancels.lock().expect("cancel map lock poisoned");
        cancels
            .entry(run_id)
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
    }

    pub(crate) fn cancel_receiver(&self, run_id: RunId) -> watch::Receiver<bool> {
        let mut cancels = self.cancels.lock().expect("cancel map lock poisoned");
        cancels
            .entry(run_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    pub(crate) fn clear_cancel(&self, run_id: &RunId) {
        self.cancels
            .lock()
            .expect("cancel map lock poisoned")
            .remove(run_id);
    }

    pub(crate) fn requeue_later(self: &Arc<Self>, run_id: RunId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = engine.queue_tx.send(run_id);
        });
    }

    pub(crate) fn open_gate(&self, run_id: RunId, node_id: crate::types::NodeId) -> anyhow::Result<ApprovalGate> {
        self.gates.open(run_id, node_id)
    }
}

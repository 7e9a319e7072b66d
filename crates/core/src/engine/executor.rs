//! The per-run state machine. A worker that holds a run's lease drives
//! it: evaluates edge conditions, propagates skips, dispatches ready
//! nodes in insertion order (concurrently up to the fan-out limit),
//! suspends on approval gates, and settles the run in a terminal state.

use super::dispatch::{dispatch_step, DispatchResult, FinalOutcome, RetryPolicy};
use super::Engine;
use crate::condition;
use crate::events::EventKind;
use crate::graph::GraphDag;
use crate::types::{
    EdgeSpec, FailurePolicy, GateDecision, NodeId, Run, RunId, RunStatus, StepErrorKind,
    StepStatus,
};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

impl Engine {
    /// Claim the run and advance it as far as possible. If another
    /// worker holds the lease the run is retried shortly; whoever owns
    /// it will observe any state we wanted to apply.
    pub(crate) async fn drive(self: &Arc<Self>, run_id: RunId) {
        let Some(lease) = self.leases.try_acquire(run_id) else {
            self.requeue_later(run_id);
            return;
        };

        if let Err(e) = self.drive_owned(run_id).await {
            tracing::error!("run {run_id} failed to advance: {e:#}");
        }
        drop(lease);

        if let Ok(Some(run)) = self.store.get_run(&run_id) {
            if run.status.is_terminal() {
                self.clear_cancel(&run_id);
            }
        }
    }

    async fn drive_owned(&self, run_id: RunId) -> Result<()> {
        let Some(mut run) = self.store.get_run(&run_id)? else {
            tracing::warn!("dequeued unknown run {run_id}");
            return Ok(());
        };
        if run.status.is_terminal() {
            return Ok(());
        }

        let cancel = self.cancel_receiver(run_id);

        // Steps left Running by an interrupted worker get re-dispatched;
        // holding the lease means no dispatch for this run is in flight
        for step in &mut run.steps {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
            }
        }

        match run.status {
            RunStatus::Queued => {
                run.status = RunStatus::Running;
                self.store.put_run(&run)?;
                self.events
                    .emit(
                        run_id,
                        EventKind::RunStarted {
                            workflow_id: run.workflow_id,
                            workflow_version: run.workflow_version,
                            trigger_reason: run.trigger_reason.clone(),
                        },
                    )
                    .await?;
            }
            RunStatus::WaitingApproval if !*cancel.borrow() => {
                if !self.apply_gate_decisions(&mut run).await? {
                    // Gate still undecided; the decision will re-enqueue
                    return Ok(());
                }
                run.status = RunStatus::Running;
                self.store.put_run(&run)?;
            }
            _ => {}
        }

        let dag = GraphDag::from_graph(&run.graph).context("frozen graph is not a DAG")?;
        let policy = RetryPolicy {
            max_retries: run.graph.max_retries.unwrap_or(self.config.max_retries),
            retry_delay: run
                .graph
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(self.config.retry_delay),
            cancel_grace: self.config.cancel_grace,
        };

        loop {
            if *cancel.borrow() {
                return self.finalize_cancelled(&mut run).await;
            }

            self.propagate_skips(&mut run, &dag).await?;

            // A terminally failed halt-on-error step fails the run
            let halted = run.steps.iter().find(|s| {
                s.status == StepStatus::Failed
                    && run
                        .graph
                        .node(&s.node_id)
                        .map(|n| n.on_failure == FailurePolicy::HaltOnError)
                        .unwrap_or(true)
            });
            if let Some(failed) = halted {
                let node_id = failed.node_id.clone();
                let error = failed.error.clone().unwrap_or_default();
                return self.finalize_failed(&mut run, node_id, error).await;
            }

            let ready = ready_nodes(&run, &dag);

            if ready.is_empty() {
                if run.steps.iter().all(|s| s.status.is_terminal()) {
                    return self.finalize_completed(&mut run).await;
                }
                // Remaining work is waiting on an approval decision,
                // which re-enqueues the run when it lands
                return Ok(());
            }

            // Collect a batch in insertion order, stopping at the first
            // node that needs an approval gate
            let mut batch: Vec<NodeId> = Vec::new();
            let mut gate_node: Option<NodeId> = None;
            for node_id in &ready {
                let node = run.graph.node(node_id).expect("ready node in graph");
                if node.requires_approval && self.needs_gate(&run, node_id)? {
                    gate_node = Some(node_id.clone());
                    break;
                }
                batch.push(node_id.clone());
                if batch.len() >= self.config.fan_out {
                    break;
                }
            }

            if batch.is_empty() {
                let node_id = gate_node.expect("empty batch implies a gate");
                return self.suspend_for_approval(&mut run, node_id).await;
            }

            self.dispatch_batch(&mut run, batch, policy, &cancel).await?;
        }
    }

    /// Dispatch a batch of ready nodes concurrently. Tasks are spawned
    /// in insertion order; outputs merge in completion order.
    async fn dispatch_batch(
        &self,
        run: &mut Run,
        batch: Vec<NodeId>,
        policy: RetryPolicy,
        cancel: &tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let mut prepared = Vec::new();
        for node_id in &batch {
            let node = run.graph.node(node_id).expect("batch node in graph").clone();
            let input = resolve_input(run, node_id);
            let first_attempt = run.step(node_id).map(|s| s.attempt + 1).unwrap_or(1);
            prepared.push((node, input, first_attempt));
        }

        for (node, input, _) in &prepared {
            let now = Utc::now();
            if let Some(step) = run.step_mut(&node.id) {
                step.status = StepStatus::Running;
                step.started_at.get_or_insert(now);
                step.input = input.clone();
            }
        }
        self.store.put_run(run)?;

        let mut join = tokio::task::JoinSet::new();
        let mut direct_failures: Vec<DispatchResult> = Vec::new();

        for (node, input, first_attempt) in prepared {
            let Some(descriptor) = self.registry.get(&node.step_type) else {
                // Registry refreshed the type away after validation
                direct_failures.push(DispatchResult {
                    node_id: node.id.clone(),
                    attempt: first_attempt,
                    outcome: FinalOutcome::Failed {
                        error_kind: StepErrorKind::InvalidInput,
                        message: format!("unknown step type {}", node.step_type),
                    },
                    started_at: Utc::now(),
                    ended_at: Utc::now(),
                });
                continue;
            };

            join.spawn(dispatch_step(
                self.events.clone(),
                self.runner.clone(),
                descriptor,
                node,
                run.id,
                input,
                first_attempt,
                policy,
                cancel.clone(),
            ));
        }

        for result in direct_failures {
            self.apply_result(run, result);
        }
        while let Some(joined) = join.join_next().await {
            let result = joined.context("dispatch task panicked")?;
            self.apply_result(run, result);
            self.store.put_run(run)?;
        }
        self.store.put_run(run)?;
        Ok(())
    }

    fn apply_result(&self, run: &mut Run, result: DispatchResult) {
        let mut retries_used = 0;
        if let Some(step) = run.step_mut(&result.node_id) {
            retries_used = result.attempt.saturating_sub(step.attempt + 1);
            step.attempt = result.attempt;
            step.ended_at = Some(result.ended_at);
            match &result.outcome {
                FinalOutcome::Succeeded { output } => {
                    step.status = StepStatus::Succeeded;
                    step.output = Some(output.clone());
                    step.error_kind = None;
                    step.error = None;
                }
                FinalOutcome::Failed { error_kind, message } => {
                    step.status = StepStatus::Failed;
                    step.error_kind = Some(*error_kind);
                    step.error = Some(message.clone());
                }
            }
        }
        run.retry_count += retries_used;

        if let FinalOutcome::Succeeded { output } = result.outcome {
            run.working_data.insert(result.node_id.0.clone(), output);
        }
    }

    /// Mark nodes whose branch was not taken (or whose predecessors all
    /// skipped or failed tolerably) as skipped, to a fixpoint.
    async fn propagate_skips(&self, run: &mut Run, dag: &GraphDag) -> Result<()> {
        loop {
            let mut skippable: Vec<(NodeId, String)> = Vec::new();

            for node in &run.graph.nodes {
                let pending = run
                    .step(&node.id)
                    .map(|s| s.status == StepStatus::Pending)
                    .unwrap_or(false);
                if !pending || dag.is_entry(&node.id) {
                    continue;
                }
                let deps_settled = dag
                    .dependencies(&node.id)
                    .iter()
                    .all(|d| run.step(d).map(|s| s.status.is_terminal()).unwrap_or(false));
                if !deps_settled {
                    continue;
                }
                if !has_taken_edge(run, &node.id) {
                    skippable.push((node.id.clone(), skip_reason(run, &node.id)));
                }
            }

            if skippable.is_empty() {
                return Ok(());
            }

            for (node_id, reason) in skippable {
                let now = Utc::now();
                if let Some(step) = run.step_mut(&node_id) {
                    step.status = StepStatus::Skipped;
                    step.ended_at = Some(now);
                }
                self.events
                    .emit(run.id, EventKind::StepSkipped { node_id, reason })
                    .await?;
            }
            self.store.put_run(run)?;
        }
    }

    /// Apply decided gates to steps waiting on approval. Returns false
    /// while any gate is still pending.
    async fn apply_gate_decisions(&self, run: &mut Run) -> Result<bool> {
        let waiting: Vec<NodeId> = run
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::WaitingApproval)
            .map(|s| s.node_id.clone())
            .collect();

        for node_id in waiting {
            let Some(gate) = self.store.gate_for_step(&run.id, &node_id)? else {
                // No gate on record; fall back to dispatching the step
                if let Some(step) = run.step_mut(&node_id) {
                    step.status = StepStatus::Pending;
                }
                continue;
            };

            match gate.decision {
                GateDecision::Pending => {}
                GateDecision::Approved => {
                    // The step had not executed yet; re-dispatch it
                    if let Some(step) = run.step_mut(&node_id) {
                        step.status = StepStatus::Pending;
                    }
                }
                GateDecision::Rejected => {
                    let now = Utc::now();
                    if let Some(step) = run.step_mut(&node_id) {
                        step.status = StepStatus::Failed;
                        step.error_kind = Some(StepErrorKind::ApprovalRejected);
                        step.error = Some(
                            gate.note
                                .clone()
                                .unwrap_or_else(|| "approval rejected".to_string()),
                        );
                        step.ended_at = Some(now);
                    }
                    self.events
                        .emit(
                            run.id,
                            EventKind::StepFailed {
                                node_id: node_id.clone(),
                                attempt: run.step(&node_id).map(|s| s.attempt).unwrap_or(0),
                                error_kind: StepErrorKind::ApprovalRejected,
                                error: "approval rejected".to_string(),
                                will_retry: false,
                            },
                        )
                        .await?;
                }
                GateDecision::Overridden => {
                    // Human-supplied replacement output, merged as if
                    // the step succeeded
                    let output = gate.override_output.clone().unwrap_or(Value::Null);
                    let now = Utc::now();
                    let mut attempt = 0;
                    if let Some(step) = run.step_mut(&node_id) {
                        step.status = StepStatus::Succeeded;
                        step.output = Some(output.clone());
                        step.ended_at = Some(now);
                        attempt = step.attempt;
                    }
                    run.working_data.insert(node_id.0.clone(), output);
                    self.events
                        .emit(
                            run.id,
                            EventKind::StepCompleted {
                                node_id,
                                attempt,
                                duration_ms: 0,
                            },
                        )
                        .await?;
                }
            }
        }

        Ok(run
            .steps
            .iter()
            .all(|s| s.status != StepStatus::WaitingApproval))
    }

    fn needs_gate(&self, run: &Run, node_id: &NodeId) -> Result<bool> {
        match self.store.gate_for_step(&run.id, node_id)? {
            None => Ok(true),
            Some(gate) => Ok(gate.decision == GateDecision::Pending),
        }
    }

    /// Open (or re-surface) the gate and park the run. No further nodes
    /// dispatch until the decision lands.
    async fn suspend_for_approval(&self, run: &mut Run, node_id: NodeId) -> Result<()> {
        let gate = match self
            .store
            .gate_for_step(&run.id, &node_id)?
            .filter(|g| g.decision == GateDecision::Pending)
        {
            Some(existing) => existing,
            None => self.open_gate(run.id, node_id.clone())?,
        };

        if let Some(step) = run.step_mut(&node_id) {
            step.status = StepStatus::WaitingApproval;
        }
        run.status = RunStatus::WaitingApproval;
        self.store.put_run(run)?;

        self.events
            .emit(
                run.id,
                EventKind::RunWaitingApproval {
                    gate_id: gate.id,
                    node_id,
                },
            )
            .await?;
        Ok(())
    }

    async fn finalize_completed(&self, run: &mut Run) -> Result<()> {
        run.status = RunStatus::Completed;
        run.ended_at = Some(Utc::now());
        self.store.put_run(run)?;
        self.events
            .emit(
                run.id,
                EventKind::RunCompleted {
                    duration_ms: run_duration_ms(run),
                },
            )
            .await?;
        tracing::info!("run {} completed", run.id);
        Ok(())
    }

    async fn finalize_failed(&self, run: &mut Run, node_id: NodeId, error: String) -> Result<()> {
        let now = Utc::now();
        for step in &mut run.steps {
            if matches!(
                step.status,
                StepStatus::Pending | StepStatus::WaitingApproval
            ) {
                step.status = StepStatus::Skipped;
                step.ended_at = Some(now);
            }
        }
        run.status = RunStatus::Failed;
        run.ended_at = Some(now);
        self.store.put_run(run)?;
        self.events
            .emit(
                run.id,
                EventKind::RunFailed {
                    node_id: Some(node_id.clone()),
                    error,
                    duration_ms: run_duration_ms(run),
                },
            )
            .await?;
        tracing::warn!("run {} failed at step {node_id}", run.id);
        Ok(())
    }

    async fn finalize_cancelled(&self, run: &mut Run) -> Result<()> {
        let now = Utc::now();
        for step in &mut run.steps {
            if matches!(
                step.status,
                StepStatus::Pending | StepStatus::Running | StepStatus::WaitingApproval
            ) {
                step.status = StepStatus::Skipped;
                step.ended_at = Some(now);
            }
        }
        run.status = RunStatus::Cancelled;
        run.ended_at = Some(now);
        self.store.put_run(run)?;
        self.events
            .emit(
                run.id,
                EventKind::RunCancelled {
                    reason: "cancellation requested".to_string(),
                },
            )
            .await?;
        tracing::info!("run {} cancelled", run.id);
        Ok(())
    }
}

/// Pending nodes whose dependencies are all settled and that have a
/// live path in, in graph insertion order.
fn ready_nodes(run: &Run, dag: &GraphDag) -> Vec<NodeId> {
    run.graph
        .nodes
        .iter()
        .filter(|n| {
            run.step(&n.id)
                .map(|s| s.status == StepStatus::Pending)
                .unwrap_or(false)
        })
        .filter(|n| {
            dag.dependencies(&n.id)
                .iter()
                .all(|d| run.step(d).map(|s| s.status.is_terminal()).unwrap_or(false))
        })
        .filter(|n| dag.is_entry(&n.id) || has_taken_edge(run, &n.id))
        .map(|n| n.id.clone())
        .collect()
}

/// An edge is taken when its source succeeded and its condition (if
/// any) evaluates true against the working data.
fn edge_taken(run: &Run, edge: &EdgeSpec) -> bool {
    let source_succeeded = run
        .step(&edge.from)
        .map(|s| s.status == StepStatus::Succeeded)
        .unwrap_or(false);
    if !source_succeeded {
        return false;
    }
    match &edge.condition {
        None => true,
        Some(expr) => match condition::evaluate(expr, &run.working_data) {
            Ok(taken) => taken,
            Err(e) => {
                tracing::warn!("condition {expr:?} on edge {}->{} failed to evaluate: {e:#}", edge.from, edge.to);
                false
            }
        },
    }
}

fn has_taken_edge(run: &Run, node_id: &NodeId) -> bool {
    run.graph
        .edges
        .iter()
        .filter(|e| &e.to == node_id)
        .any(|e| edge_taken(run, e))
}

fn skip_reason(run: &Run, node_id: &NodeId) -> String {
    let incoming: Vec<&EdgeSpec> = run.graph.edges.iter().filter(|e| &e.to == node_id).collect();
    let any_failed = incoming.iter().any(|e| {
        run.step(&e.from)
            .map(|s| s.status == StepStatus::Failed)
            .unwrap_or(false)
    });
    if any_failed {
        "upstream failure".to_string()
    } else if incoming.iter().all(|e| {
        run.step(&e.from)
            .map(|s| s.status == StepStatus::Skipped)
            .unwrap_or(false)
    }) {
        "upstream skipped".to_string()
    } else {
        "branch not taken".to_string()
    }
}

/// Input subset passed to the executor: outputs of taken upstream edges
fn resolve_input(run: &Run, node_id: &NodeId) -> Value {
    let mut map = serde_json::Map::new();
    for edge in run.graph.edges.iter().filter(|e| &e.to == node_id) {
        if edge_taken(run, edge) {
            if let Some(output) = run.working_data.get(&edge.from.0) {
                map.insert(edge.from.0.clone(), output.clone());
            }
        }
    }
    Value::Object(map)
}

fn run_duration_ms(run: &Run) -> u64 {
    run.ended_at
        .map(|end| (end - run.started_at).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dispatch::{StepContext, StepOutcome, StepRunner};
    use crate::engine::EngineConfig;
    use crate::events::testing::MemoryLog;
    use crate::events::{EngineEvent, EventBus};
    use crate::graph::validate;
    use crate::registry::StepRegistry;
    use crate::storage::RunStore;
    use crate::types::{
        EdgeSpec, GateRuling, NodeSpec, TriggerReason, WorkflowGraph, WorkflowId,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Runner scripted per node id; unscripted nodes succeed with
    /// `{"done": "<node>"}`.
    struct MapRunner {
        scripts: Mutex<HashMap<String, Vec<StepOutcome>>>,
        calls: Mutex<Vec<String>>,
    }

    impl MapRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn script(self: &Arc<Self>, node: &str, outcomes: Vec<StepOutcome>) -> Arc<Self> {
            self.scripts
                .lock()
                .unwrap()
                .insert(node.to_string(), outcomes);
            self.clone()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl StepRunner for MapRunner {
        async fn execute(&self, ctx: StepContext) -> anyhow::Result<StepOutcome> {
            self.calls.lock().unwrap().push(ctx.node_id.0.clone());
            let mut scripts = self.scripts.lock().unwrap();
            if let Some(outcomes) = scripts.get_mut(&ctx.node_id.0) {
                if !outcomes.is_empty() {
                    return Ok(outcomes.remove(0));
                }
            }
            Ok(StepOutcome::Success {
                output: json!({"done": ctx.node_id.0}),
            })
        }
    }

    fn failure() -> StepOutcome {
        StepOutcome::Failure {
            error_kind: StepErrorKind::ExecutorFailure,
            message: "boom".to_string(),
        }
    }

    fn success(value: serde_json::Value) -> StepOutcome {
        StepOutcome::Success { output: value }
    }

    struct Harness {
        _temp: TempDir,
        engine: Arc<Engine>,
        events: tokio::sync::broadcast::Receiver<EngineEvent>,
    }

    fn harness(runner: Arc<dyn StepRunner>) -> Harness {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(RunStore::new(temp.path().join("trellis.redb")).unwrap());
        let bus = EventBus::new(Arc::new(MemoryLog::default()));
        let engine = Engine::new(
            EngineConfig {
                workers: 2,
                ..EngineConfig::default()
            },
            Arc::new(StepRegistry::with_builtin()),
            runner,
            store,
            bus.clone(),
        );
        let events = engine.subscribe();
        engine.start();
        Harness {
            _temp: temp,
            engine,
            events,
        }
    }

    fn node(id: &str) -> NodeSpec {
        NodeSpec {
            id: NodeId::new(id),
            step_type: "http_request".to_string(),
            config: json!({"url": "https://example.com"}),
            required_inputs: vec![],
            requires_approval: false,
            on_failure: FailurePolicy::HaltOnError,
            timeout_secs: Some(30),
        }
    }

    fn edge(from: &str, to: &str) -> EdgeSpec {
        EdgeSpec {
            from: NodeId::new(from),
            to: NodeId::new(to),
            condition: None,
        }
    }

    fn graph(nodes: Vec<NodeSpec>, edges: Vec<EdgeSpec>) -> WorkflowGraph {
        let graph = WorkflowGraph {
            id: WorkflowId::new(),
            version: 1,
            name: "test".to_string(),
            nodes,
            edges,
            max_retries: None,
            retry_delay_secs: Some(0),
        };
        // Every test graph must pass the same gate production graphs do
        validate(&graph, &StepRegistry::with_builtin()).expect("test graph must validate");
        graph
    }

    async fn wait_terminal(
        events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
        run_id: RunId,
    ) -> EventKind {
        tokio::time::timeout(Duration::from_secs(864_000), async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if event.run_id != run_id {
                    continue;
                }
                match event.kind {
                    EventKind::RunCompleted { .. }
                    | EventKind::RunFailed { .. }
                    | EventKind::RunCancelled { .. } => return event.kind,
                    _ => {}
                }
            }
        })
        .await
        .expect("run did not reach a terminal state")
    }

    async fn wait_waiting_approval(
        events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
        run_id: RunId,
    ) -> crate::types::GateId {
        tokio::time::timeout(Duration::from_secs(864_000), async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if event.run_id != run_id {
                    continue;
                }
                if let EventKind::RunWaitingApproval { gate_id, .. } = event.kind {
                    return gate_id;
                }
            }
        })
        .await
        .expect("run did not reach waiting_approval")
    }

    #[tokio::test(start_paused = true)]
    async fn linear_graph_completes_with_outputs_keyed_by_node() {
        let runner = MapRunner::new();
        let mut h = harness(runner.clone());

        let g = graph(
            vec![node("a"), node("b"), node("c")],
            vec![edge("a", "b"), edge("b", "c")],
        );
        let run_id = h
            .engine
            .start_run_of(g, TriggerReason::Manual)
            .unwrap();

        let terminal = wait_terminal(&mut h.events, run_id).await;
        assert!(matches!(terminal, EventKind::RunCompleted { .. }));

        let run = h.engine.store().get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        for key in ["a", "b", "c"] {
            assert_eq!(run.working_data.get(key), Some(&json!({"done": key})));
        }
        assert_eq!(runner.calls(), vec!["a", "b", "c"]);
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn approval_gate_pauses_and_resumes_the_run() {
        let runner = MapRunner::new();
        let mut h = harness(runner.clone());

        let mut approval_node = node("b");
        approval_node.requires_approval = true;
        let g = graph(vec![node("a"), approval_node], vec![edge("a", "b")]);
        let run_id = h.engine.start_run_of(g, TriggerReason::Manual).unwrap();

        let gate_id = wait_waiting_approval(&mut h.events, run_id).await;

        // Only a has executed; b is parked behind the gate
        assert_eq!(runner.calls(), vec!["a"]);
        let snapshot = h.engine.run_snapshot(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::WaitingApproval);
        let pending = snapshot.pending_gate.expect("pending gate surfaced");
        assert_eq!(pending.gate_id, gate_id);
        assert_eq!(pending.node_id, NodeId::new("b"));

        h.engine
            .record_approval_decision(
                gate_id,
                GateRuling {
                    decision: GateDecision::Approved,
                    decided_by: "ops".to_string(),
                    note: None,
                    override_output: None,
                },
            )
            .await
            .unwrap();

        let terminal = wait_terminal(&mut h.events, run_id).await;
        assert!(matches!(terminal, EventKind::RunCompleted { .. }));
        assert_eq!(runner.calls(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_gate_fails_the_step_without_retries() {
        let runner = MapRunner::new();
        let mut h = harness(runner.clone());

        let mut approval_node = node("b");
        approval_node.requires_approval = true;
        let g = graph(vec![node("a"), approval_node], vec![edge("a", "b")]);
        let run_id = h.engine.start_run_of(g, TriggerReason::Manual).unwrap();

        let gate_id = wait_waiting_approval(&mut h.events, run_id).await;
        h.engine
            .record_approval_decision(
                gate_id,
                GateRuling {
                    decision: GateDecision::Rejected,
                    decided_by: "ops".to_string(),
                    note: Some("not today".to_string()),
                    override_output: None,
                },
            )
            .await
            .unwrap();

        let terminal = wait_terminal(&mut h.events, run_id).await;
        assert!(matches!(terminal, EventKind::RunFailed { .. }));

        let snapshot = h.engine.run_snapshot(run_id).unwrap();
        let failure = snapshot.first_failure.expect("failed step surfaced");
        assert_eq!(failure.node_id, NodeId::new("b"));
        assert_eq!(failure.error_kind, Some(StepErrorKind::ApprovalRejected));
        // b was never dispatched
        assert_eq!(runner.calls(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn overridden_gate_merges_replacement_output() {
        let runner = MapRunner::new();
        let mut h = harness(runner.clone());

        let mut approval_node = node("b");
        approval_node.requires_approval = true;
        let g = graph(
            vec![node("a"), approval_node, node("c")],
            vec![edge("a", "b"), edge("b", "c")],
        );
        let run_id = h.engine.start_run_of(g, TriggerReason::Manual).unwrap();

        let gate_id = wait_waiting_approval(&mut h.events, run_id).await;
        h.engine
            .record_approval_decision(
                gate_id,
                GateRuling {
                    decision: GateDecision::Overridden,
                    decided_by: "ops".to_string(),
                    note: None,
                    override_output: Some(json!({"patched": true})),
                },
            )
            .await
            .unwrap();

        let terminal = wait_terminal(&mut h.events, run_id).await;
        assert!(matches!(terminal, EventKind::RunCompleted { .. }));

        let run = h.engine.store().get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.working_data.get("b"), Some(&json!({"patched": true})));
        // b itself never executed; c ran with the override upstream
        assert_eq!(runner.calls(), vec!["a", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn step_that_fails_twice_succeeds_on_third_attempt() {
        let runner = MapRunner::new().script("b", vec![failure(), failure(), success(json!(1))]);
        let mut h = harness(runner);

        let mut g = graph(vec![node("a"), node("b")], vec![edge("a", "b")]);
        g.max_retries = Some(3);
        let run_id = h.engine.start_run_of(g, TriggerReason::Manual).unwrap();

        let terminal = wait_terminal(&mut h.events, run_id).await;
        assert!(matches!(terminal, EventKind::RunCompleted { .. }));

        let run = h.engine.store().get_run(&run_id).unwrap().unwrap();
        let step = run.step(&NodeId::new("b")).unwrap();
        assert_eq!(step.attempt, 3);
        assert_eq!(step.status, StepStatus::Succeeded);
        assert_eq!(run.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_run_and_surface_the_step() {
        let runner = MapRunner::new().script("b", vec![failure(); 10]);
        let mut h = harness(runner);

        let mut g = graph(vec![node("a"), node("b")], vec![edge("a", "b")]);
        g.max_retries = Some(2);
        let run_id = h.engine.start_run_of(g, TriggerReason::Manual).unwrap();

        let terminal = wait_terminal(&mut h.events, run_id).await;
        assert!(matches!(terminal, EventKind::RunFailed { .. }));

        let snapshot = h.engine.run_snapshot(run_id).unwrap();
        let failure = snapshot.first_failure.expect("failed step surfaced");
        assert_eq!(failure.node_id, NodeId::new("b"));
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.error_kind, Some(StepErrorKind::ExecutorFailure));
    }

    #[tokio::test(start_paused = true)]
    async fn false_edge_condition_skips_the_branch() {
        let runner = MapRunner::new().script("a", vec![success(json!({"score": 1}))]);
        let mut h = harness(runner.clone());

        let mut to_b = edge("a", "b");
        to_b.condition = Some("a.score > 5".to_string());
        let g = graph(
            vec![node("a"), node("b"), node("c")],
            vec![to_b, edge("a", "c")],
        );
        let run_id = h.engine.start_run_of(g, TriggerReason::Manual).unwrap();

        let terminal = wait_terminal(&mut h.events, run_id).await;
        assert!(matches!(terminal, EventKind::RunCompleted { .. }));

        let run = h.engine.store().get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.step(&NodeId::new("b")).unwrap().status, StepStatus::Skipped);
        assert_eq!(run.step(&NodeId::new("c")).unwrap().status, StepStatus::Succeeded);
        assert_eq!(runner.calls(), vec!["a", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn continue_on_error_skips_dependents_and_completes() {
        let runner = MapRunner::new().script("a", vec![failure(); 10]);
        let mut h = harness(runner);

        let mut tolerant = node("a");
        tolerant.on_failure = FailurePolicy::ContinueOnError;
        let mut g = graph(
            vec![tolerant, node("b"), node("c")],
            vec![edge("a", "b")],
        );
        g.max_retries = Some(0);
        let run_id = h.engine.start_run_of(g, TriggerReason::Manual).unwrap();

        let terminal = wait_terminal(&mut h.events, run_id).await;
        assert!(matches!(terminal, EventKind::RunCompleted { .. }));

        let run = h.engine.store().get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.step(&NodeId::new("a")).unwrap().status, StepStatus::Failed);
        assert_eq!(run.step(&NodeId::new("b")).unwrap().status, StepStatus::Skipped);
        assert_eq!(run.step(&NodeId::new("c")).unwrap().status, StepStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_skips_pending_steps() {
        let runner = MapRunner::new();
        let mut h = harness(runner);

        let mut approval_node = node("b");
        approval_node.requires_approval = true;
        let g = graph(vec![node("a"), approval_node], vec![edge("a", "b")]);
        let run_id = h.engine.start_run_of(g, TriggerReason::Manual).unwrap();

        // Park the run on the gate, then cancel instead of deciding
        wait_waiting_approval(&mut h.events, run_id).await;
        h.engine.cancel_run(run_id).unwrap();

        let terminal = wait_terminal(&mut h.events, run_id).await;
        assert!(matches!(terminal, EventKind::RunCancelled { .. }));

        let run = h.engine.store().get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.step(&NodeId::new("b")).unwrap().status, StepStatus::Skipped);

        // A finished run cannot be cancelled again
        assert!(matches!(
            h.engine.cancel_run(run_id),
            Err(crate::error::RunError::NotCancellable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_runs_produce_identical_step_records() {
        let g = graph(
            vec![node("a"), node("b"), node("c"), node("d")],
            vec![edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
        );

        let mut records = Vec::new();
        for _ in 0..2 {
            let runner = MapRunner::new();
            let mut h = harness(runner);
            let run_id = h
                .engine
                .start_run_of(g.clone(), TriggerReason::Manual)
                .unwrap();
            wait_terminal(&mut h.events, run_id).await;

            let run = h.engine.store().get_run(&run_id).unwrap().unwrap();
            records.push(
                run.steps
                    .iter()
                    .map(|s| (s.node_id.clone(), s.status, s.attempt))
                    .collect::<Vec<_>>(),
            );
        }
        assert_eq!(records[0], records[1]);
    }
}

use crate::graph::ValidatedGraph;
use crate::types::{
    ApprovalGate, GateDecision, GateId, Run, RunId, RunStatus, TriggerRecord, WorkflowId,
    WorkflowRecord,
};
use anyhow::{Context, Result};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const TRIGGERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("triggers");
const GATES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("approval_gates");

/// History store backed by redb: runs (with frozen graphs and step
/// executions), published workflow versions, active triggers, and
/// approval gates.
///
/// Append-mostly; writes for different runs can proceed concurrently,
/// while mutation of a single run is funneled through its lease holder.
#[derive(Clone)]
pub struct RunStore {
    db: Arc<Database>,
}

impl RunStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create store directory")?;
        }

        let db = Database::create(&path).context("failed to create redb database")?;

        let write_txn = db.begin_write().context("failed to begin write transaction")?;
        {
            write_txn.open_table(RUNS_TABLE).context("failed to open runs table")?;
            write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("failed to open workflows table")?;
            write_txn
                .open_table(TRIGGERS_TABLE)
                .context("failed to open triggers table")?;
            write_txn.open_table(GATES_TABLE).context("failed to open gates table")?;
        }
        write_txn.commit().context("failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
        value: &impl serde::Serialize,
    ) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut t = write_txn.open_table(table).context("failed to open table")?;
            let bytes = serde_json::to_vec(value).context("failed to serialize record")?;
            t.insert(key, bytes.as_slice()).context("failed to insert record")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
    ) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let t = read_txn.open_table(table).context("failed to open table")?;
        match t.get(key).context("failed to read record")? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value())
                    .context("failed to deserialize record")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> Result<Vec<(String, T)>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let t = read_txn.open_table(table).context("failed to open table")?;

        let mut records = Vec::new();
        for item in t.iter().context("failed to iterate table")? {
            let (key, value) = item.context("failed to read item")?;
            let record =
                serde_json::from_slice(value.value()).context("failed to deserialize record")?;
            records.push((key.value().to_string(), record));
        }
        Ok(records)
    }

    // --- Runs ---

    pub fn put_run(&self, run: &Run) -> Result<()> {
        self.put(RUNS_TABLE, &run.id.to_string(), run)
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.get(RUNS_TABLE, &run_id.to_string())
    }

    /// Most recent runs first
    pub fn list_runs(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.scan(RUNS_TABLE)?.into_iter().map(|(_, r)| r).collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    pub fn update_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<()> {
        let mut run = self.get_run(run_id)?.context("run not found")?;
        run.status = status;
        if status.is_terminal() {
            run.ended_at = Some(Utc::now());
        }
        self.put_run(&run)
    }

    // --- Workflows ---

    fn workflow_key(id: &WorkflowId, version: u32) -> String {
        // Zero-padded so lexicographic order matches version order
        format!("{id}:{version:010}")
    }

    /// Publish a validated graph as the next version of its workflow.
    /// Only validated graphs can be stored as active.
    pub fn publish_workflow(&self, validated: &ValidatedGraph) -> Result<WorkflowRecord> {
        let mut graph = validated.graph.clone();
        graph.version = self.latest_workflow(&graph.id)?.map(|r| r.graph.version + 1).unwrap_or(1);

        let record = WorkflowRecord {
            digest: graph.digest(),
            published_at: Utc::now(),
            graph,
        };
        self.put(
            WORKFLOWS_TABLE,
            &Self::workflow_key(&record.graph.id, record.graph.version),
            &record,
        )?;
        tracing::info!(
            "published workflow {} v{}",
            record.graph.id,
            record.graph.version
        );
        Ok(record)
    }

    pub fn get_workflow(&self, id: &WorkflowId, version: u32) -> Result<Option<WorkflowRecord>> {
        self.get(WORKFLOWS_TABLE, &Self::workflow_key(id, version))
    }

    pub fn latest_workflow(&self, id: &WorkflowId) -> Result<Option<WorkflowRecord>> {
        let prefix = format!("{id}:");
        let mut latest: Option<WorkflowRecord> = None;
        for (key, record) in self.scan::<WorkflowRecord>(WORKFLOWS_TABLE)? {
            if key.starts_with(&prefix) {
                match &latest {
                    Some(current) if current.graph.version >= record.graph.version => {}
                    _ => latest = Some(record),
                }
            }
        }
        Ok(latest)
    }

    /// Latest version of every workflow
    pub fn list_workflows(&self) -> Result<Vec<WorkflowRecord>> {
        let mut by_id: std::collections::HashMap<WorkflowId, WorkflowRecord> =
            std::collections::HashMap::new();
        for (_, record) in self.scan::<WorkflowRecord>(WORKFLOWS_TABLE)? {
            let entry = by_id.entry(record.graph.id).or_insert_with(|| record.clone());
            if record.graph.version > entry.graph.version {
                *entry = record;
            }
        }
        let mut records: Vec<_> = by_id.into_values().collect();
        records.sort_by(|a, b| a.graph.name.cmp(&b.graph.name));
        Ok(records)
    }

    /// Remove a workflow's versions and trigger. Historical runs keep
    /// their frozen graphs and are not touched.
    pub fn delete_workflow(&self, id: &WorkflowId) -> Result<()> {
        let prefix = format!("{id}:");
        let keys: Vec<String> = self
            .scan::<WorkflowRecord>(WORKFLOWS_TABLE)?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&prefix))
            .collect();

        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut workflows = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("failed to open workflows table")?;
            for key in keys {
                workflows.remove(key.as_str()).context("failed to remove version")?;
            }
            let mut triggers = write_txn
                .open_table(TRIGGERS_TABLE)
                .context("failed to open triggers table")?;
            triggers
                .remove(id.to_string().as_str())
                .context("failed to remove trigger")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    // --- Triggers ---

    /// Store the active trigger for a workflow, atomically superseding
    /// any previous one.
    pub fn set_trigger(&self, record: &TriggerRecord) -> Result<()> {
        self.put(TRIGGERS_TABLE, &record.workflow_id.to_string(), record)
    }

    pub fn get_trigger(&self, workflow_id: &WorkflowId) -> Result<Option<TriggerRecord>> {
        self.get(TRIGGERS_TABLE, &workflow_id.to_string())
    }

    pub fn list_triggers(&self) -> Result<Vec<TriggerRecord>> {
        Ok(self.scan(TRIGGERS_TABLE)?.into_iter().map(|(_, t)| t).collect())
    }

    // --- Approval gates ---

    pub fn put_gate(&self, gate: &ApprovalGate) -> Result<()> {
        self.put(GATES_TABLE, &gate.id.to_string(), gate)
    }

    pub fn get_gate(&self, gate_id: &GateId) -> Result<Option<ApprovalGate>> {
        self.get(GATES_TABLE, &gate_id.to_string())
    }

    pub fn pending_gates(&self) -> Result<Vec<ApprovalGate>> {
        let mut gates: Vec<ApprovalGate> = self
            .scan::<ApprovalGate>(GATES_TABLE)?
            .into_iter()
            .map(|(_, g)| g)
            .filter(|g| g.decision == GateDecision::Pending)
            .collect();
        gates.sort_by_key(|g| g.requested_at);
        Ok(gates)
    }

    /// The undecided gate currently holding a run, if any
    pub fn pending_gate_for_run(&self, run_id: &RunId) -> Result<Option<ApprovalGate>> {
        Ok(self
            .pending_gates()?
            .into_iter()
            .find(|g| g.run_id == *run_id))
    }

    /// The most recent gate for a node in a run, decided or not
    pub fn gate_for_step(&self, run_id: &RunId, node_id: &crate::types::NodeId) -> Result<Option<ApprovalGate>> {
        let mut gates: Vec<ApprovalGate> = self
            .scan::<ApprovalGate>(GATES_TABLE)?
            .into_iter()
            .map(|(_, g)| g)
            .filter(|g| g.run_id == *run_id && g.node_id == *node_id)
            .collect();
        gates.sort_by_key(|g| g.requested_at);
        Ok(gates.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::validate;
    use crate::registry::StepRegistry;
    use crate::types::{EdgeSpec, FailurePolicy, NodeId, NodeSpec, TriggerReason, WorkflowGraph};
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, RunStore) {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new(temp.path().join("trellis.redb")).unwrap();
        (temp, store)
    }

    fn sample_graph() -> WorkflowGraph {
        WorkflowGraph {
            id: WorkflowId::new(),
            version: 0,
            name: "sample".to_string(),
            nodes: vec![
                NodeSpec {
                    id: NodeId::new("a"),
                    step_type: "transform".to_string(),
                    config: json!({"operation": "noop"}),
                    required_inputs: vec![],
                    requires_approval: false,
                    on_failure: FailurePolicy::HaltOnError,
                    timeout_secs: None,
                },
                NodeSpec {
                    id: NodeId::new("b"),
                    step_type: "email".to_string(),
                    config: json!({}),
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

    fn sample_run(graph: &WorkflowGraph) -> Run {
        Run {
            id: RunId::new(),
            workflow_id: graph.id,
            workflow_version: graph.version,
            trigger_reason: TriggerReason::Manual,
            status: RunStatus::Queued,
            started_at: Utc::now(),
            ended_at: None,
            working_data: Default::default(),
            retry_count: 0,
            steps: graph
                .nodes
                .iter()
                .map(|n| crate::types::StepExecution::pending(n.id.clone()))
                .collect(),
            graph: graph.clone(),
        }
    }

    #[test]
    fn run_round_trip() {
        let (_temp, store) = store();
        let graph = sample_graph();
        let run = sample_run(&graph);

        store.put_run(&run).unwrap();
        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.graph.digest(), graph.digest());
    }

    #[test]
    fn publish_assigns_monotonic_versions() {
        let (_temp, store) = store();
        let registry = StepRegistry::with_builtin();
        let graph = sample_graph();

        let validated = validate(&graph, &registry).unwrap();
        let first = store.publish_workflow(&validated).unwrap();
        assert_eq!(first.graph.version, 1);

        let second = store.publish_workflow(&validated).unwrap();
        assert_eq!(second.graph.version, 2);

        let latest = store.latest_workflow(&graph.id).unwrap().unwrap();
        assert_eq!(latest.graph.version, 2);
        assert!(store.get_workflow(&graph.id, 1).unwrap().is_some());
    }

    #[test]
    fn deleting_a_workflow_keeps_its_runs() {
        let (_temp, store) = store();
        let registry = StepRegistry::with_builtin();
        let graph = sample_graph();

        let validated = validate(&graph, &registry).unwrap();
        let published = store.publish_workflow(&validated).unwrap();
        let run = sample_run(&published.graph);
        store.put_run(&run).unwrap();

        store.delete_workflow(&graph.id).unwrap();
        assert!(store.latest_workflow(&graph.id).unwrap().is_none());

        // The run still carries its frozen graph
        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.graph.nodes.len(), 2);
    }

    #[test]
    fn trigger_replacement_is_atomic() {
        let (_temp, store) = store();
        let workflow_id = WorkflowId::new();

        store
            .set_trigger(&TriggerRecord {
                workflow_id,
                trigger: crate::types::Trigger::Manual,
                next_fire: None,
                updated_at: Utc::now(),
            })
            .unwrap();
        store
            .set_trigger(&TriggerRecord {
                workflow_id,
                trigger: crate::types::Trigger::Event {
                    source_id: "hook".to_string(),
                },
                next_fire: None,
                updated_at: Utc::now(),
            })
            .unwrap();

        let current = store.get_trigger(&workflow_id).unwrap().unwrap();
        assert!(matches!(current.trigger, crate::types::Trigger::Event { .. }));
        assert_eq!(store.list_triggers().unwrap().len(), 1);
    }

    #[test]
    fn pending_gates_filter_and_order() {
        let (_temp, store) = store();
        let run_id = RunId::new();

        let mut gate = ApprovalGate {
            id: GateId::new(),
            run_id,
            node_id: NodeId::new("approve_me"),
            requested_at: Utc::now(),
            decision: GateDecision::Pending,
            decided_by: None,
            decided_at: None,
            note: None,
            override_output: None,
        };
        store.put_gate(&gate).unwrap();

        assert_eq!(store.pending_gates().unwrap().len(), 1);
        assert!(store.pending_gate_for_run(&run_id).unwrap().is_some());

        gate.decision = GateDecision::Approved;
        store.put_gate(&gate).unwrap();
        assert!(store.pending_gate_for_run(&run_id).unwrap().is_none());
        assert!(store
            .gate_for_step(&run_id, &NodeId::new("approve_me"))
            .unwrap()
            .is_some());
    }
}

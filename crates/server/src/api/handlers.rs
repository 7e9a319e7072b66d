use super::{ApiResult, ErrorResponse};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trellis_core::error::GraphWarning;
use trellis_core::events::EventLog;
use trellis_core::graph::validate;
use trellis_core::types::{
    ApprovalGate, EdgeSpec, GateId, GateRuling, NodeSpec, RunId, RunSnapshot, RunStatus, Trigger,
    TriggerReason, WorkflowGraph, WorkflowId,
};

fn parse_uuid(raw: &str, what: &str) -> Result<uuid::Uuid, anyhow::Error> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("invalid {what} id: {raw}"))
}

// --- Workflows ---

#[derive(Debug, Deserialize)]
pub struct PublishWorkflowRequest {
    /// Omitted for a brand-new workflow; set to version an existing one
    pub workflow_id: Option<WorkflowId>,
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PublishWorkflowResponse {
    pub workflow_id: WorkflowId,
    pub version: u32,
    pub digest: String,
    pub warnings: Vec<String>,
}

/// Validate and publish a workflow graph. Both the visual editor and
/// the generation service land here; there is no path that skips
/// validation.
pub async fn publish_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PublishWorkflowRequest>,
) -> Response {
    let graph = WorkflowGraph {
        id: req.workflow_id.unwrap_or_default(),
        version: 0,
        name: req.name,
        nodes: req.nodes,
        edges: req.edges,
        max_retries: req.max_retries,
        retry_delay_secs: req.retry_delay_secs,
    };

    let validated = match validate(&graph, &state.registry) {
        Ok(validated) => validated,
        Err(errors) => {
            let response = ErrorResponse {
                error: "graph validation failed".to_string(),
                details: Some(serde_json::json!(errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>())),
            };
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(response)).into_response();
        }
    };

    match state.store.publish_workflow(&validated) {
        Ok(record) => Json(PublishWorkflowResponse {
            workflow_id: record.graph.id,
            version: record.graph.version,
            digest: record.digest,
            warnings: validated
                .warnings
                .iter()
                .map(GraphWarning::to_string)
                .collect(),
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(e.to_string())),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub version: u32,
    pub digest: String,
    pub published_at: DateTime<Utc>,
}

pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<WorkflowSummary>>> {
    let workflows = state.store.list_workflows()?;
    Ok(Json(
        workflows
            .into_iter()
            .map(|r| WorkflowSummary {
                workflow_id: r.graph.id,
                name: r.graph.name.clone(),
                version: r.graph.version,
                digest: r.digest,
                published_at: r.published_at,
            })
            .collect(),
    ))
}

/// Install or atomically replace a workflow's trigger.
pub async fn set_trigger(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(trigger): Json<Trigger>,
) -> ApiResult<Json<serde_json::Value>> {
    let workflow_id = WorkflowId(parse_uuid(&workflow_id, "workflow")?);

    state
        .store
        .latest_workflow(&workflow_id)?
        .ok_or_else(|| trellis_core::error::RunError::WorkflowNotFound(workflow_id.to_string()))?;

    let record = state.scheduler.set_trigger(workflow_id, trigger)?;
    Ok(Json(serde_json::json!({
        "workflow_id": record.workflow_id,
        "next_fire": record.next_fire,
    })))
}

// --- Runs ---

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub workflow_id: WorkflowId,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: RunId,
}

pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRunRequest>,
) -> ApiResult<Json<StartRunResponse>> {
    let run_id = state
        .engine
        .start_run(req.workflow_id, TriggerReason::Manual)?;
    Ok(Json(StartRunResponse { run_id }))
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

pub async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<RunSummary>>> {
    let runs = state.store.list_runs()?;
    Ok(Json(
        runs.into_iter()
            .map(|r| RunSummary {
                run_id: r.id,
                workflow_id: r.workflow_id,
                workflow_version: r.workflow_version,
                status: r.status,
                started_at: r.started_at,
                ended_at: r.ended_at,
            })
            .collect(),
    ))
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSnapshot>> {
    let run_id = RunId(parse_uuid(&run_id, "run")?);
    Ok(Json(state.engine.run_snapshot(run_id)?))
}

pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<StatusCode> {
    let run_id = RunId(parse_uuid(&run_id, "run")?);
    state.engine.cancel_run(run_id)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
pub struct RunEventsResponse {
    pub events: Vec<trellis_core::events::EngineEvent>,
}

pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunEventsResponse>> {
    let run_id = RunId(parse_uuid(&run_id, "run")?);
    let events = state.event_log.run_events(run_id).await?;
    Ok(Json(RunEventsResponse { events }))
}

// --- Approvals ---

pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<ApprovalGate>>> {
    Ok(Json(state.engine.pending_approvals()?))
}

pub async fn record_decision(
    State(state): State<Arc<AppState>>,
    Path(gate_id): Path<String>,
    Json(ruling): Json<GateRuling>,
) -> ApiResult<StatusCode> {
    let gate_id = GateId(parse_uuid(&gate_id, "gate")?);
    state.engine.record_approval_decision(gate_id, ruling).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Event sources ---

#[derive(Debug, Serialize)]
pub struct NotifyEventResponse {
    pub run_ids: Vec<RunId>,
}

/// External event notification: create a run for every workflow bound
/// to this source.
pub async fn notify_event(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<String>,
) -> ApiResult<Json<NotifyEventResponse>> {
    let run_ids = state.scheduler.notify_event(&source_id);
    Ok(Json(NotifyEventResponse { run_ids }))
}

//! Step executor adapters. Each side-effecting step type (email, chat,
//! social posting) is ultimately served by an integration supplied by
//! the surrounding application; this module is where those adapters are
//! wired in. The stub implementations simulate the external call and
//! echo a plausible response shape so workflows can be exercised
//! end-to-end without live credentials.

use serde_json::json;
use trellis_core::engine::{StepContext, StepOutcome, StepRunner};
use trellis_core::types::StepErrorKind;

pub struct AdapterRunner;

impl AdapterRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AdapterRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StepRunner for AdapterRunner {
    async fn execute(&self, ctx: StepContext) -> anyhow::Result<StepOutcome> {
        tracing::info!(
            "dispatching {} step {} (attempt {}) for run {}",
            ctx.step_type,
            ctx.node_id,
            ctx.attempt,
            ctx.run_id
        );

        let output = match ctx.step_type.as_str() {
            "ai_agent" => json!({
                "result": format!("agent response for node {}", ctx.node_id),
            }),
            "email" => json!({
                "message_id": uuid::Uuid::new_v4().to_string(),
            }),
            "slack_message" => json!({
                "ts": chrono::Utc::now().timestamp_millis().to_string(),
            }),
            "social_post" => json!({
                "post_id": uuid::Uuid::new_v4().to_string(),
            }),
            "web_scrape" | "http_request" => json!({
                "status": 200,
                "body": {},
            }),
            "transform" => json!({
                "result": ctx.input,
            }),
            other => {
                return Ok(StepOutcome::Failure {
                    error_kind: StepErrorKind::InvalidInput,
                    message: format!("no adapter registered for step type {other}"),
                })
            }
        };

        Ok(StepOutcome::Success { output })
    }
}

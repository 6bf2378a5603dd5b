use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use crate::error::EngineError;
use crate::trigger::{RunOutcome, WebhookHeaders};

use super::AppState;

#[derive(Serialize)]
#[serde(tag = "status")]
pub enum WebhookResponse {
    #[serde(rename = "dispatched")]
    Dispatched { task_id: String, branch: String },
    #[serde(rename = "queued")]
    Queued { queue_length: usize, branch: String },
    #[serde(rename = "accepted")]
    Accepted,
}

impl From<Option<RunOutcome>> for WebhookResponse {
    fn from(outcome: Option<RunOutcome>) -> Self {
        match outcome {
            Some(RunOutcome::Dispatched { task_id, branch }) => WebhookResponse::Dispatched { task_id, branch },
            Some(RunOutcome::Queued { queue_length, branch }) => WebhookResponse::Queued { queue_length, branch },
            None => WebhookResponse::Accepted,
        }
    }
}

pub async fn receive(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<WebhookResponse>, EngineError> {
    let github_signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok());
    let gitlab_token = headers.get("X-Gitlab-Token").and_then(|v| v.to_str().ok());
    let gitee_token = headers.get("X-Gitee-Token").and_then(|v| v.to_str().ok());

    let webhook_headers = WebhookHeaders {
        github_signature,
        gitlab_token,
        gitee_token,
    };

    let outcome = state.router.handle_webhook(&token, &webhook_headers, &body).await?;
    Ok(Json(outcome.into()))
}

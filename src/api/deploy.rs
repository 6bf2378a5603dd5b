use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::{DeployTaskRecord, DeployStatus};
use crate::error::EngineError;

use super::AppState;

#[derive(Serialize)]
pub struct DeployTaskView {
    pub task_id: String,
    pub app_name: String,
    pub status: DeployStatus,
    pub targets: Vec<crate::deploy::TargetState>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<DeployTaskRecord> for DeployTaskView {
    fn from(record: DeployTaskRecord) -> Self {
        let status = record.status();
        DeployTaskView {
            task_id: record.task_id,
            app_name: record.config.app.name,
            status,
            targets: record.targets,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<DeployTaskView>> {
    Json(state.deploy_tasks.list().into_iter().map(DeployTaskView::from).collect())
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<DeployTaskView>, EngineError> {
    state
        .deploy_tasks
        .get(&id)
        .map(|r| Json(r.into()))
        .ok_or_else(|| EngineError::NotFound(format!("deploy task `{id}`")))
}

#[derive(Deserialize)]
pub struct CreateDeployTaskRequest {
    pub config_content: String,
    /// Accepted but not yet consumed by this endpoint's C7 validation path
    /// — substitution into `config_content` belongs to the caller.
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateDeployTaskRequest>,
) -> Result<Json<DeployTaskView>, EngineError> {
    let _ = (&req.registry, &req.tag);
    let task_id = Uuid::new_v4().to_string();
    let record = state.deploy_tasks.create(task_id, req.config_content)?;
    Ok(Json(record.into()))
}

pub async fn import(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<DeployTaskView>, EngineError> {
    let mut config_content = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EngineError::Validation(format!("invalid multipart body: {e}")))?
    {
        let bytes = field
            .bytes()
            .await
            .map_err(|e| EngineError::Validation(format!("reading upload: {e}")))?;
        config_content = Some(String::from_utf8_lossy(&bytes).into_owned());
    }
    let config_content =
        config_content.ok_or_else(|| EngineError::Validation("no file part in multipart upload".to_string()))?;

    let task_id = Uuid::new_v4().to_string();
    let record = state.deploy_tasks.create(task_id, config_content)?;
    Ok(Json(record.into()))
}

#[derive(Serialize)]
pub struct ExecuteResponse {
    pub task_id: String,
    pub status: &'static str,
}

pub async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecuteResponse>, EngineError> {
    if state.deploy_tasks.get(&id).is_none() {
        return Err(EngineError::NotFound(format!("deploy task `{id}`")));
    }
    let executor = state.deploy_executor.clone();
    let semaphore = state.deploy_semaphore.clone();
    let task_id = id.clone();
    tokio::spawn(async move {
        let _permit = match &semaphore {
            Some(s) => Some(s.clone().acquire_owned().await),
            None => None,
        };
        executor.run(task_id).await;
    });
    Ok(Json(ExecuteResponse { task_id: id, status: "running" }))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> Result<(), EngineError> {
    if state.deploy_tasks.delete(&id) {
        Ok(())
    } else {
        Err(EngineError::NotFound(format!("deploy task `{id}`")))
    }
}

pub async fn export(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, EngineError> {
    let yaml = state
        .deploy_tasks
        .export_yaml(&id)
        .ok_or_else(|| EngineError::NotFound(format!("deploy task `{id}`")))?;
    Ok(([(header::CONTENT_TYPE, "application/x-yaml")], yaml))
}

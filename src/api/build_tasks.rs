use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;

use crate::build::BuildTask;
use crate::error::EngineError;

use super::AppState;

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<BuildTask>, EngineError> {
    state
        .build_tasks
        .get(&id)
        .map(Json)
        .ok_or_else(|| EngineError::NotFound(format!("build task `{id}`")))
}

/// Stream the task's log file back as `text/plain`. The log is an
/// append-only file written line-by-line by the builder while the task
/// runs, so this just reads whatever has accumulated so far.
pub async fn logs(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, EngineError> {
    if state.build_tasks.get(&id).is_none() {
        return Err(EngineError::NotFound(format!("build task `{id}`")));
    }
    let path = state.build_tasks.log_path(&id);
    let content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], content))
}

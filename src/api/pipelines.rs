use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::pipeline::model::{
    BranchStrategy, BranchTagRule, Pipeline, ProjectType, PushMode, ResourcePackageConfig, ServicePushConfig,
};
use crate::trigger::RunOutcome;

use super::AppState;

/// The user-settable subset of `Pipeline` (spec §3). Engine-maintained
/// fields (`stats`, timestamps) are never accepted from a request body —
/// "dynamic request bodies map to explicit configuration structs... never
/// silently merged into internal state" (spec §9).
#[derive(Deserialize)]
pub struct PipelineInput {
    #[serde(default)]
    pub pipeline_id: Option<String>,
    pub git_url: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub sub_path: Option<String>,
    pub project_type: ProjectType,
    pub use_project_dockerfile: bool,
    #[serde(default)]
    pub dockerfile_name: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    pub image_name: String,
    pub tag: String,
    #[serde(default)]
    pub push: bool,
    #[serde(default = "default_push_mode")]
    pub push_mode: PushMode,
    #[serde(default)]
    pub selected_services: Vec<String>,
    #[serde(default)]
    pub service_push_config: BTreeMap<String, ServicePushConfig>,
    #[serde(default)]
    pub service_template_params: serde_json::Value,
    #[serde(default)]
    pub resource_package_configs: Vec<ResourcePackageConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_token: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_branch_strategy")]
    pub webhook_branch_strategy: BranchStrategy,
    #[serde(default)]
    pub branch_tag_mapping: Vec<BranchTagRule>,
    #[serde(default)]
    pub cron_expression: Option<String>,
}

fn default_push_mode() -> PushMode {
    PushMode::Single
}

fn default_true() -> bool {
    true
}

fn default_branch_strategy() -> BranchStrategy {
    BranchStrategy::UsePush
}

impl PipelineInput {
    fn into_pipeline(self, id: String) -> Pipeline {
        Pipeline {
            pipeline_id: id,
            git_url: self.git_url,
            source_id: self.source_id,
            branch: self.branch,
            sub_path: self.sub_path,
            project_type: self.project_type,
            use_project_dockerfile: self.use_project_dockerfile,
            dockerfile_name: self.dockerfile_name,
            template: self.template,
            image_name: self.image_name,
            tag: self.tag,
            push: self.push,
            push_mode: self.push_mode,
            selected_services: self.selected_services,
            service_push_config: self.service_push_config,
            service_template_params: self.service_template_params,
            resource_package_configs: self.resource_package_configs,
            enabled: self.enabled,
            webhook_token: self.webhook_token,
            webhook_secret: self.webhook_secret,
            webhook_branch_strategy: self.webhook_branch_strategy,
            branch_tag_mapping: self.branch_tag_mapping,
            cron_expression: self.cron_expression,
            stats: Default::default(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }
}

#[derive(Serialize)]
pub struct PipelineView {
    #[serde(flatten)]
    pub pipeline: Pipeline,
    pub has_queued_tasks: bool,
    pub queue_length: usize,
    pub current_task_status: Option<String>,
}

async fn view_for(state: &AppState, pipeline: Pipeline) -> PipelineView {
    let queue_length = state.scheduler.queue_length(&pipeline.pipeline_id).await;
    let has_queued_tasks = queue_length > 0;
    let current_task_status = if state.scheduler.is_active(&pipeline.pipeline_id).await {
        state
            .build_tasks
            .list_by_pipeline(&pipeline.pipeline_id)
            .into_iter()
            .find(|t| matches!(t.status, crate::build::BuildStatus::Running))
            .map(|t| format!("{:?}", t.status).to_lowercase())
    } else {
        None
    };
    PipelineView {
        pipeline,
        has_queued_tasks,
        queue_length,
        current_task_status,
    }
}

#[derive(Serialize)]
pub struct PipelinesResponse {
    pub pipelines: Vec<PipelineView>,
}

pub async fn list(State(state): State<AppState>) -> Json<PipelinesResponse> {
    let mut views = Vec::new();
    for pipeline in state.pipelines.list() {
        views.push(view_for(&state, pipeline).await);
    }
    Json(PipelinesResponse { pipelines: views })
}

pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<PipelineInput>,
) -> Result<Json<Pipeline>, EngineError> {
    let id = input
        .pipeline_id
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let pipeline = input.into_pipeline(id);
    let created = state
        .pipelines
        .create(pipeline)
        .map_err(EngineError::Validation)?;
    Ok(Json(created))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<PipelineInput>,
) -> Result<Json<Pipeline>, EngineError> {
    let pipeline = input.into_pipeline(id.clone());
    let updated = state
        .pipelines
        .update(&id, pipeline)
        .map_err(EngineError::Validation)?;
    Ok(Json(updated))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> Result<(), EngineError> {
    if state.pipelines.delete(&id) {
        Ok(())
    } else {
        Err(EngineError::NotFound(format!("pipeline `{id}`")))
    }
}

#[derive(Deserialize, Default)]
pub struct RunRequest {
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum RunResponse {
    Dispatched { task_id: String, branch: String },
    Queued { status: &'static str, queue_length: usize, branch: String },
}

impl From<RunOutcome> for RunResponse {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Dispatched { task_id, branch } => RunResponse::Dispatched { task_id, branch },
            RunOutcome::Queued { queue_length, branch } => RunResponse::Queued {
                status: "queued",
                queue_length,
                branch,
            },
        }
    }
}

pub async fn run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RunRequest>>,
) -> Result<Json<RunResponse>, EngineError> {
    let branch = body.and_then(|Json(r)| r.branch);
    let outcome = state.router.handle_manual(&id, branch).await?;
    Ok(Json(outcome.into()))
}

#[derive(Deserialize)]
pub struct TasksQuery {
    pub trigger_source: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Serialize)]
pub struct TasksResponse {
    pub tasks: Vec<crate::build::BuildTask>,
    pub total: usize,
    pub has_more: bool,
}

pub async fn tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TasksQuery>,
) -> Json<TasksResponse> {
    let mut all = state.build_tasks.list_by_pipeline(&id);
    if let Some(source) = &query.trigger_source {
        all.retain(|t| format!("{:?}", t.trigger_source).to_lowercase() == source.to_lowercase());
    }
    if let Some(status) = &query.status {
        all.retain(|t| format!("{:?}", t.status).to_lowercase() == status.to_lowercase());
    }

    let total = all.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(total.max(1)).max(1);
    let page: Vec<_> = all.into_iter().skip(offset).take(limit).collect();
    let has_more = offset + page.len() < total;

    Json(TasksResponse { tasks: page, total, has_more })
}

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::build::template;
use crate::error::EngineError;
use crate::pipeline::ProjectType;
use crate::repo::{BranchesAndTags, ServiceInfo};

use super::AppState;

#[derive(Deserialize)]
pub struct VerifyGitRepoRequest {
    pub git_url: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn verify_git_repo(
    State(state): State<AppState>,
    Json(req): Json<VerifyGitRepoRequest>,
) -> Result<Json<BranchesAndTags>, EngineError> {
    let result = state
        .introspector
        .resolve_branches_and_tags(&req.git_url, req.source_id.as_deref(), req.force)
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct ScanDockerfilesRequest {
    pub git_url: String,
    pub branch: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn scan_dockerfiles(
    State(state): State<AppState>,
    Json(req): Json<ScanDockerfilesRequest>,
) -> Result<Json<Vec<String>>, EngineError> {
    let paths = state
        .introspector
        .scan_dockerfiles(&req.git_url, &req.branch, req.source_id.as_deref(), req.force)
        .await?;
    Ok(Json(paths))
}

#[derive(Deserialize)]
pub struct ParseDockerfileServicesRequest {
    pub git_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub dockerfile_name: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Serialize)]
pub struct ParseDockerfileServicesResponse {
    pub services: Vec<ServiceInfo>,
}

pub async fn parse_dockerfile_services(
    State(state): State<AppState>,
    Json(req): Json<ParseDockerfileServicesRequest>,
) -> Result<Json<ParseDockerfileServicesResponse>, EngineError> {
    let branch = req.branch.filter(|b| !b.is_empty()).unwrap_or_else(|| "main".to_string());
    let services = state
        .introspector
        .analyze_services(&req.git_url, &branch, &req.dockerfile_name, req.source_id.as_deref(), req.force)
        .await?;
    Ok(Json(ParseDockerfileServicesResponse { services }))
}

#[derive(Deserialize)]
pub struct TemplateParamsQuery {
    #[serde(default)]
    pub template: Option<String>,
    pub project_type: ProjectType,
}

#[derive(Serialize)]
pub struct TemplateParamsResponse {
    pub services: Vec<String>,
    pub params: std::collections::BTreeMap<String, String>,
}

/// Advertises the param set the builtin skeleton for `project_type`
/// recognizes. `services` is always empty here — enumerating services
/// requires a scanned Dockerfile, which this endpoint doesn't take one of.
pub async fn template_params(Query(query): Query<TemplateParamsQuery>) -> Json<TemplateParamsResponse> {
    let _ = &query.template;
    Json(TemplateParamsResponse {
        services: Vec::new(),
        params: template::describe_params(query.project_type),
    })
}

mod build_tasks;
mod deploy;
mod pipelines;
mod repo;
mod webhook;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;

use crate::build::{BuildTaskStore, Scheduler};
use crate::config::AppConfig;
use crate::deploy::{DeployTaskStore, Executor as DeployExecutor, HostRegistry};
use crate::pipeline::PipelineStore;
use crate::repo::RepoIntrospector;
use crate::trigger::TriggerRouter;

/// C10: the shared handle every HTTP handler closes over. Cloning is
/// cheap (every field is an `Arc`), matching the teacher's
/// `Orchestrator` being passed around as a shared service object.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipelines: Arc<PipelineStore>,
    pub build_tasks: Arc<BuildTaskStore>,
    pub scheduler: Arc<Scheduler>,
    pub router: Arc<TriggerRouter>,
    pub introspector: Arc<RepoIntrospector>,
    pub deploy_tasks: Arc<DeployTaskStore>,
    pub hosts: Arc<HostRegistry>,
    pub deploy_executor: Arc<DeployExecutor>,
    /// Bounds how many Deploy Tasks may execute at once, per
    /// `AppConfig::deploy_concurrency`. `None` leaves execution unbounded.
    pub deploy_semaphore: Option<Arc<Semaphore>>,
}

/// Build the full `/api` router (spec §6). A thin translation layer —
/// every handler just decodes the request, calls into C1–C9, and encodes
/// the result or `EngineError`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/pipelines", get(pipelines::list).post(pipelines::create))
        .route(
            "/api/pipelines/{id}",
            put(pipelines::update).delete(pipelines::delete),
        )
        .route("/api/pipelines/{id}/run", post(pipelines::run))
        .route("/api/pipelines/{id}/tasks", get(pipelines::tasks))
        .route("/api/build-tasks/{id}", get(build_tasks::get))
        .route("/api/build-tasks/{id}/logs", get(build_tasks::logs))
        .route("/api/webhook/{token}", post(webhook::receive))
        .route("/api/verify-git-repo", post(repo::verify_git_repo))
        .route("/api/git-sources/scan-dockerfiles", post(repo::scan_dockerfiles))
        .route("/api/parse-dockerfile-services", post(repo::parse_dockerfile_services))
        .route("/api/template-params", get(repo::template_params))
        .route("/api/deploy-tasks", get(deploy::list).post(deploy::create))
        .route(
            "/api/deploy-tasks/{id}",
            get(deploy::get).delete(deploy::delete),
        )
        .route("/api/deploy-tasks/import", post(deploy::import))
        .route("/api/deploy-tasks/{id}/execute", post(deploy::execute))
        .route("/api/deploy-tasks/{id}/export", get(deploy::export))
        .route("/healthz", get(|| async { "ok" }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

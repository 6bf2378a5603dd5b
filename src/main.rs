use std::sync::Arc;

use forgebay::api::{self, AppState};
use forgebay::build::{BuildTaskStore, Builder, ResourcePackageStore, Scheduler};
use forgebay::config::AppConfig;
use forgebay::deploy::{DeployTaskStore, Executor as DeployExecutor, HostRegistry, ShellTransport};
use forgebay::pipeline::PipelineStore;
use forgebay::repo::RepoIntrospector;
use forgebay::trigger::{spawn_cron_ticker, TriggerRouter};
use tokio::sync::Semaphore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %format!("{e:#}"), "forgebay exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Arc::new(AppConfig::from_env());
    tracing::info!(data_dir = %config.data_dir.display(), bind_addr = %config.bind_addr, "starting forgebay");

    let pipelines = Arc::new(PipelineStore::load(config.pipelines_dir())?);
    let build_tasks = Arc::new(BuildTaskStore::load(config.build_tasks_dir())?);
    let deploy_tasks = Arc::new(DeployTaskStore::load(config.deploy_tasks_dir())?);
    let hosts = Arc::new(HostRegistry::load(config.hosts_dir())?);
    let packages = Arc::new(ResourcePackageStore::load(config.packages_dir())?);

    // Boot-time recovery: anything still `pending`/`running` belonged to a
    // process that no longer exists.
    let swept = build_tasks.sweep_stale_on_boot()?;
    if swept > 0 {
        tracing::warn!(swept, "marked stale build tasks as failed on boot");
    }

    let builder = Arc::new(Builder::new(build_tasks.clone(), pipelines.clone(), packages));
    let runner: forgebay::build::BuildRunner = {
        let builder = builder.clone();
        Arc::new(move |task_id, cancel| {
            let builder = builder.clone();
            Box::pin(async move { builder.run(task_id, cancel).await })
        })
    };
    let scheduler = Scheduler::new(config.worker_count, build_tasks.clone(), runner);

    let router = Arc::new(TriggerRouter::new(pipelines.clone(), build_tasks.clone(), scheduler.clone()));
    spawn_cron_ticker(router.clone());

    let introspector = Arc::new(RepoIntrospector::new());
    let transport = Arc::new(ShellTransport::default());
    let deploy_executor = Arc::new(DeployExecutor::new(deploy_tasks.clone(), hosts.clone(), transport));
    let deploy_semaphore = config.deploy_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));

    let state = AppState {
        config: config.clone(),
        pipelines,
        build_tasks,
        scheduler: scheduler.clone(),
        router,
        introspector,
        deploy_tasks,
        hosts,
        deploy_executor,
        deploy_semaphore,
    };

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    Ok(())
}

/// Waits for Ctrl+C (or, on Unix, SIGTERM) then drains the Build
/// Scheduler's in-flight workers before letting the process exit.
async fn shutdown_signal(scheduler: Arc<Scheduler>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, draining in-flight builds");
    scheduler.shutdown().await;
}

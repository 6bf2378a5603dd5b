use std::path::PathBuf;

/// Ambient process configuration — distinct from a Pipeline's build
/// configuration or a Deploy Task's YAML body. Loaded from `FORGEBAY_*`
/// environment variables, falling back to defaults for anything unset.
/// No config file, no CLI flags — just the handful of knobs this
/// single-binary server actually needs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root directory for all persisted state (pipelines/, build-tasks/,
    /// deploy-tasks/, hosts/, cache/). See spec §6.
    pub data_dir: PathBuf,
    pub bind_addr: String,
    /// Size of the Build Scheduler's global worker pool (C4's N).
    pub worker_count: usize,
    /// Optional cap on concurrently-running Deploy Task executions.
    /// `None` means unbounded (one executor task per active Deploy Task).
    pub deploy_concurrency: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "0.0.0.0:8080".to_string(),
            worker_count: 4,
            deploy_concurrency: None,
        }
    }
}

impl AppConfig {
    /// Load config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("FORGEBAY_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FORGEBAY_BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = std::env::var("FORGEBAY_WORKERS") {
            if let Ok(n) = v.parse() {
                cfg.worker_count = n;
            }
        }
        if let Ok(v) = std::env::var("FORGEBAY_DEPLOY_CONCURRENCY") {
            cfg.deploy_concurrency = v.parse().ok();
        }

        cfg
    }

    pub fn pipelines_dir(&self) -> PathBuf {
        self.data_dir.join("pipelines")
    }

    pub fn build_tasks_dir(&self) -> PathBuf {
        self.data_dir.join("build-tasks")
    }

    pub fn deploy_tasks_dir(&self) -> PathBuf {
        self.data_dir.join("deploy-tasks")
    }

    pub fn hosts_dir(&self) -> PathBuf {
        self.data_dir.join("hosts")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.data_dir.join("packages")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }
}

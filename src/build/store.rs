use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::Utc;

use super::task::{BuildStatus, BuildTask};

/// CRUD over Build Tasks (C3). One JSON file per task under
/// `{data_dir}/build-tasks/{id}.json`, atomic-rename write, same shape as
/// `PipelineStore`. Logs live out-of-band as append-only files under
/// `{data_dir}/build-tasks/logs/{log_path}`.
pub struct BuildTaskStore {
    dir: PathBuf,
    logs_dir: PathBuf,
    inner: RwLock<BTreeMap<String, BuildTask>>,
}

impl BuildTaskStore {
    pub fn load(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating build-tasks dir {}", dir.display()))?;
        let logs_dir = dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("creating logs dir {}", logs_dir.display()))?;

        let mut tasks = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let task: BuildTask = serde_json::from_str(&content)
                    .with_context(|| format!("parsing {}", path.display()))?;
                tasks.insert(task.task_id.clone(), task);
            }
        }

        Ok(Self {
            dir,
            logs_dir,
            inner: RwLock::new(tasks),
        })
    }

    fn write_through(dir: &std::path::Path, task: &BuildTask) -> Result<()> {
        let path = dir.join(format!("{}.json", task.task_id));
        let tmp_path = dir.join(format!("{}.json.tmp", task.task_id));
        let content = serde_json::to_string_pretty(task)?;
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn log_path(&self, task_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{task_id}.log"))
    }

    pub fn insert(&self, task: BuildTask) -> Result<BuildTask> {
        Self::write_through(&self.dir, &task)?;
        self.inner.write().unwrap().insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    pub fn get(&self, task_id: &str) -> Option<BuildTask> {
        self.inner.read().unwrap().get(task_id).cloned()
    }

    /// Apply `f` to the stored task under the per-task lock and persist
    /// the result. Mirrors the "read-modify-write under a per-task lock"
    /// policy from spec §5.
    pub fn update_with<F>(&self, task_id: &str, f: F) -> Result<Option<BuildTask>, String>
    where
        F: FnOnce(&mut BuildTask) -> Result<(), String>,
    {
        let mut inner = self.inner.write().unwrap();
        let Some(task) = inner.get_mut(task_id) else {
            return Ok(None);
        };
        f(task)?;
        Self::write_through(&self.dir, task).map_err(|e| e.to_string())?;
        Ok(Some(task.clone()))
    }

    pub fn list_by_pipeline(&self, pipeline_id: &str) -> Vec<BuildTask> {
        let mut tasks: Vec<BuildTask> = self
            .inner
            .read()
            .unwrap()
            .values()
            .filter(|t| t.pipeline_id.as_deref() == Some(pipeline_id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub fn list_all(&self) -> Vec<BuildTask> {
        let mut tasks: Vec<BuildTask> = self.inner.read().unwrap().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub fn delete(&self, task_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.remove(task_id).is_some() {
            let _ = std::fs::remove_file(self.dir.join(format!("{task_id}.json")));
            let _ = std::fs::remove_file(self.log_path(task_id));
            true
        } else {
            false
        }
    }

    /// Boot-time sweep: any task left `pending`/`running` from a prior
    /// process lifetime is marked `failed` (spec §4.3, §5).
    pub fn sweep_stale_on_boot(&self) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        let mut swept = 0;
        for task in inner.values_mut() {
            if matches!(task.status, BuildStatus::Pending | BuildStatus::Running) {
                task.status = BuildStatus::Failed;
                task.error = Some("process restarted".to_string());
                task.completed_at = Some(Utc::now());
                Self::write_through(&self.dir, task)?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::task::{TriggerDetails, TriggerSource};

    fn task(id: &str, status: BuildStatus) -> BuildTask {
        BuildTask {
            task_id: id.into(),
            pipeline_id: Some("p1".into()),
            trigger_source: TriggerSource::Manual,
            trigger_info: TriggerDetails::default(),
            branch: "main".into(),
            tag: "latest".into(),
            services: vec![],
            use_project_dockerfile: true,
            dockerfile_name: Some("Dockerfile".into()),
            template: None,
            template_params: serde_json::Value::Null,
            git_url: "https://example.com/r.git".into(),
            sub_path: None,
            project_type: None,
            resource_package_configs: vec![],
            status,
            created_at: Utc::now(),
            triggered_at: Utc::now(),
            started_at: None,
            completed_at: None,
            log_path: format!("{id}.log"),
            error: None,
        }
    }

    #[test]
    fn boot_sweep_fails_stale_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = BuildTaskStore::load(dir.path().to_path_buf()).unwrap();
        store.insert(task("t1", BuildStatus::Running)).unwrap();
        store.insert(task("t2", BuildStatus::Completed)).unwrap();

        let swept = store.sweep_stale_on_boot().unwrap();
        assert_eq!(swept, 1);
        assert_eq!(store.get("t1").unwrap().status, BuildStatus::Failed);
        assert_eq!(store.get("t2").unwrap().status, BuildStatus::Completed);
    }

    #[test]
    fn list_by_pipeline_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = BuildTaskStore::load(dir.path().to_path_buf()).unwrap();
        let mut t1 = task("t1", BuildStatus::Completed);
        t1.created_at = Utc::now() - chrono::Duration::seconds(10);
        let t2 = task("t2", BuildStatus::Completed);
        store.insert(t1).unwrap();
        store.insert(t2).unwrap();

        let listed = store.list_by_pipeline("p1");
        assert_eq!(listed[0].task_id, "t2");
        assert_eq!(listed[1].task_id, "t1");
    }
}

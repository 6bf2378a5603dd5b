use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;

use super::model::Pipeline;

/// CRUD over Pipeline definitions (C5), plus the webhook-token index used
/// by the Trigger Router. Persists one JSON file per pipeline under
/// `{data_dir}/pipelines/{id}.json`, atomic-rename on write, the same
/// pattern as the teacher's `ProjectState::save`.
pub struct PipelineStore {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: BTreeMap<String, Pipeline>,
    by_token: BTreeMap<String, String>,
}

impl PipelineStore {
    pub fn load(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating pipelines dir {}", dir.display()))?;

        let mut inner = Inner::default();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let pipeline: Pipeline = serde_json::from_str(&content)
                    .with_context(|| format!("parsing {}", path.display()))?;
                inner
                    .by_token
                    .insert(pipeline.webhook_token.clone(), pipeline.pipeline_id.clone());
                inner.by_id.insert(pipeline.pipeline_id.clone(), pipeline);
            }
        }

        Ok(Self {
            dir,
            inner: RwLock::new(inner),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn write_through(dir: &Path, pipeline: &Pipeline) -> Result<()> {
        let path = dir.join(format!("{}.json", pipeline.pipeline_id));
        let tmp_path = dir.join(format!("{}.json.tmp", pipeline.pipeline_id));
        let content = serde_json::to_string_pretty(pipeline)?;
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Create a new pipeline. Generates `webhook_token`/`webhook_secret`
    /// when blank (spec §4.5) and rejects a token collision.
    pub fn create(&self, mut pipeline: Pipeline) -> Result<Pipeline, String> {
        if pipeline.webhook_token.trim().is_empty() {
            pipeline.webhook_token = Uuid::new_v4().to_string();
        }
        if pipeline
            .webhook_secret
            .as_deref()
            .is_some_and(|s| s.trim().is_empty())
        {
            pipeline.webhook_secret = Some(Uuid::new_v4().to_string());
        }
        pipeline.created_at = Utc::now();
        pipeline.updated_at = Utc::now();

        pipeline.validate()?;

        let mut inner = self.inner.write().unwrap();
        if inner.by_token.contains_key(&pipeline.webhook_token) {
            return Err("webhook_token already in use".to_string());
        }
        if inner.by_id.contains_key(&pipeline.pipeline_id) {
            return Err("pipeline_id already exists".to_string());
        }

        Self::write_through(&self.dir, &pipeline).map_err(|e| e.to_string())?;
        inner
            .by_token
            .insert(pipeline.webhook_token.clone(), pipeline.pipeline_id.clone());
        inner.by_id.insert(pipeline.pipeline_id.clone(), pipeline.clone());
        Ok(pipeline)
    }

    /// Update an existing pipeline. If the caller supplies a new
    /// `webhook_token` (explicit regeneration) the index is swapped
    /// transactionally; re-saving without a token change leaves it intact
    /// (§8 round-trip property).
    pub fn update(&self, id: &str, mut pipeline: Pipeline) -> Result<Pipeline, String> {
        let mut inner = self.inner.write().unwrap();
        let existing = inner.by_id.get(id).ok_or_else(|| "pipeline not found".to_string())?;

        pipeline.pipeline_id = id.to_string();
        pipeline.created_at = existing.created_at;
        pipeline.updated_at = Utc::now();
        if pipeline.webhook_token.trim().is_empty() {
            pipeline.webhook_token = existing.webhook_token.clone();
        }
        if pipeline.webhook_secret.is_none() {
            pipeline.webhook_secret = existing.webhook_secret.clone();
        }
        // Stats are engine-maintained, not user-supplied.
        pipeline.stats = existing.stats.clone();

        pipeline.validate()?;

        let old_token = existing.webhook_token.clone();
        if old_token != pipeline.webhook_token && inner.by_token.contains_key(&pipeline.webhook_token) {
            return Err("webhook_token already in use".to_string());
        }

        Self::write_through(&self.dir, &pipeline).map_err(|e| e.to_string())?;

        if old_token != pipeline.webhook_token {
            inner.by_token.remove(&old_token);
            inner
                .by_token
                .insert(pipeline.webhook_token.clone(), id.to_string());
        }
        inner.by_id.insert(id.to_string(), pipeline.clone());
        Ok(pipeline)
    }

    /// Record engine-maintained stats without going through full update
    /// validation (called by the trigger router and scheduler).
    pub fn record_trigger(&self, id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(p) = inner.by_id.get_mut(id) {
            p.stats.trigger_count += 1;
            p.stats.last_triggered_at = Some(Utc::now());
            let _ = Self::write_through(&self.dir, p);
        }
    }

    pub fn record_build_result(&self, id: &str, task_id: &str, status: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(p) = inner.by_id.get_mut(id) {
            match status {
                "completed" => p.stats.success_count += 1,
                "failed" => p.stats.failed_count += 1,
                _ => {}
            }
            p.stats.last_build.task_id = Some(task_id.to_string());
            p.stats.last_build.status = Some(status.to_string());
            p.stats.last_build.completed_at = Some(Utc::now());
            let _ = Self::write_through(&self.dir, p);
        }
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if let Some(pipeline) = inner.by_id.remove(id) {
            inner.by_token.remove(&pipeline.webhook_token);
            let _ = std::fs::remove_file(self.path_for(id));
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: &str) -> Option<Pipeline> {
        self.inner.read().unwrap().by_id.get(id).cloned()
    }

    pub fn get_by_token(&self, token: &str) -> Option<Pipeline> {
        let inner = self.inner.read().unwrap();
        let id = inner.by_token.get(token)?;
        inner.by_id.get(id).cloned()
    }

    pub fn get_by_source_id(&self, source_id: &str) -> Vec<Pipeline> {
        self.inner
            .read()
            .unwrap()
            .by_id
            .values()
            .filter(|p| p.source_id.as_deref() == Some(source_id))
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Pipeline> {
        self.inner.read().unwrap().by_id.values().cloned().collect()
    }

    pub fn list_enabled_with_cron(&self) -> Vec<Pipeline> {
        self.inner
            .read()
            .unwrap()
            .by_id
            .values()
            .filter(|p| {
                p.enabled
                    && p.cron_expression
                        .as_deref()
                        .is_some_and(|e| !e.trim().is_empty())
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::{BranchStrategy, ProjectType, PushMode};
    use std::collections::BTreeMap as Map;

    fn new_pipeline(id: &str) -> Pipeline {
        Pipeline {
            pipeline_id: id.to_string(),
            git_url: "https://example.com/r.git".into(),
            source_id: None,
            branch: Some("main".into()),
            sub_path: None,
            project_type: ProjectType::Go,
            use_project_dockerfile: true,
            dockerfile_name: Some("Dockerfile".into()),
            template: None,
            image_name: "acme/app".into(),
            tag: "latest".into(),
            push: false,
            push_mode: PushMode::Single,
            selected_services: vec![],
            service_push_config: Map::new(),
            service_template_params: serde_json::Value::Null,
            resource_package_configs: vec![],
            enabled: true,
            webhook_token: String::new(),
            webhook_secret: None,
            webhook_branch_strategy: BranchStrategy::UsePush,
            branch_tag_mapping: vec![],
            cron_expression: None,
            stats: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn create_generates_token_when_blank() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStore::load(dir.path().to_path_buf()).unwrap();
        let created = store.create(new_pipeline("p1")).unwrap();
        assert!(!created.webhook_token.is_empty());
        assert!(store.get_by_token(&created.webhook_token).is_some());
    }

    #[test]
    fn resave_without_change_keeps_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStore::load(dir.path().to_path_buf()).unwrap();
        let created = store.create(new_pipeline("p1")).unwrap();
        let token = created.webhook_token.clone();

        let mut update = created.clone();
        update.webhook_token = String::new(); // caller omits it
        let updated = store.update("p1", update).unwrap();
        assert_eq!(updated.webhook_token, token);
    }

    #[test]
    fn duplicate_token_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStore::load(dir.path().to_path_buf()).unwrap();
        let mut p1 = new_pipeline("p1");
        p1.webhook_token = "shared".into();
        store.create(p1).unwrap();

        let mut p2 = new_pipeline("p2");
        p2.webhook_token = "shared".into();
        assert!(store.create(p2).is_err());
    }

    #[test]
    fn delete_does_not_touch_other_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStore::load(dir.path().to_path_buf()).unwrap();
        store.create(new_pipeline("p1")).unwrap();
        store.create(new_pipeline("p2")).unwrap();
        assert!(store.delete("p1"));
        assert!(store.get("p1").is_none());
        assert!(store.get("p2").is_some());
    }
}

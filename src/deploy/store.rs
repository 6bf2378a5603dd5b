use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

use super::model::{aggregate_status, DeployConfig, DeployStatus, Message, TargetState};
use super::parser;

/// In-memory view of a Deploy Task: the canonical YAML plus its parsed
/// form and the live per-target state. `config` is recomputed from
/// `config_content` on load rather than persisted redundantly, so a
/// parser change takes effect without a migration (spec §4.8).
#[derive(Debug, Clone)]
pub struct DeployTaskRecord {
    pub task_id: String,
    pub config_content: String,
    pub config: DeployConfig,
    pub targets: Vec<TargetState>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl DeployTaskRecord {
    pub fn status(&self) -> DeployStatus {
        aggregate_status(&self.targets)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusFile {
    task_id: String,
    targets: Vec<TargetState>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

/// C8: persists Deploy Tasks as a `{id}.yaml` (canonical source, spec §6)
/// plus a `{id}.json` (status + per-target message log). The split keeps
/// the export endpoint a plain file read.
pub struct DeployTaskStore {
    dir: PathBuf,
    inner: RwLock<BTreeMap<String, DeployTaskRecord>>,
}

impl DeployTaskStore {
    pub fn load(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating deploy-tasks dir {}", dir.display()))?;

        let mut tasks = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let id = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
                let status_content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let status: StatusFile = serde_json::from_str(&status_content)
                    .with_context(|| format!("parsing {}", path.display()))?;

                let yaml_path = dir.join(format!("{id}.yaml"));
                let config_content = std::fs::read_to_string(&yaml_path)
                    .with_context(|| format!("reading {}", yaml_path.display()))?;
                let config = parser::parse(&config_content)
                    .map_err(|e| anyhow::anyhow!("parsing stored config for {id}: {e}"))?;

                tasks.insert(
                    id.clone(),
                    DeployTaskRecord {
                        task_id: id,
                        config_content,
                        config,
                        targets: status.targets,
                        created_at: status.created_at,
                        updated_at: status.updated_at,
                    },
                );
            }
        }

        Ok(Self {
            dir,
            inner: RwLock::new(tasks),
        })
    }

    fn write_through(dir: &std::path::Path, record: &DeployTaskRecord) -> Result<()> {
        let yaml_path = dir.join(format!("{}.yaml", record.task_id));
        let yaml_tmp = dir.join(format!("{}.yaml.tmp", record.task_id));
        std::fs::write(&yaml_tmp, &record.config_content)?;
        std::fs::rename(&yaml_tmp, &yaml_path)?;

        let json_path = dir.join(format!("{}.json", record.task_id));
        let json_tmp = dir.join(format!("{}.json.tmp", record.task_id));
        let status = StatusFile {
            task_id: record.task_id.clone(),
            targets: record.targets.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        };
        std::fs::write(&json_tmp, serde_json::to_string_pretty(&status)?)?;
        std::fs::rename(&json_tmp, &json_path)?;
        Ok(())
    }

    pub fn create(&self, task_id: String, config_content: String) -> Result<DeployTaskRecord, EngineError> {
        let config = parser::parse(&config_content)?;
        let targets = config.targets.iter().map(TargetState::pending).collect();
        let now = Utc::now();
        let record = DeployTaskRecord {
            task_id,
            config_content,
            config,
            targets,
            created_at: now,
            updated_at: now,
        };
        Self::write_through(&self.dir, &record).map_err(|e| EngineError::Internal(e.to_string()))?;
        self.inner.write().unwrap().insert(record.task_id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, task_id: &str) -> Option<DeployTaskRecord> {
        self.inner.read().unwrap().get(task_id).cloned()
    }

    pub fn list(&self) -> Vec<DeployTaskRecord> {
        let mut tasks: Vec<_> = self.inner.read().unwrap().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub fn delete(&self, task_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.remove(task_id).is_some() {
            let _ = std::fs::remove_file(self.dir.join(format!("{task_id}.yaml")));
            let _ = std::fs::remove_file(self.dir.join(format!("{task_id}.json")));
            true
        } else {
            false
        }
    }

    pub fn export_yaml(&self, task_id: &str) -> Option<String> {
        self.inner.read().unwrap().get(task_id).map(|r| r.config_content.clone())
    }

    /// Read-modify-write one target's state under the store-wide lock
    /// (targets are few and updates are infrequent enough that a single
    /// lock, rather than a per-task one, is sufficient here).
    pub fn update_target<F>(&self, task_id: &str, target_name: &str, f: F)
    where
        F: FnOnce(&mut TargetState),
    {
        let mut inner = self.inner.write().unwrap();
        if let Some(record) = inner.get_mut(task_id) {
            if let Some(target) = record.targets.iter_mut().find(|t| t.name == target_name) {
                f(target);
            }
            record.updated_at = Utc::now();
            let _ = Self::write_through(&self.dir, record);
        }
    }

    pub fn append_message(&self, task_id: &str, target_name: &str, text: impl Into<String>) {
        self.update_target(task_id, target_name, |t| {
            t.messages.push(Message {
                time: Utc::now(),
                text: text.into(),
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
app:
  name: demo
deploy:
  type: docker_run
  command: "-d --name svc acme/app:1.0"
targets:
  - name: prod
    host_type: ssh
    host_name: box1
"#;

    #[test]
    fn create_seeds_pending_targets() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeployTaskStore::load(dir.path().to_path_buf()).unwrap();
        let record = store.create("d1".to_string(), YAML.to_string()).unwrap();
        assert_eq!(record.targets.len(), 1);
        assert_eq!(record.status(), super::DeployStatus::Pending);
    }

    #[test]
    fn reload_recovers_config_and_targets() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DeployTaskStore::load(dir.path().to_path_buf()).unwrap();
            store.create("d1".to_string(), YAML.to_string()).unwrap();
        }
        let reloaded = DeployTaskStore::load(dir.path().to_path_buf()).unwrap();
        let record = reloaded.get("d1").unwrap();
        assert_eq!(record.config.app.name, "demo");
        assert_eq!(record.targets.len(), 1);
    }

    #[test]
    fn append_message_persists_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeployTaskStore::load(dir.path().to_path_buf()).unwrap();
        store.create("d1".to_string(), YAML.to_string()).unwrap();
        store.append_message("d1", "prod", "starting");
        store.append_message("d1", "prod", "done");

        let record = store.get("d1").unwrap();
        let texts: Vec<_> = record.targets[0].messages.iter().map(|m| m.text.clone()).collect();
        assert_eq!(texts, vec!["starting".to_string(), "done".to_string()]);
    }

    #[test]
    fn reject_invalid_config_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeployTaskStore::load(dir.path().to_path_buf()).unwrap();
        let result = store.create("bad".to_string(), "app: {}\n".to_string());
        assert!(result.is_err());
    }
}

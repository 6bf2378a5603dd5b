use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trigger::webhook::TriggerInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Webhook,
    Manual,
    Cron,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Deleted,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Stopped | BuildStatus::Deleted
        )
    }

    pub fn holds_queue_slot(self) -> bool {
        matches!(self, BuildStatus::Pending | BuildStatus::Running)
    }
}

/// Trigger-captured metadata, normalized across the webhook/manual/cron
/// entry points. `platform` is only meaningful for `trigger_source=webhook`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerDetails {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub pusher: Option<String>,
}

impl From<&TriggerInfo> for TriggerDetails {
    fn from(info: &TriggerInfo) -> Self {
        TriggerDetails {
            platform: Some(format!("{:?}", info.platform).to_lowercase()),
            branch: Some(info.branch.clone()),
            commit: Some(info.commit.clone()),
            pusher: Some(info.pusher.clone()),
        }
    }
}

/// Per-service image reference resolved at trigger time — a snapshot, not
/// a live recomputation, so a Build Task's record is stable even if the
/// pipeline is edited afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedService {
    pub name: String,
    pub image_ref: String,
    pub push: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    pub task_id: String,
    #[serde(default)]
    pub pipeline_id: Option<String>,
    pub trigger_source: TriggerSource,
    #[serde(default)]
    pub trigger_info: TriggerDetails,

    pub branch: String,
    pub tag: String,
    pub services: Vec<ResolvedService>,
    pub use_project_dockerfile: bool,
    #[serde(default)]
    pub dockerfile_name: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub template_params: serde_json::Value,
    #[serde(default)]
    pub git_url: String,
    #[serde(default)]
    pub sub_path: Option<String>,
    #[serde(default)]
    pub project_type: Option<crate::pipeline::ProjectType>,
    #[serde(default)]
    pub resource_package_configs: Vec<crate::pipeline::model::ResourcePackageConfig>,

    pub status: BuildStatus,

    pub created_at: DateTime<Utc>,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    pub log_path: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl BuildTask {
    /// Move to a new status, refusing to overwrite a terminal state
    /// (spec §3: "terminal states are write-once").
    pub fn transition(&mut self, new_status: BuildStatus) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err(format!(
                "task {} already in terminal state {:?}",
                self.task_id, self.status
            ));
        }
        match new_status {
            BuildStatus::Running => self.started_at = Some(Utc::now()),
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Stopped => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = new_status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> BuildTask {
        BuildTask {
            task_id: "t1".into(),
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
            status: BuildStatus::Pending,
            created_at: Utc::now(),
            triggered_at: Utc::now(),
            started_at: None,
            completed_at: None,
            log_path: "t1.log".into(),
            error: None,
        }
    }

    #[test]
    fn terminal_state_is_write_once() {
        let mut t = task();
        t.transition(BuildStatus::Running).unwrap();
        t.transition(BuildStatus::Completed).unwrap();
        assert!(t.transition(BuildStatus::Failed).is_err());
    }

    #[test]
    fn running_sets_started_at() {
        let mut t = task();
        assert!(t.started_at.is_none());
        t.transition(BuildStatus::Running).unwrap();
        assert!(t.started_at.is_some());
    }
}

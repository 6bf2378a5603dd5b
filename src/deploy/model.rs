use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostType {
    Agent,
    Portainer,
    Ssh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub name: String,
    pub command: String,
}

/// The normalized `deploy:` block (spec §4.7). `DockerRun`/`DockerCompose`
/// carry a `type` discriminator on the wire; `Steps` doesn't (the legacy
/// shape never had one) so parsing dispatches on the presence of a
/// `steps` key before falling back to `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployPlan {
    DockerRun {
        command: String,
        redeploy: bool,
    },
    DockerCompose {
        command: String,
        compose_content: String,
        redeploy: bool,
    },
    Steps {
        steps: Vec<Step>,
        redeploy: bool,
    },
}

impl DeployPlan {
    pub fn redeploy(&self) -> bool {
        match self {
            DeployPlan::DockerRun { redeploy, .. }
            | DeployPlan::DockerCompose { redeploy, .. }
            | DeployPlan::Steps { redeploy, .. } => *redeploy,
        }
    }
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(rename = "type")]
    kind: Option<String>,
    command: Option<String>,
    compose_content: Option<String>,
    steps: Option<Vec<Step>>,
    #[serde(default)]
    redeploy: bool,
}

impl<'de> Deserialize<'de> for DeployPlan {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawPlan::deserialize(deserializer)?;
        if let Some(steps) = raw.steps {
            if steps.is_empty() {
                return Err(de::Error::custom("steps plan requires at least one step"));
            }
            return Ok(DeployPlan::Steps {
                steps,
                redeploy: raw.redeploy,
            });
        }
        match raw.kind.as_deref() {
            Some("docker_run") => Ok(DeployPlan::DockerRun {
                command: normalize_docker_run(
                    raw.command.ok_or_else(|| de::Error::missing_field("command"))?,
                ),
                redeploy: raw.redeploy,
            }),
            Some("docker_compose") => Ok(DeployPlan::DockerCompose {
                command: raw.command.ok_or_else(|| de::Error::missing_field("command"))?,
                compose_content: raw
                    .compose_content
                    .ok_or_else(|| de::Error::missing_field("compose_content"))?,
                redeploy: raw.redeploy,
            }),
            Some(other) => Err(de::Error::custom(format!("unknown deploy plan type `{other}`"))),
            None => Err(de::Error::custom("deploy plan missing `type` or `steps`")),
        }
    }
}

/// Strip a leading literal `docker run` from a `docker_run` command, per
/// spec §4.7 (the caller supplies only the arg string).
fn normalize_docker_run(command: String) -> String {
    let trimmed = command.trim();
    trimmed
        .strip_prefix("docker run")
        .unwrap_or(trimmed)
        .trim_start()
        .to_string()
}

impl Serialize for DeployPlan {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        match self {
            DeployPlan::DockerRun { command, redeploy } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("type", "docker_run")?;
                map.serialize_entry("command", command)?;
                map.serialize_entry("redeploy", redeploy)?;
                map.end()
            }
            DeployPlan::DockerCompose {
                command,
                compose_content,
                redeploy,
            } => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("type", "docker_compose")?;
                map.serialize_entry("command", command)?;
                map.serialize_entry("compose_content", compose_content)?;
                map.serialize_entry("redeploy", redeploy)?;
                map.end()
            }
            DeployPlan::Steps { steps, redeploy } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("steps", steps)?;
                map.serialize_entry("redeploy", redeploy)?;
                map.end()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppMeta {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployTargetSpec {
    pub name: String,
    pub host_type: HostType,
    pub host_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_version")]
    pub version: String,
    pub app: AppMeta,
    pub deploy: DeployPlan,
    pub targets: Vec<DeployTargetSpec>,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub exit_status: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub time: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetState {
    pub name: String,
    pub host_type: HostType,
    pub host_ref: String,
    pub status: TargetStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<TargetResult>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl TargetState {
    pub fn pending(spec: &DeployTargetSpec) -> Self {
        TargetState {
            name: spec.name.clone(),
            host_type: spec.host_type,
            host_ref: spec.host_name.clone(),
            status: TargetStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Computed from per-target state, never stored directly (spec §4.9).
pub fn aggregate_status(targets: &[TargetState]) -> DeployStatus {
    if targets.iter().any(|t| t.status == TargetStatus::Running) {
        return DeployStatus::Running;
    }
    if !targets.is_empty() && targets.iter().all(|t| t.status == TargetStatus::Completed) {
        return DeployStatus::Completed;
    }
    if targets.iter().any(|t| t.status == TargetStatus::Failed) {
        return DeployStatus::Failed;
    }
    DeployStatus::Pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_running_when_any_running() {
        let targets = vec![
            TargetState {
                status: TargetStatus::Completed,
                ..TargetState::pending(&DeployTargetSpec {
                    name: "a".into(),
                    host_type: HostType::Ssh,
                    host_name: "h1".into(),
                })
            },
            TargetState {
                status: TargetStatus::Running,
                ..TargetState::pending(&DeployTargetSpec {
                    name: "b".into(),
                    host_type: HostType::Ssh,
                    host_name: "h2".into(),
                })
            },
        ];
        assert_eq!(aggregate_status(&targets), DeployStatus::Running);
    }

    #[test]
    fn aggregate_failed_when_any_failed_and_none_running() {
        let targets = vec![
            TargetState {
                status: TargetStatus::Completed,
                ..TargetState::pending(&DeployTargetSpec {
                    name: "a".into(),
                    host_type: HostType::Ssh,
                    host_name: "h1".into(),
                })
            },
            TargetState {
                status: TargetStatus::Failed,
                ..TargetState::pending(&DeployTargetSpec {
                    name: "b".into(),
                    host_type: HostType::Ssh,
                    host_name: "h2".into(),
                })
            },
        ];
        assert_eq!(aggregate_status(&targets), DeployStatus::Failed);
    }

    #[test]
    fn aggregate_completed_when_all_completed() {
        let targets = vec![TargetState {
            status: TargetStatus::Completed,
            ..TargetState::pending(&DeployTargetSpec {
                name: "a".into(),
                host_type: HostType::Ssh,
                host_name: "h1".into(),
            })
        }];
        assert_eq!(aggregate_status(&targets), DeployStatus::Completed);
    }
}

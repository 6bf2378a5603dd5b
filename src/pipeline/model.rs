use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Jar,
    Nodejs,
    Python,
    Go,
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushMode {
    Single,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStrategy {
    UsePush,
    FilterMatch,
    UseConfigured,
}

/// `{push, imageName, tag}` is the canonical form. Older records may carry
/// a bare boolean (legacy) — §9's open question resolves the object form
/// as canonical and requires the store to upgrade legacy booleans on read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServicePushConfig {
    pub push: bool,
    #[serde(rename = "imageName")]
    pub image_name: Option<String>,
    pub tag: Option<String>,
}

impl<'de> Deserialize<'de> for ServicePushConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> de::Visitor<'de> for Visitor {
            type Value = ServicePushConfig;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a bool or a {push, imageName, tag} object")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<ServicePushConfig, E> {
                Ok(ServicePushConfig {
                    push: v,
                    image_name: None,
                    tag: None,
                })
            }

            fn visit_map<A>(self, mut map: A) -> Result<ServicePushConfig, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut push = false;
                let mut image_name = None;
                let mut tag = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "push" => push = map.next_value()?,
                        "imageName" | "image_name" => image_name = map.next_value()?,
                        "tag" => tag = map.next_value()?,
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                Ok(ServicePushConfig {
                    push,
                    image_name,
                    tag,
                })
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// One entry of `branch_tag_mapping`. Kept as an ordered `Vec` (not a map)
/// because matching is first-hit-in-declaration-order (spec §4.6 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchTagRule {
    pub pattern: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePackageConfig {
    pub package_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastBuildSnapshot {
    pub task_id: Option<String>,
    pub status: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    #[serde(default)]
    pub trigger_count: u64,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub last_build: LastBuildSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub pipeline_id: String,

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
    pub webhook_token: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_branch_strategy")]
    pub webhook_branch_strategy: BranchStrategy,
    #[serde(default)]
    pub branch_tag_mapping: Vec<BranchTagRule>,
    #[serde(default)]
    pub cron_expression: Option<String>,

    #[serde(default)]
    pub stats: PipelineStats,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
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

impl Pipeline {
    /// Validate the invariants from spec §3. Returns the first violation
    /// found, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.use_project_dockerfile {
            if self.template.is_some() && !self.template.as_deref().unwrap_or("").is_empty() {
                return Err(
                    "use_project_dockerfile is true but `template` is also set".to_string(),
                );
            }
            if self.dockerfile_name.as_deref().unwrap_or("").is_empty() {
                return Err("dockerfile_name is required when use_project_dockerfile".to_string());
            }
        } else if self.template.as_deref().unwrap_or("").is_empty() {
            return Err("template is required when use_project_dockerfile is false".to_string());
        }

        if self.push_mode == PushMode::Single && self.selected_services.len() > 1 {
            return Err("push_mode=single requires at most one selected service".to_string());
        }

        if let Some(expr) = &self.cron_expression {
            if !expr.trim().is_empty() {
                crate::trigger::cron::CronSchedule::parse(expr)
                    .map_err(|e| format!("invalid cron_expression: {e}"))?;
            }
        }

        Ok(())
    }
}

/// Resolve the tag to use for a push given the branch-tag mapping, in
/// declaration order: exact match first, then trailing-glob (`prefix/*`).
/// Falls back to the pipeline's global tag if nothing matches.
pub fn resolve_tag_for_branch(pipeline: &Pipeline, branch: &str) -> String {
    for rule in &pipeline.branch_tag_mapping {
        if rule.pattern == branch {
            return rule.tag.clone();
        }
    }
    for rule in &pipeline.branch_tag_mapping {
        if let Some(prefix) = rule.pattern.strip_suffix("/*") {
            if branch.starts_with(prefix) && branch.as_bytes().get(prefix.len()) == Some(&b'/') {
                return rule.tag.clone();
            }
        }
    }
    pipeline.tag.clone()
}

/// True if `branch` matches a `branch_tag_mapping` key (exact or glob),
/// used by `filter_match` branch strategy evaluation in addition to the
/// pipeline's single configured branch.
pub fn branch_matches_mapping(pipeline: &Pipeline, branch: &str) -> bool {
    pipeline.branch_tag_mapping.iter().any(|rule| {
        rule.pattern == branch
            || rule.pattern.strip_suffix("/*").is_some_and(|prefix| {
                branch.starts_with(prefix) && branch.as_bytes().get(prefix.len()) == Some(&b'/')
            })
    })
}

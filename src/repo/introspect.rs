use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::process::Command;

use crate::error::EngineError;
use super::cache::TtlCache;

const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct BranchesAndTags {
    pub branches: Vec<String>,
    pub tags: Vec<String>,
    pub default_branch: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub port: Option<u16>,
    pub user: Option<String>,
}

type BranchKey = (String, Option<String>);
type DockerfileKey = (String, String, Option<String>);
type ServiceKey = (String, String, String, Option<String>);

/// C1: cached Git metadata, Dockerfile discovery, and service analysis.
/// Shells out to the `git` binary the same way the builder's clone step
/// does rather than embedding a Git implementation.
pub struct RepoIntrospector {
    branches: TtlCache<BranchKey, BranchesAndTags>,
    dockerfiles: TtlCache<DockerfileKey, Vec<String>>,
    services: TtlCache<ServiceKey, Vec<ServiceInfo>>,
}

impl RepoIntrospector {
    pub fn new() -> Self {
        Self {
            branches: TtlCache::new(DEFAULT_TTL),
            dockerfiles: TtlCache::new(DEFAULT_TTL),
            services: TtlCache::new(DEFAULT_TTL),
        }
    }

    pub async fn resolve_branches_and_tags(
        &self,
        git_url: &str,
        source_id: Option<&str>,
        force: bool,
    ) -> Result<BranchesAndTags, EngineError> {
        let key = (git_url.to_string(), source_id.map(str::to_string));
        self.branches
            .get_or_fetch(key, force, || ls_remote(git_url))
            .await
    }

    pub async fn scan_dockerfiles(
        &self,
        git_url: &str,
        git_ref: &str,
        source_id: Option<&str>,
        force: bool,
    ) -> Result<Vec<String>, EngineError> {
        let key = (git_url.to_string(), git_ref.to_string(), source_id.map(str::to_string));
        let git_url = git_url.to_string();
        let git_ref = git_ref.to_string();
        self.dockerfiles
            .get_or_fetch(key, force, || scan_dockerfiles_at_ref(git_url, git_ref))
            .await
    }

    pub async fn analyze_services(
        &self,
        git_url: &str,
        git_ref: &str,
        dockerfile_path: &str,
        source_id: Option<&str>,
        force: bool,
    ) -> Result<Vec<ServiceInfo>, EngineError> {
        let key = (
            git_url.to_string(),
            git_ref.to_string(),
            dockerfile_path.to_string(),
            source_id.map(str::to_string),
        );
        let git_url = git_url.to_string();
        let git_ref = git_ref.to_string();
        let dockerfile_path = dockerfile_path.to_string();
        self.services
            .get_or_fetch(key, force, || {
                analyze_services_at_ref(git_url, git_ref, dockerfile_path)
            })
            .await
    }

    pub async fn invalidate_branches(&self, git_url: &str, source_id: Option<&str>) {
        self.branches
            .invalidate(&(git_url.to_string(), source_id.map(str::to_string)))
            .await;
    }
}

impl Default for RepoIntrospector {
    fn default() -> Self {
        Self::new()
    }
}

async fn ls_remote(git_url: &str) -> Result<BranchesAndTags, EngineError> {
    let output = Command::new("git")
        .args(["ls-remote", "--heads", "--tags", git_url])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| EngineError::RepoUnreachable(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("authentication") || stderr.contains("Permission denied") {
            return Err(EngineError::AuthRequired(stderr.trim().to_string()));
        }
        return Err(EngineError::RepoUnreachable(stderr.trim().to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut branches = Vec::new();
    let mut tags = Vec::new();
    for line in stdout.lines() {
        let Some((_, ref_name)) = line.split_once('\t') else { continue };
        if let Some(branch) = ref_name.strip_prefix("refs/heads/") {
            branches.push(branch.to_string());
        } else if let Some(tag) = ref_name.strip_prefix("refs/tags/") {
            if !tag.ends_with("^{}") {
                tags.push(tag.to_string());
            }
        }
    }
    branches.sort();
    tags.sort();

    let default_branch = if branches.iter().any(|b| b == "main") {
        "main".to_string()
    } else if branches.iter().any(|b| b == "master") {
        "master".to_string()
    } else {
        branches.first().cloned().unwrap_or_default()
    };

    Ok(BranchesAndTags { branches, tags, default_branch })
}

async fn shallow_clone_at_ref(git_url: &str, git_ref: &str) -> Result<tempfile::TempDir, EngineError> {
    let dir = tempfile::tempdir().map_err(|e| EngineError::Internal(e.to_string()))?;
    let status = Command::new("git")
        .args(["clone", "--depth", "1", "--branch", git_ref, git_url])
        .arg(dir.path())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| EngineError::RepoUnreachable(e.to_string()))?;

    if !status.status.success() {
        let stderr = String::from_utf8_lossy(&status.stderr);
        return Err(EngineError::RepoUnreachable(stderr.trim().to_string()));
    }
    Ok(dir)
}

async fn scan_dockerfiles_at_ref(git_url: String, git_ref: String) -> Result<Vec<String>, EngineError> {
    let dir = shallow_clone_at_ref(&git_url, &git_ref).await?;
    let root = dir.path().to_path_buf();
    tokio::task::spawn_blocking(move || walk_for_dockerfiles(&root))
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?
}

fn walk_for_dockerfiles(root: &Path) -> Result<Vec<String>, EngineError> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| EngineError::Internal(e.to_string()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.components().any(|c| c.as_os_str() == ".git") {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name == "Dockerfile" || name.starts_with("Dockerfile.") || name.starts_with("Dockerfile-") {
                    let rel = path.strip_prefix(root).unwrap_or(&path);
                    found.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
    }

    found.sort_by(|a, b| match (a.as_str(), b.as_str()) {
        ("Dockerfile", "Dockerfile") => std::cmp::Ordering::Equal,
        ("Dockerfile", _) => std::cmp::Ordering::Less,
        (_, "Dockerfile") => std::cmp::Ordering::Greater,
        _ => a.cmp(b),
    });
    Ok(found)
}

async fn analyze_services_at_ref(
    git_url: String,
    git_ref: String,
    dockerfile_path: String,
) -> Result<Vec<ServiceInfo>, EngineError> {
    let dir = shallow_clone_at_ref(&git_url, &git_ref).await?;
    let path = dir.path().join(&dockerfile_path);
    let content = std::fs::read_to_string(&path)
        .map_err(|_| EngineError::DockerfileMalformed(format!("cannot read {dockerfile_path}")))?;
    analyze_dockerfile_content(&content)
}

/// Heuristic service detection: an aliased `FROM ... AS <alias>` stage is
/// a "service" if it is never referenced by a later `COPY --from=<alias>`
/// (i.e. it is an end stage, not an intermediate build layer) or it
/// declares an `EXPOSE` within its own body. Falls back to a single
/// service named after the image if no stage qualifies.
pub fn analyze_dockerfile_content(content: &str) -> Result<Vec<ServiceInfo>, EngineError> {
    let from_re = Regex::new(r"(?i)^FROM\s+(\S+)(?:\s+AS\s+(\S+))?").unwrap();
    let copy_from_re = Regex::new(r"(?i)--from=(\S+)").unwrap();
    let expose_re = Regex::new(r"(?i)^EXPOSE\s+(\d+)").unwrap();
    let user_re = Regex::new(r"(?i)^USER\s+(\S+)").unwrap();

    struct Stage {
        alias: Option<String>,
        image: String,
        port: Option<u16>,
        user: Option<String>,
    }

    let mut stages: Vec<Stage> = Vec::new();
    let mut referenced_aliases: Vec<String> = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if let Some(caps) = from_re.captures(line) {
            stages.push(Stage {
                image: caps[1].to_string(),
                alias: caps.get(2).map(|m| m.as_str().to_string()),
                port: None,
                user: None,
            });
            continue;
        }
        if let Some(caps) = copy_from_re.captures(line) {
            referenced_aliases.push(caps[1].to_string());
        }
        if let Some(stage) = stages.last_mut() {
            if let Some(caps) = expose_re.captures(line) {
                stage.port = caps[1].parse().ok();
            }
            if let Some(caps) = user_re.captures(line) {
                stage.user = Some(caps[1].to_string());
            }
        }
    }

    if stages.is_empty() {
        return Err(EngineError::DockerfileMalformed("no FROM instruction found".to_string()));
    }

    let services: Vec<ServiceInfo> = stages
        .iter()
        .filter(|s| {
            let Some(alias) = &s.alias else { return stages.len() == 1 };
            !referenced_aliases.contains(alias) || s.port.is_some()
        })
        .map(|s| ServiceInfo {
            name: s.alias.clone().unwrap_or_else(|| image_basename(&s.image)),
            port: s.port,
            user: s.user.clone(),
        })
        .collect();

    if services.is_empty() {
        let last = stages.last().unwrap();
        return Ok(vec![ServiceInfo {
            name: image_basename(&last.image),
            port: last.port,
            user: last.user.clone(),
        }]);
    }

    Ok(services)
}

fn image_basename(image: &str) -> String {
    image.split('/').next_back().unwrap_or(image).split(':').next().unwrap_or(image).to_string()
}

pub type SharedIntrospector = Arc<RepoIntrospector>;

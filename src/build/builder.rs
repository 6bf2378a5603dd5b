use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::package_store::ResourcePackageStore;
use super::store::BuildTaskStore;
use super::task::{BuildStatus, BuildTask};
use super::template;
use crate::docker::image::{build_image, push_image, TaggedLine};
use crate::pipeline::PipelineStore;

/// Runs the Image Builder algorithm (C2) for one Build Task end to end:
/// workspace, shallow clone, Dockerfile materialization, resource package
/// injection, per-service build+push, log persistence. Constructed once
/// and handed to the scheduler as its `BuildRunner`.
pub struct Builder {
    pub tasks: Arc<BuildTaskStore>,
    pub pipelines: Arc<PipelineStore>,
    pub packages: Arc<ResourcePackageStore>,
}

impl Builder {
    pub fn new(tasks: Arc<BuildTaskStore>, pipelines: Arc<PipelineStore>, packages: Arc<ResourcePackageStore>) -> Self {
        Self { tasks, pipelines, packages }
    }

    /// Entry point matching the scheduler's `BuildRunner` signature.
    /// Failures are caught here and turned into a `failed` task — the
    /// scheduler itself never sees a build error.
    pub async fn run(&self, task_id: String, cancel: CancellationToken) {
        let Some(mut task) = self.tasks.get(&task_id) else {
            tracing::error!(task_id = %task_id, "scheduler dispatched unknown build task");
            return;
        };

        let log_path = self.tasks.log_path(&task_id);
        let result = self.execute(&task, &log_path, &cancel).await;

        match result {
            Ok(()) => {
                let _ = self
                    .tasks
                    .update_with(&task_id, |t| t.transition(BuildStatus::Completed));
            }
            Err(e) => {
                let stopped = cancel.is_cancelled();
                let _ = self.tasks.update_with(&task_id, |t| {
                    t.error = Some(crate::error::worker_error_text(&e));
                    t.transition(if stopped { BuildStatus::Stopped } else { BuildStatus::Failed })
                });
            }
        }

        if let Some(pipeline_id) = task.pipeline_id.take() {
            let final_status = self
                .tasks
                .get(&task_id)
                .map(|t| format!("{:?}", t.status).to_lowercase())
                .unwrap_or_default();
            self.pipelines
                .record_build_result(&pipeline_id, &task_id, &final_status);
        }
    }

    async fn execute(&self, task: &BuildTask, log_path: &Path, cancel: &CancellationToken) -> Result<()> {
        let log_file = std::fs::File::create(log_path).context("creating build log file")?;
        let log_file = Arc::new(StdMutex::new(log_file));

        // Step 1: acquire workspace — a scoped, unique directory removed
        // on every exit path.
        let workspace = tempfile::tempdir().context("creating build workspace")?;
        let checkout_root = workspace.path();

        // Step 2: shallow clone.
        append_line(&log_file, "cloning repository");
        clone_shallow(&task.git_url, &task.branch, checkout_root, cancel).await?;

        let context_dir = match &task.sub_path {
            Some(sub) if !sub.is_empty() => checkout_root.join(sub),
            _ => checkout_root.to_path_buf(),
        };

        // Step 3: materialize Dockerfile.
        let dockerfile_path = if task.use_project_dockerfile {
            let name = task
                .dockerfile_name
                .as_deref()
                .ok_or_else(|| anyhow!("use_project_dockerfile set but dockerfile_name missing"))?;
            let path = context_dir.join(name);
            if !path.exists() {
                return Err(anyhow!(crate::error::EngineError::DockerfileMissing(
                    path.display().to_string()
                )));
            }
            path
        } else {
            let template_name = task
                .template
                .as_deref()
                .ok_or_else(|| anyhow!("template mode set but template missing"))?;
            let project_type = task
                .project_type
                .ok_or_else(|| anyhow!("template mode set but project_type missing"))?;
            let rendered = template::render(template_name, project_type, &task.template_params)
                .map_err(|e| anyhow!(e))?;
            let path = context_dir.join(".forgebay.Dockerfile");
            std::fs::write(&path, rendered).context("writing rendered Dockerfile")?;
            path
        };

        // Step 4: inject resource packages.
        for pkg in &task.resource_package_configs {
            inject_resource_package(&context_dir, pkg, &self.packages).await?;
        }

        // Step 5: build per service.
        for service in &task.services {
            if cancel.is_cancelled() {
                bail!("build cancelled before service {}", service.name);
            }

            append_line(&log_file, &format!("building {}", service.image_ref));
            let on_line = {
                let log_file = log_file.clone();
                move |tl: TaggedLine| {
                    append_line(&log_file, &format!("[{}] {}", tl.service, tl.line));
                }
            };

            build_image(
                &context_dir,
                &dockerfile_path,
                &service.image_ref,
                &[],
                &service.name,
                &on_line,
                cancel,
            )
            .await
            .map_err(|e| {
                anyhow!(crate::error::EngineError::BuildFailed {
                    command: format!("docker build -t {}", service.image_ref),
                    tail: crate::error::worker_error_text(&e),
                })
            })?;

            if service.push {
                append_line(&log_file, &format!("pushing {}", service.image_ref));
                push_image(&service.image_ref, &service.name, &on_line, cancel)
                    .await
                    .map_err(|e| {
                        anyhow!(crate::error::EngineError::PushFailed(crate::error::worker_error_text(&e)))
                    })?;
            }
        }

        append_line(&log_file, "build complete");
        Ok(())
    }
}

fn append_line(file: &Arc<StdMutex<std::fs::File>>, line: &str) {
    let mut f = file.lock().unwrap();
    let _ = writeln!(f, "{line}");
}

async fn clone_shallow(git_url: &str, branch: &str, dest: &Path, cancel: &CancellationToken) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.args(["clone", "--depth", "1", "--branch", branch, git_url])
        .arg(dest)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("spawning git clone")?;
    let stderr = child.stderr.take();

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            bail!("cancelled during clone")
        }
        status = child.wait() => {
            let status = status.context("waiting for git clone")?;
            if !status.success() {
                let tail = match stderr {
                    Some(mut s) => {
                        use tokio::io::AsyncReadExt;
                        let mut buf = String::new();
                        let _ = s.read_to_string(&mut buf).await;
                        buf
                    }
                    None => String::new(),
                };
                return Err(anyhow!(crate::error::EngineError::RepoUnreachable(tail)));
            }
            Ok(())
        }
    }
}

async fn inject_resource_package(
    context_dir: &Path,
    pkg: &crate::pipeline::model::ResourcePackageConfig,
    packages: &ResourcePackageStore,
) -> Result<()> {
    let target = resolve_within(context_dir, &pkg.target_path)?;
    tokio::fs::create_dir_all(&target)
        .await
        .with_context(|| format!("creating resource target {}", target.display()))?;

    let archive_path = packages.archive_path(&pkg.package_id).ok_or_else(|| {
        anyhow!(crate::error::EngineError::NotFound(format!(
            "resource package `{}`",
            pkg.package_id
        )))
    })?;

    let archive_path_owned = archive_path.clone();
    let target_owned = target.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&archive_path_owned)
            .with_context(|| format!("opening resource package {}", archive_path_owned.display()))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .unpack(&target_owned)
            .with_context(|| format!("extracting resource package into {}", target_owned.display()))?;
        Ok(())
    })
    .await
    .context("resource package extraction task panicked")??;

    Ok(())
}

/// Resolve `relative` beneath `root`, rejecting any path that would
/// escape `root` (spec §4.2 step 4, `InvalidResourcePath`).
fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = root.join(relative);
    let mut depth: i32 = 0;
    for component in Path::new(relative).components() {
        use std::path::Component;
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!(crate::error::EngineError::InvalidResourcePath(
                    relative.to_string()
                )));
            }
        }
        if depth < 0 {
            return Err(anyhow!(crate::error::EngineError::InvalidResourcePath(
                relative.to_string()
            )));
        }
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_resource_path() {
        let root = Path::new("/workspace");
        assert!(resolve_within(root, "../../etc/passwd").is_err());
    }

    #[test]
    fn allows_relative_subdirectory() {
        let root = Path::new("/workspace");
        let resolved = resolve_within(root, "assets/static").unwrap();
        assert_eq!(resolved, Path::new("/workspace/assets/static"));
    }

    #[test]
    fn rejects_absolute_target_path() {
        let root = Path::new("/workspace");
        assert!(resolve_within(root, "/etc/passwd").is_err());
    }

    fn build_test_archive(entry_name: &str, content: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, entry_name, content).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn inject_resource_package_extracts_archive_contents() {
        let packages_dir = tempfile::tempdir().unwrap();
        let packages = ResourcePackageStore::load(packages_dir.path().to_path_buf()).unwrap();
        packages
            .put("pkg1", &build_test_archive("hello.txt", b"hi from the package"))
            .unwrap();

        let workspace = tempfile::tempdir().unwrap();
        let pkg = crate::pipeline::model::ResourcePackageConfig {
            package_id: "pkg1".to_string(),
            target_path: "assets".to_string(),
        };

        inject_resource_package(workspace.path(), &pkg, &packages).await.unwrap();

        let extracted = workspace.path().join("assets").join("hello.txt");
        assert_eq!(std::fs::read_to_string(extracted).unwrap(), "hi from the package");
    }

    #[tokio::test]
    async fn inject_resource_package_fails_for_unknown_package() {
        let packages_dir = tempfile::tempdir().unwrap();
        let packages = ResourcePackageStore::load(packages_dir.path().to_path_buf()).unwrap();

        let workspace = tempfile::tempdir().unwrap();
        let pkg = crate::pipeline::model::ResourcePackageConfig {
            package_id: "missing".to_string(),
            target_path: "assets".to_string(),
        };

        assert!(inject_resource_package(workspace.path(), &pkg, &packages).await.is_err());
    }
}

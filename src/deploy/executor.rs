use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use tokio::process::Command;

use super::host::{HostRecord, HostRegistry};
use super::model::{DeployPlan, DeployTargetSpec, HostType, Step, TargetResult, TargetStatus};
use super::store::DeployTaskStore;

/// Outcome of one command run on a resolved host.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub output: String,
    pub exit_status: i32,
}

/// The seam the spec calls out as a thin collaborator (§1: "per-host
/// agent/SSH transport drivers" are out of scope for the core). The
/// executor only depends on this interface; `ShellTransport` is the one
/// concrete, genuinely-thin implementation shipped with the core.
pub trait Transport: Send + Sync {
    fn execute<'a>(
        &'a self,
        host: &'a HostRecord,
        command: &'a str,
        cwd: Option<&'a str>,
    ) -> BoxFuture<'a, Result<CommandOutcome>>;

    fn write_file<'a>(&'a self, host: &'a HostRecord, path: &'a str, content: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// SSH shells out to the local `ssh` binary (mirrors the teacher's
/// `run_cmd` shell-out pattern in `cluster/deploy.rs`); agent/Portainer
/// are a single HTTP POST via `reqwest` to a URL the host record carries.
pub struct ShellTransport {
    http: reqwest::Client,
}

impl Default for ShellTransport {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Transport for ShellTransport {
    fn execute<'a>(
        &'a self,
        host: &'a HostRecord,
        command: &'a str,
        cwd: Option<&'a str>,
    ) -> BoxFuture<'a, Result<CommandOutcome>> {
        Box::pin(async move {
            match host.host_type {
                HostType::Ssh => self.execute_ssh(host, command, cwd).await,
                HostType::Agent | HostType::Portainer => self.execute_http(host, command, cwd).await,
            }
        })
    }

    fn write_file<'a>(&'a self, host: &'a HostRecord, path: &'a str, content: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match host.host_type {
                HostType::Ssh => self.write_file_ssh(host, path, content).await,
                HostType::Agent | HostType::Portainer => self.write_file_http(host, path, content).await,
            }
        })
    }
}

impl ShellTransport {
    async fn execute_ssh(&self, host: &HostRecord, command: &str, cwd: Option<&str>) -> Result<CommandOutcome> {
        let address = host
            .ssh_address
            .as_deref()
            .context("ssh host record is missing ssh_address")?;
        let remote_command = match cwd {
            Some(dir) => format!("mkdir -p {dir} && cd {dir} && {command}"),
            None => command.to_string(),
        };

        let output = Command::new("ssh")
            .arg(address)
            .arg(&remote_command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("spawning ssh")?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutcome {
            command: remote_command,
            output: combined,
            exit_status: output.status.code().unwrap_or(-1),
        })
    }

    async fn write_file_ssh(&self, host: &HostRecord, path: &str, content: &str) -> Result<()> {
        let address = host
            .ssh_address
            .as_deref()
            .context("ssh host record is missing ssh_address")?;
        let dir = std::path::Path::new(path).parent().map(|p| p.display().to_string()).unwrap_or_default();
        let remote_command = format!("mkdir -p {dir} && cat > {path}");

        let mut child = Command::new("ssh")
            .arg(address)
            .arg(&remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning ssh for file write")?;

        {
            use tokio::io::AsyncWriteExt;
            let mut stdin = child.stdin.take().context("ssh stdin pipe")?;
            stdin.write_all(content.as_bytes()).await.context("writing over ssh stdin")?;
        }

        let status = child.wait().await.context("waiting for ssh file write")?;
        if !status.success() {
            anyhow::bail!("writing {path} over ssh to {address} failed");
        }
        Ok(())
    }

    fn endpoint_url(host: &HostRecord) -> Result<&str> {
        match host.host_type {
            HostType::Agent => host.agent_url.as_deref().context("agent host record is missing agent_url"),
            HostType::Portainer => host
                .portainer_endpoint
                .as_deref()
                .context("portainer host record is missing portainer_endpoint"),
            HostType::Ssh => unreachable!("ssh dispatched separately"),
        }
    }

    async fn execute_http(&self, host: &HostRecord, command: &str, cwd: Option<&str>) -> Result<CommandOutcome> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            command: &'a str,
            cwd: Option<&'a str>,
            environment_id: Option<&'a str>,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            exit_status: i32,
            output: String,
        }

        let url = format!("{}/exec", Self::endpoint_url(host)?.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&Req {
                command,
                cwd,
                environment_id: host.portainer_environment_id.as_deref(),
            })
            .send()
            .await
            .with_context(|| format!("calling {url}"))?
            .error_for_status()
            .with_context(|| format!("{url} returned an error status"))?;

        let parsed: Resp = resp.json().await.context("decoding exec response")?;
        Ok(CommandOutcome {
            command: command.to_string(),
            output: parsed.output,
            exit_status: parsed.exit_status,
        })
    }

    async fn write_file_http(&self, host: &HostRecord, path: &str, content: &str) -> Result<()> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            path: &'a str,
            content: &'a str,
            environment_id: Option<&'a str>,
        }

        let url = format!("{}/write-file", Self::endpoint_url(host)?.trim_end_matches('/'));
        self.http
            .post(&url)
            .json(&Req {
                path,
                content,
                environment_id: host.portainer_environment_id.as_deref(),
            })
            .send()
            .await
            .with_context(|| format!("calling {url}"))?
            .error_for_status()
            .with_context(|| format!("{url} returned an error status"))?;
        Ok(())
    }
}

/// C9: runs a Deploy Task's plan against each declared target in order.
pub struct Executor {
    store: Arc<DeployTaskStore>,
    hosts: Arc<HostRegistry>,
    transport: Arc<dyn Transport>,
}

impl Executor {
    pub fn new(store: Arc<DeployTaskStore>, hosts: Arc<HostRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self { store, hosts, transport }
    }

    /// Run every target of `task_id` in declaration order. Targets of
    /// *other* Deploy Tasks may run concurrently; targets of this one do
    /// not (spec §5).
    pub async fn run(&self, task_id: String) {
        let Some(record) = self.store.get(&task_id) else {
            tracing::error!(task_id = %task_id, "executor dispatched unknown deploy task");
            return;
        };

        for target in record.config.targets.clone() {
            self.run_target(&task_id, &target, &record.config.deploy).await;
        }
    }

    async fn run_target(&self, task_id: &str, target: &DeployTargetSpec, plan: &DeployPlan) {
        self.store.update_target(task_id, &target.name, |t| {
            t.status = TargetStatus::Running;
            t.started_at = Some(chrono::Utc::now());
        });
        self.store.append_message(task_id, &target.name, "starting target");

        let Some(host) = self.hosts.get(target.host_type, &target.host_name) else {
            self.store.append_message(task_id, &target.name, "host not found");
            self.finish(
                task_id,
                &target.name,
                TargetResult {
                    success: false,
                    message: Some(format!("host `{}` not found", target.host_name)),
                    error: Some("HostNotFound".to_string()),
                    output: None,
                    command: None,
                    exit_status: None,
                },
            );
            return;
        };

        if plan.redeploy() {
            for cmd in redeploy_precommands(plan, target) {
                self.store.append_message(task_id, &target.name, format!("redeploy: {cmd}"));
                // Best-effort: the commands themselves carry `|| true`
                // semantics for docker_run; failures here don't abort the
                // target.
                let _ = self.transport.execute(&host, &cmd, None).await;
            }
        }

        let outcome = match plan {
            DeployPlan::DockerRun { command, .. } => {
                let full = format!("docker run {command}");
                self.transport.execute(&host, &full, None).await
            }
            DeployPlan::DockerCompose { command, compose_content, .. } => {
                self.run_compose(&host, target, command, compose_content).await
            }
            DeployPlan::Steps { steps, .. } => self.run_steps(task_id, target, &host, steps).await,
        };

        match outcome {
            Ok(outcome) => {
                let success = outcome.exit_status == 0;
                self.store
                    .append_message(task_id, &target.name, format!("`{}` exited {}", outcome.command, outcome.exit_status));
                self.finish(
                    task_id,
                    &target.name,
                    TargetResult {
                        success,
                        message: Some(if success { "deployment succeeded".to_string() } else { "deployment failed".to_string() }),
                        error: if success { None } else { Some(outcome.output.clone()) },
                        output: Some(outcome.output),
                        command: Some(outcome.command),
                        exit_status: Some(outcome.exit_status),
                    },
                );
            }
            Err(e) => {
                self.store.append_message(task_id, &target.name, format!("error: {e:#}"));
                self.finish(
                    task_id,
                    &target.name,
                    TargetResult {
                        success: false,
                        message: Some("execution error".to_string()),
                        error: Some(format!("{e:#}")),
                        output: None,
                        command: None,
                        exit_status: None,
                    },
                );
            }
        }
    }

    async fn run_compose(
        &self,
        host: &HostRecord,
        target: &DeployTargetSpec,
        command: &str,
        compose_content: &str,
    ) -> Result<CommandOutcome> {
        let workdir = compose_workdir(&target.name);
        self.transport
            .write_file(host, &format!("{workdir}/docker-compose.yml"), compose_content)
            .await
            .context("writing compose manifest")?;
        let full = format!("docker-compose {command}");
        self.transport.execute(host, &full, Some(&workdir)).await
    }

    async fn run_steps(
        &self,
        task_id: &str,
        target: &DeployTargetSpec,
        host: &HostRecord,
        steps: &[Step],
    ) -> Result<CommandOutcome> {
        let mut last = CommandOutcome {
            command: String::new(),
            output: String::new(),
            exit_status: 0,
        };
        for step in steps {
            self.store
                .append_message(task_id, &target.name, format!("running step `{}`", step.name));
            let outcome = self.transport.execute(host, &step.command, None).await?;
            let failed = outcome.exit_status != 0;
            last = outcome;
            if failed {
                break;
            }
        }
        Ok(last)
    }

    fn finish(&self, task_id: &str, target_name: &str, result: TargetResult) {
        self.store.update_target(task_id, target_name, |t| {
            t.status = if result.success { TargetStatus::Completed } else { TargetStatus::Failed };
            t.completed_at = Some(chrono::Utc::now());
            t.result = Some(result);
        });
    }
}

/// A stable, per-target working directory so a redeploy's `docker-compose
/// down` addresses the same project as the `up` that follows it.
fn compose_workdir(target_name: &str) -> String {
    format!("/tmp/forgebay-deploy/{target_name}")
}

/// Derive the "stop and remove what's there" pre-step for a plan type
/// (spec §4.9 step 2). `steps` plans get no automatic pre-step — the
/// operator encodes redeploy inside the steps themselves.
fn redeploy_precommands(plan: &DeployPlan, target: &DeployTargetSpec) -> Vec<String> {
    match plan {
        DeployPlan::DockerRun { command, .. } => match parse_container_name(command) {
            Some(name) => vec![format!("docker stop {name} || true"), format!("docker rm {name} || true")],
            None => Vec::new(),
        },
        DeployPlan::DockerCompose { .. } => {
            vec![format!("docker-compose down")].into_iter().map(|c| {
                let workdir = compose_workdir(&target.name);
                format!("cd {workdir} 2>/dev/null && {c} || true")
            }).collect()
        }
        DeployPlan::Steps { .. } => Vec::new(),
    }
}

fn parse_container_name(command: &str) -> Option<String> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    for (i, tok) in tokens.iter().enumerate() {
        if *tok == "--name" {
            return tokens.get(i + 1).map(|s| s.to_string());
        }
        if let Some(rest) = tok.strip_prefix("--name=") {
            return Some(rest.to_string());
        }
    }
    None
}

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Parse an image reference into (name, tag).
/// "postgres:16" -> ("postgres", "16")
/// "redis" -> ("redis", "latest")
/// "axllent/mailpit:latest" -> ("axllent/mailpit", "latest")
pub fn parse_image_ref(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !name.is_empty() && !tag.is_empty() => (name, tag),
        _ => (image, "latest"),
    }
}

/// A single line of build/push output, tagged with the service it came
/// from so a multi-service build's log stream stays readable.
#[derive(Debug, Clone)]
pub struct TaggedLine {
    pub service: String,
    pub line: String,
}

async fn run_streamed(
    mut cmd: Command,
    service: &str,
    on_line: &(dyn Fn(TaggedLine) + Sync),
    cancel: &CancellationToken,
) -> Result<()> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().context("spawning docker process")?;
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut tail: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                bail!("cancelled");
            }
            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(l)) => {
                        push_tail(&mut tail, &l);
                        on_line(TaggedLine { service: service.to_string(), line: l });
                    }
                    Ok(None) => {}
                    Err(e) => bail!("reading stdout: {e}"),
                }
            }
            line = stderr_lines.next_line() => {
                match line {
                    Ok(Some(l)) => {
                        push_tail(&mut tail, &l);
                        on_line(TaggedLine { service: service.to_string(), line: l });
                    }
                    Ok(None) => {}
                    Err(e) => bail!("reading stderr: {e}"),
                }
            }
            status = child.wait() => {
                let status = status.context("waiting for docker process")?;
                if !status.success() {
                    bail!("{}", tail.join("\n"));
                }
                return Ok(());
            }
        }
    }
}

fn push_tail(tail: &mut Vec<String>, line: &str) {
    tail.push(line.to_string());
    if tail.len() > 50 {
        tail.remove(0);
    }
}

/// Build one service's image by shelling out to `docker build`, streaming
/// combined stdout/stderr line-by-line through `on_line`. `dockerfile`
/// must live inside `context_dir`. Mirrors the teacher's `run_cmd`
/// shell-out-and-stream pattern rather than bollard's tar-archive build
/// API, since the build context here is a plain checkout directory.
pub async fn build_image(
    context_dir: &Path,
    dockerfile: &Path,
    image_ref: &str,
    build_args: &[(String, String)],
    service: &str,
    on_line: &(dyn Fn(TaggedLine) + Sync),
    cancel: &CancellationToken,
) -> Result<()> {
    let mut cmd = Command::new("docker");
    cmd.arg("build")
        .arg("-t")
        .arg(image_ref)
        .arg("-f")
        .arg(dockerfile)
        .current_dir(context_dir);

    for (key, value) in build_args {
        cmd.arg("--build-arg").arg(format!("{key}={value}"));
    }
    cmd.arg(".");

    run_streamed(cmd, service, on_line, cancel)
        .await
        .with_context(|| format!("docker build failed for {image_ref}"))
}

/// Push a previously built image, streaming output the same way as
/// `build_image`. Returns the pushed digest parsed from the final
/// "digest: sha256:..." line docker prints on success, if present.
pub async fn push_image(
    image_ref: &str,
    service: &str,
    on_line: &(dyn Fn(TaggedLine) + Sync),
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let digest = std::sync::Arc::new(std::sync::Mutex::new(None::<String>));
    let digest_capture = digest.clone();
    let capturing_on_line = move |tl: TaggedLine| {
        if let Some(d) = extract_digest(&tl.line) {
            *digest_capture.lock().unwrap() = Some(d);
        }
        on_line(tl);
    };

    let mut cmd = Command::new("docker");
    cmd.arg("push").arg(image_ref);

    run_streamed(cmd, service, &capturing_on_line, cancel)
        .await
        .with_context(|| format!("docker push failed for {image_ref}"))?;

    let result = digest.lock().unwrap().clone();
    Ok(result)
}

fn extract_digest(line: &str) -> Option<String> {
    let idx = line.find("sha256:")?;
    let candidate = &line[idx..];
    let end = candidate
        .find(|c: char| !(c.is_ascii_hexdigit() || c == ':'))
        .unwrap_or(candidate.len());
    Some(candidate[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_image_with_tag() {
        assert_eq!(parse_image_ref("postgres:16"), ("postgres", "16"));
    }

    #[test]
    fn parse_image_without_tag() {
        assert_eq!(parse_image_ref("redis"), ("redis", "latest"));
    }

    #[test]
    fn parse_image_with_org_and_tag() {
        assert_eq!(
            parse_image_ref("axllent/mailpit:latest"),
            ("axllent/mailpit", "latest")
        );
    }

    #[test]
    fn parse_image_alpine() {
        assert_eq!(
            parse_image_ref("postgres:16-alpine"),
            ("postgres", "16-alpine")
        );
    }

    #[test]
    fn extracts_digest_from_push_output() {
        let line = "latest: digest: sha256:abcd1234efgh5678 size: 1234";
        assert_eq!(
            extract_digest(line),
            Some("sha256:abcd1234efgh5678".to_string())
        );
    }

    #[test]
    fn no_digest_returns_none() {
        assert_eq!(extract_digest("The push refers to repository"), None);
    }
}

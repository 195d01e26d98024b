//! Container-backed environments using Docker.
//!
//! A job selecting `container: <image>` gets one long-lived workspace
//! container. Each step runs inside it through `docker exec`, so state
//! written by one step is visible to the next.

use crate::environments::Environment;
use crate::runner::{OutputLine, StepContext, StepResult, StepRunner, shell_command};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use foundry_core::ids::EnvironmentId;
use foundry_core::run::LogStream;
use foundry_core::{Error, Result};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Mount point of the host workspace inside job containers.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

fn unavailable(image: &str, message: impl std::fmt::Display) -> Error {
    Error::EnvironmentUnavailable {
        selector: format!("container:{}", image),
        message: message.to_string(),
    }
}

/// A running workspace container.
pub struct ContainerEnvironment {
    id: EnvironmentId,
    image: String,
    container_name: String,
    workspace: PathBuf,
    runner: Arc<ContainerExecRunner>,
    docker: Docker,
}

impl ContainerEnvironment {
    /// Pull the image and start a workspace container with `host_workspace`
    /// bind-mounted at [`CONTAINER_WORKSPACE`].
    pub async fn start(docker: Docker, image: &str, host_workspace: &Path) -> Result<Self> {
        let id = EnvironmentId::new();
        let container_name = format!("foundry-{}", id.as_uuid());

        info!(image = %image, container = %container_name, "Pulling image");
        let mut pull = docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            let progress = progress.map_err(|e| unavailable(image, e))?;
            if let Some(status) = progress.status {
                debug!(image = %image, status = %status, "Pull progress");
            }
        }

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(vec![format!(
                    "{}:{}",
                    host_workspace.display(),
                    CONTAINER_WORKSPACE
                )]),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| unavailable(image, format!("create failed: {}", e)))?;

        if let Err(e) = docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            remove_container(&docker, &container_name).await;
            return Err(unavailable(image, format!("start failed: {}", e)));
        }

        info!(image = %image, container = %container_name, "Workspace container started");

        let runner = Arc::new(ContainerExecRunner {
            docker: docker.clone(),
            container_name: container_name.clone(),
        });

        Ok(Self {
            id,
            image: image.to_string(),
            container_name,
            workspace: PathBuf::from(CONTAINER_WORKSPACE),
            runner,
            docker,
        })
    }
}

async fn remove_container(docker: &Docker, container_name: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(container_name, Some(options)).await {
        warn!(container = %container_name, error = %e, "Failed to remove container");
    }
}

#[async_trait]
impl Environment for ContainerEnvironment {
    fn id(&self) -> EnvironmentId {
        self.id
    }

    fn description(&self) -> String {
        format!("container:{}", self.image)
    }

    fn working_dir(&self) -> &Path {
        &self.workspace
    }

    fn runner(&self) -> Arc<dyn StepRunner> {
        self.runner.clone()
    }

    async fn cleanup(&self) -> Result<()> {
        info!(container = %self.container_name, "Removing workspace container");
        remove_container(&self.docker, &self.container_name).await;
        Ok(())
    }
}

/// Runs steps inside an existing container via `docker exec`.
pub struct ContainerExecRunner {
    docker: Docker,
    container_name: String,
}

/// Wrap `argv` so the step runs as its own process group inside the
/// container, with the group id written to `pid_file` while it runs.
fn grouped_command(argv: Vec<String>, pid_file: &str) -> Vec<String> {
    let script = format!(
        "set -m; \"$@\" & pid=$!; echo $pid > {f}; wait $pid; code=$?; rm -f {f}; exit $code",
        f = pid_file
    );
    let mut command = vec![
        "sh".to_string(),
        "-c".to_string(),
        script,
        "foundry-step".to_string(),
    ];
    command.extend(argv);
    command
}

/// Kills the exec's process group when dropped before the exec finishes.
///
/// `docker exec` has no kill call of its own, so the kill runs as a second
/// detached exec in the same container.
struct ExecGuard {
    docker: Docker,
    container_name: String,
    pid_file: Option<String>,
}

impl ExecGuard {
    fn disarm(&mut self) {
        self.pid_file = None;
    }
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        let Some(pid_file) = self.pid_file.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %self.container_name, "No runtime to stop abandoned exec");
            return;
        };
        let docker = self.docker.clone();
        let container_name = self.container_name.clone();
        handle.spawn(async move {
            kill_exec(&docker, &container_name, &pid_file).await;
        });
    }
}

async fn kill_exec(docker: &Docker, container_name: &str, pid_file: &str) {
    let script = format!(
        "[ -f {f} ] && kill -KILL -$(cat {f}); rm -f {f}",
        f = pid_file
    );
    let result = async {
        let exec = docker
            .create_exec(
                container_name,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
                    ..Default::default()
                },
            )
            .await?;
        docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok::<_, bollard::errors::Error>(())
    }
    .await;

    match result {
        Ok(()) => debug!(container = %container_name, "Stopped abandoned exec"),
        Err(e) => warn!(container = %container_name, error = %e, "Failed to stop abandoned exec"),
    }
}

/// Splits exec output chunks into lines, holding a partial line until the
/// chunk carrying its newline arrives.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(decode_line(&line));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

async fn send_lines(
    tx: &mpsc::Sender<OutputLine>,
    stream: LogStream,
    lines: impl IntoIterator<Item = String>,
) -> bool {
    for content in lines {
        let line = OutputLine {
            stream,
            content,
            timestamp: chrono::Utc::now(),
        };
        if tx.send(line).await.is_err() {
            return false;
        }
    }
    true
}

#[async_trait]
impl StepRunner for ContainerExecRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();
        let env: Vec<String> = ctx.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let pid_file = format!("/tmp/.foundry-step-{}", EnvironmentId::new().as_uuid());
        let exec = self
            .docker
            .create_exec(
                &self.container_name,
                CreateExecOptions {
                    cmd: Some(grouped_command(
                        shell_command(&ctx.shell, &ctx.command),
                        &pid_file,
                    )),
                    env: Some(env),
                    working_dir: Some(ctx.cwd().display().to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Internal(format!("Failed to create exec: {}", e)))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::Internal(format!("Failed to start exec: {}", e)))?;
        let mut guard = ExecGuard {
            docker: self.docker.clone(),
            container_name: self.container_name.clone(),
            pid_file: Some(pid_file),
        };

        if let StartExecResults::Attached { mut output, .. } = started {
            let mut stdout = LineSplitter::default();
            let mut stderr = LineSplitter::default();
            while let Some(chunk) = output.next().await {
                let (stream, lines) = match chunk {
                    Ok(LogOutput::StdOut { message }) => (LogStream::Stdout, stdout.push(&message)),
                    Ok(LogOutput::StdErr { message }) => (LogStream::Stderr, stderr.push(&message)),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(container = %self.container_name, error = %e, "Error reading exec output");
                        break;
                    }
                };
                if !send_lines(&output_tx, stream, lines).await {
                    break;
                }
            }
            send_lines(&output_tx, LogStream::Stdout, stdout.finish()).await;
            send_lines(&output_tx, LogStream::Stderr, stderr.finish()).await;
        }
        guard.disarm();

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::Internal(format!("Failed to inspect exec: {}", e)))?;
        let exit_code = inspect.exit_code.unwrap_or(-1) as i32;
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(container = %self.container_name, step = %ctx.step_name, exit_code, duration_ms, "Exec completed");

        Ok(StepResult {
            exit_code,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_split_across_chunks() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.push(b"compiling foun"), Vec::<String>::new());
        assert_eq!(
            splitter.push(b"dry\r\nlinking\nwarn"),
            vec!["compiling foundry", "linking"]
        );
        assert_eq!(splitter.finish(), Some("warn".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_grouped_command_passes_argv_through() {
        let command = grouped_command(
            vec!["bash".to_string(), "-c".to_string(), "make all".to_string()],
            "/tmp/.foundry-step-1",
        );
        assert_eq!(command[..2].to_vec(), vec!["sh", "-c"]);
        assert!(command[2].starts_with("set -m;"));
        assert!(command[2].contains("> /tmp/.foundry-step-1"));
        assert_eq!(
            command[3..].to_vec(),
            vec!["foundry-step", "bash", "-c", "make all"]
        );
    }
}

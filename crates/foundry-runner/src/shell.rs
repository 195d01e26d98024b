//! Shell-based step execution on the host.

use crate::runner::{OutputLine, StepContext, StepResult, StepRunner, shell_command};
use async_trait::async_trait;
use foundry_core::Result;
use foundry_core::run::LogStream;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Runs step commands as child processes of the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

/// Kills the step's process group when dropped before the step exits.
///
/// Every step is spawned as the leader of its own process group, so this
/// also reaches subshells and background children of the step's shell.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "Killed step process group"),
        Err(e) => debug!(pgid, error = %e, "Step process group already gone"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

fn forward_lines<R>(
    reader: R,
    stream: LogStream,
    tx: mpsc::Sender<OutputLine>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let content = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    let line = OutputLine {
                        stream,
                        content,
                        timestamp: chrono::Utc::now(),
                    };
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();
        let argv = shell_command(&ctx.shell, &ctx.command);
        let cwd = ctx.cwd();

        info!(step = %ctx.step_name, shell = %argv[0], cwd = %cwd.display(), "Executing shell command");

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&cwd)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            foundry_core::Error::Internal(format!("Failed to spawn {}: {}", argv[0], e))
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| foundry_core::Error::Internal("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| foundry_core::Error::Internal("stderr not captured".to_string()))?;

        let stdout_handle = forward_lines(stdout, LogStream::Stdout, output_tx.clone());
        let stderr_handle = forward_lines(stderr, LogStream::Stderr, output_tx);

        let status = child.wait().await.map_err(|e| {
            foundry_core::Error::Internal(format!("Failed to wait for process: {}", e))
        })?;
        group.disarm();

        let _ = stdout_handle.await;
        let _ = stderr_handle.await;

        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(step = %ctx.step_name, exit_code, duration_ms, "Command completed");

        Ok(StepResult {
            exit_code,
            duration_ms,
        })
    }
}

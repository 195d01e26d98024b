//! Core runner trait and types.

use async_trait::async_trait;
use foundry_core::Result;
use foundry_core::run::LogStream;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: LogStream,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl OutputLine {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stdout,
            content: content.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stderr,
            content: content.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Result of a finished step process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Everything a runner needs to start one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub step_name: String,
    /// Command text with `$(Name)` macros already expanded.
    pub command: String,
    pub shell: String,
    /// Environment working directory.
    pub workspace: PathBuf,
    /// Optional directory relative to the workspace.
    pub working_directory: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl StepContext {
    /// Directory the step process starts in.
    pub fn cwd(&self) -> PathBuf {
        match &self.working_directory {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        }
    }
}

/// Executes a single step command.
///
/// Implementations stream output lines into `output_tx` and return once the
/// process exits. Dropping the returned future must stop the process.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult>;
}

/// Interpreter invocation for a step shell.
pub fn shell_command(shell: &str, command: &str) -> Vec<String> {
    let mut argv = match shell {
        "pwsh" | "powershell" => vec![shell.to_string(), "-NoProfile".into(), "-Command".into()],
        "cmd" => vec!["cmd".to_string(), "/C".to_string()],
        "" => vec!["sh".to_string(), "-c".to_string()],
        other => vec![other.to_string(), "-c".to_string()],
    };
    argv.push(command.to_string());
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command() {
        assert_eq!(shell_command("bash", "echo hi"), vec!["bash", "-c", "echo hi"]);
        assert_eq!(
            shell_command("pwsh", "Get-Date"),
            vec!["pwsh", "-NoProfile", "-Command", "Get-Date"]
        );
        assert_eq!(shell_command("cmd", "dir"), vec!["cmd", "/C", "dir"]);
    }

    #[test]
    fn test_cwd() {
        let ctx = StepContext {
            step_name: "test".to_string(),
            command: "true".to_string(),
            shell: "sh".to_string(),
            workspace: PathBuf::from("/work"),
            working_directory: Some("build".to_string()),
            env: BTreeMap::new(),
        };
        assert_eq!(ctx.cwd(), PathBuf::from("/work/build"));
    }
}

//! CLI configuration management.
//!
//! Settings are layered: built-in defaults, the user file, the project
//! `foundry.yaml`, then `FOUNDRY_*` environment variables
//! (`FOUNDRY_RETRY__MAX_ATTEMPTS=5`).

use anyhow::{Context, Result};
use foundry_runner::LocalEnvironmentSettings;
use foundry_scheduler::{OrchestratorSettings, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project configuration file name.
pub const PROJECT_FILE: &str = "foundry.yaml";

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Where run records are stored.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Working copy that host jobs run in.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Concurrency of the `default` pool when a pipeline does not declare it.
    #[serde(default = "default_pool_concurrency")]
    pub default_pool_concurrency: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// VM image name to host; `host` runs on this machine.
    #[serde(default)]
    pub vm_images: BTreeMap<String, String>,
    #[serde(default = "default_docker")]
    pub docker: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".foundry")
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_pool_concurrency() -> u32 {
    2
}

fn default_grace_period() -> u64 {
    10
}

fn default_docker() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            workspace: default_workspace(),
            default_pool_concurrency: default_pool_concurrency(),
            retry: RetryConfig::default(),
            grace_period_secs: default_grace_period(),
            vm_images: BTreeMap::new(),
            docker: default_docker(),
            retention_days: default_retention_days(),
        }
    }
}

impl CliConfig {
    /// Load configuration for a project directory.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = Self::user_config_path() {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder
            .add_source(config::File::from(project_dir.join(PROJECT_FILE)).required(false))
            .add_source(
                config::Environment::with_prefix("FOUNDRY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: CliConfig = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        if config.state_dir.is_relative() {
            config.state_dir = project_dir.join(&config.state_dir);
        }
        if config.workspace.is_relative() {
            config.workspace = project_dir.join(&config.workspace);
        }
        Ok(config)
    }

    /// User configuration file, e.g. `~/.config/foundry/config.yaml`.
    pub fn user_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "foundry", "foundry")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            default_pool_concurrency: self.default_pool_concurrency.max(1),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts.max(1),
                base_delay: Duration::from_secs(self.retry.base_delay_secs),
                max_delay: Duration::from_secs(self.retry.max_delay_secs),
            },
            grace_period: Duration::from_secs(self.grace_period_secs),
        }
    }

    pub fn environment_settings(&self) -> LocalEnvironmentSettings {
        LocalEnvironmentSettings {
            workspace: self.workspace.clone(),
            vm_images: self.vm_images.clone(),
            docker_enabled: self.docker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_project_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_FILE),
            "default_pool_concurrency: 4\nretry:\n  max_attempts: 5\nvm_images:\n  ubuntu-latest: host\n",
        )
        .unwrap();

        let config = CliConfig::load(dir.path()).unwrap();
        assert_eq!(config.default_pool_concurrency, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_secs, 2);
        assert_eq!(config.vm_images.get("ubuntu-latest").map(String::as_str), Some("host"));
        assert_eq!(config.state_dir, dir.path().join(".foundry"));

        let settings = config.orchestrator_settings();
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.grace_period, Duration::from_secs(10));
    }
}

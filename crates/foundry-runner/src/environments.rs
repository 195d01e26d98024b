//! Execution environment management.

use crate::container::ContainerEnvironment;
use crate::runner::StepRunner;
use crate::shell::ShellRunner;
use async_trait::async_trait;
use foundry_core::ids::{EnvironmentId, JobKey, RunId};
use foundry_core::pipeline::EnvironmentSelector;
use foundry_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Name that maps a VM image onto the local host.
pub const LOCAL_HOST: &str = "host";

/// An acquired place to run a job's steps.
#[async_trait]
pub trait Environment: Send + Sync {
    fn id(&self) -> EnvironmentId;

    /// Human-readable description, e.g. `host:/src` or `container:alpine`.
    fn description(&self) -> String;

    /// Get the working directory.
    fn working_dir(&self) -> &Path;

    /// Runner that executes steps inside this environment.
    fn runner(&self) -> Arc<dyn StepRunner>;

    /// Release the environment.
    async fn cleanup(&self) -> Result<()>;
}

/// What a job asks for when it is admitted.
#[derive(Debug, Clone)]
pub struct EnvironmentRequest {
    pub run_id: RunId,
    pub job: JobKey,
    pub selector: EnvironmentSelector,
}

/// Turns environment selectors into live environments.
///
/// Failures should be reported as [`Error::EnvironmentUnavailable`] when a
/// later attempt might succeed.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn acquire(&self, request: &EnvironmentRequest) -> Result<Box<dyn Environment>>;
}

/// Host environment (runs directly on the orchestrator machine).
pub struct HostEnvironment {
    id: EnvironmentId,
    workspace: PathBuf,
    runner: Arc<ShellRunner>,
}

impl HostEnvironment {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            id: EnvironmentId::new(),
            workspace,
            runner: Arc::new(ShellRunner::new()),
        }
    }

    /// Create the workspace directory if needed.
    pub async fn prepare(&self) -> Result<()> {
        info!(workspace = %self.workspace.display(), "Preparing host environment");
        tokio::fs::create_dir_all(&self.workspace).await?;
        Ok(())
    }
}

#[async_trait]
impl Environment for HostEnvironment {
    fn id(&self) -> EnvironmentId {
        self.id
    }

    fn description(&self) -> String {
        format!("host:{}", self.workspace.display())
    }

    fn working_dir(&self) -> &Path {
        &self.workspace
    }

    fn runner(&self) -> Arc<dyn StepRunner> {
        self.runner.clone()
    }

    async fn cleanup(&self) -> Result<()> {
        // The workspace is the shared source tree; nothing to tear down.
        Ok(())
    }
}

/// Settings for [`LocalEnvironmentProvider`].
#[derive(Debug, Clone)]
pub struct LocalEnvironmentSettings {
    pub workspace: PathBuf,
    /// VM image name to host name. Only [`LOCAL_HOST`] is runnable locally.
    pub vm_images: BTreeMap<String, String>,
    pub docker_enabled: bool,
}

/// Provides host workspaces for pool jobs, Docker containers for container
/// jobs, and resolves VM images through a configured mapping.
pub struct LocalEnvironmentProvider {
    settings: LocalEnvironmentSettings,
}

impl LocalEnvironmentProvider {
    pub fn new(settings: LocalEnvironmentSettings) -> Self {
        Self { settings }
    }

    async fn host(&self) -> Result<Box<dyn Environment>> {
        let env = HostEnvironment::new(self.settings.workspace.clone());
        env.prepare().await?;
        Ok(Box::new(env))
    }
}

#[async_trait]
impl EnvironmentProvider for LocalEnvironmentProvider {
    async fn acquire(&self, request: &EnvironmentRequest) -> Result<Box<dyn Environment>> {
        match &request.selector {
            EnvironmentSelector::Pool(_) => self.host().await,
            EnvironmentSelector::VmImage(image) => match self.settings.vm_images.get(image) {
                Some(host) if host == LOCAL_HOST => self.host().await,
                Some(host) => Err(Error::EnvironmentUnavailable {
                    selector: request.selector.to_string(),
                    message: format!("remote host '{}' is not reachable from this machine", host),
                }),
                None => Err(Error::EnvironmentUnavailable {
                    selector: request.selector.to_string(),
                    message: "no host is mapped for this VM image".to_string(),
                }),
            },
            EnvironmentSelector::Container(image) => {
                if !self.settings.docker_enabled {
                    return Err(Error::EnvironmentUnavailable {
                        selector: request.selector.to_string(),
                        message: "container support is disabled".to_string(),
                    });
                }
                let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
                    Error::EnvironmentUnavailable {
                        selector: request.selector.to_string(),
                        message: format!("failed to connect to Docker: {}", e),
                    }
                })?;
                let env =
                    ContainerEnvironment::start(docker, image, &self.settings.workspace).await?;
                Ok(Box::new(env))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(dir: &Path) -> LocalEnvironmentProvider {
        LocalEnvironmentProvider::new(LocalEnvironmentSettings {
            workspace: dir.to_path_buf(),
            vm_images: BTreeMap::from([
                ("ubuntu-latest".to_string(), LOCAL_HOST.to_string()),
                ("macOS-13".to_string(), "mac-mini-01".to_string()),
            ]),
            docker_enabled: false,
        })
    }

    fn request(selector: EnvironmentSelector) -> EnvironmentRequest {
        EnvironmentRequest {
            run_id: RunId::new(),
            job: JobKey::new("Linux", "build"),
            selector,
        }
    }

    #[tokio::test]
    async fn test_pool_gets_host_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let env = provider(dir.path())
            .acquire(&request(EnvironmentSelector::Pool("default".into())))
            .await
            .unwrap();
        assert_eq!(env.working_dir(), dir.path());
        assert!(env.description().starts_with("host:"));
    }

    #[tokio::test]
    async fn test_vm_image_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());

        assert!(
            provider
                .acquire(&request(EnvironmentSelector::VmImage("ubuntu-latest".into())))
                .await
                .is_ok()
        );

        let remote = provider
            .acquire(&request(EnvironmentSelector::VmImage("macOS-13".into())))
            .await;
        assert!(matches!(remote, Err(Error::EnvironmentUnavailable { .. })));

        let unmapped = provider
            .acquire(&request(EnvironmentSelector::VmImage("windows-2022".into())))
            .await;
        assert!(matches!(unmapped, Err(Error::EnvironmentUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_container_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let result = provider(dir.path())
            .acquire(&request(EnvironmentSelector::Container("alpine:3".into())))
            .await;
        assert!(matches!(result, Err(Error::EnvironmentUnavailable { .. })));
    }
}

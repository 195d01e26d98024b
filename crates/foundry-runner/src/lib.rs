//! Execution environments and step execution for Foundry.

pub mod container;
pub mod environments;
pub mod executor;
pub mod runner;
pub mod shell;

pub use container::{ContainerEnvironment, ContainerExecRunner};
pub use environments::{
    Environment, EnvironmentProvider, EnvironmentRequest, HostEnvironment,
    LocalEnvironmentProvider, LocalEnvironmentSettings,
};
pub use executor::{JobExecution, JobExecutor, JobSpec, StepSpec};
pub use runner::{OutputLine, StepContext, StepResult, StepRunner};
pub use shell::ShellRunner;

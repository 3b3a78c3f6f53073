//! Manager Runner - runs one managed container to completion
//!
//! Pulls the image, stages input artifacts, starts the container, streams its
//! combined output live while capturing it, copies results out on success and
//! always force-removes the container, including when the operator
//! interrupts the run.

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod runner;
pub mod spec;
pub mod staging;
pub mod variants;

pub use cancel::{CancellationWatcher, InterruptSource, NoInterrupts, OsSignals};
pub use config::RunnerConfig;
pub use engine::{ContainerEngine, ContainerId, ContainerState, DockerCli};
pub use error::{CredentialsError, EngineError, RunError, StagingError};
pub use handle::ContainerHandle;
pub use runner::{ExitState, LiveOutput, ManagedRun, RunResult, RunSettings};
pub use spec::{ContainerSpec, EnvList};
pub use staging::{ArchiveInput, CopyFromContainer, CopyToContainer};
pub use variants::{AccessCommandInvocation, AccessConfig, AwsCredentials, ClusterConfig, ClusterConfigInvocation};

/// Version injected into every container for the compatibility check.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Environment variable carrying [`VERSION`] into the container.
pub const VERSION_ENV: &str = "CORTEX_CLI_VERSION";
pub const DEFAULT_VERSION_CHECK_SCRIPT: &str = "/root/check_cortex_version.sh";

//! Container engine capability consumed by the managed run controller.
//!
//! The controller only talks to the engine through [`ContainerEngine`]; the
//! production implementation drives a docker-compatible CLI, tests plug in a
//! recording fake.

use crate::error::EngineError;
use crate::spec::ContainerSpec;
use crate::staging::ArchiveInput;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use tokio::io::AsyncRead;

pub mod docker_cli;

pub use docker_cli::DockerCli;

/// Identifier returned by a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Twelve-character form used in log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        self.0.get(..end).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullProgress {
    /// One dot on stdout per progress update from the engine.
    Dots,
    Silent,
}

/// Terminal (or not) state observed by inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    pub force: bool,
    pub remove_volumes: bool,
}

impl RemoveOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            remove_volumes: true,
        }
    }
}

/// Combined stdout/stderr stream of an attached container.
pub type AttachedStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull `image` without any stored registry credentials. Returns `false`
    /// when nothing was pulled because the image is already present locally.
    async fn pull_image(&self, image: &str, progress: PullProgress) -> Result<bool, EngineError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError>;

    async fn start_container(&self, id: &ContainerId) -> Result<(), EngineError>;

    async fn attach(&self, id: &ContainerId) -> Result<AttachedStream, EngineError>;

    async fn copy_to_container(
        &self,
        id: &ContainerId,
        input: &ArchiveInput,
        container_path: &str,
    ) -> Result<(), EngineError>;

    async fn copy_from_container(
        &self,
        id: &ContainerId,
        container_path: &str,
        local_dir: &Path,
    ) -> Result<(), EngineError>;

    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerState, EngineError>;

    async fn remove_container(
        &self,
        id: &ContainerId,
        options: RemoveOptions,
    ) -> Result<(), EngineError>;
}

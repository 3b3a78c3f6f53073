//! Error taxonomy for managed container runs.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Failure reported by a [`ContainerEngine`](crate::engine::ContainerEngine) call.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn container runtime {runtime}: {source}")]
    Spawn {
        runtime: String,
        source: std::io::Error,
    },
    #[error("Container runtime {operation} failed ({status}): {stderr}")]
    CommandFailed {
        operation: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Unexpected output from container runtime {operation}: {message}")]
    UnexpectedOutput {
        operation: &'static str,
        message: String,
    },
    #[error("Staging failed: {0}")]
    Staging(#[from] StagingError),
    #[error("I/O error talking to container runtime: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while preparing or transferring artifacts.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Archive destination '{dest}' must stay inside the archive root")]
    InvalidDestination { dest: String },
    #[error("Staging source {path} does not exist")]
    MissingSource { path: PathBuf },
    #[error("Failed to stage {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize staged configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Error returned by [`ManagedRun::run`](crate::runner::ManagedRun::run).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },
    #[error("Container {step} failed: {source}")]
    Engine {
        step: &'static str,
        source: EngineError,
    },
    #[error("Artifact staging ({step}) failed: {source}")]
    Staging {
        step: &'static str,
        source: EngineError,
    },
    #[error("Failed to stream container output: {0}")]
    Stream(std::io::Error),
    #[error("Interrupted by operator; the container was removed")]
    Cancelled,
    /// The workload exited with code 0 but its results could not be copied out.
    #[error("Container exited successfully but results could not be retrieved: {source}")]
    ResultRetrieval { output: String, source: EngineError },
}

impl RunError {
    pub(crate) fn engine(step: &'static str) -> impl FnOnce(EngineError) -> Self {
        move |source| RunError::Engine { step, source }
    }

    pub(crate) fn staging(step: &'static str) -> impl FnOnce(EngineError) -> Self {
        move |source| RunError::Staging { step, source }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RunError::ImagePull { .. } => "MANAGER_RUN_IMAGE_PULL_ERROR",
            RunError::Engine { .. } => "MANAGER_RUN_ENGINE_ERROR",
            RunError::Staging { .. } => "MANAGER_RUN_STAGING_ERROR",
            RunError::Stream(_) => "MANAGER_RUN_STREAM_ERROR",
            RunError::Cancelled => "MANAGER_RUN_CANCELLED",
            RunError::ResultRetrieval { .. } => "MANAGER_RUN_RESULT_RETRIEVAL_ERROR",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled)
    }
}

impl From<StagingError> for RunError {
    fn from(err: StagingError) -> Self {
        RunError::Staging {
            step: "prepare",
            source: EngineError::Staging(err),
        }
    }
}

/// Cloud credentials could not be resolved from the environment.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("{0} is not set; export your cloud credentials before running this command")]
    Missing(&'static str),
}

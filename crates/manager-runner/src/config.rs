//! Runner configuration, from command-line flags or environment variables.

use crate::cancel::{InterruptSource, OsSignals};
use crate::engine::DockerCli;
use crate::runner::{LiveOutput, ManagedRun, RunSettings};
use clap::Args;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Args)]
pub struct RunnerConfig {
    /// Container runtime binary (docker-compatible CLI)
    #[arg(
        long,
        env = "MANAGERCTL_CONTAINER_RUNTIME",
        default_value = crate::engine::docker_cli::DEFAULT_RUNTIME
    )]
    pub runtime: String,

    /// Directory for cached cluster configuration files
    #[arg(long, env = "MANAGERCTL_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// How long to wait for interrupt cleanup before giving up, in milliseconds
    #[arg(long, env = "MANAGERCTL_CANCEL_GRACE_MS", default_value_t = 5000)]
    pub cancel_grace_ms: u64,

    /// Script run inside the container to check version compatibility
    #[arg(
        long,
        env = "MANAGERCTL_VERSION_CHECK_SCRIPT",
        default_value = crate::DEFAULT_VERSION_CHECK_SCRIPT
    )]
    pub version_check_script: String,

    /// Do not stream container output or pull progress while the container
    /// runs; the captured output is printed once the run ends
    #[arg(long, env = "MANAGERCTL_QUIET")]
    pub quiet: bool,
}

impl RunnerConfig {
    /// Explicit cache dir, else `<user cache dir>/managerctl`.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(env::temp_dir)
                .join("managerctl")
        })
    }

    pub fn settings(&self) -> RunSettings {
        RunSettings {
            version_check_script: self.version_check_script.clone(),
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
            live_output: if self.quiet {
                LiveOutput::Silent
            } else {
                LiveOutput::Stdout
            },
            ..RunSettings::default()
        }
    }

    pub fn engine(&self) -> DockerCli {
        DockerCli::new(&self.runtime)
    }

    /// Controller wired to the configured runtime and OS interrupt signals.
    pub fn managed_run(&self) -> ManagedRun {
        let interrupts: Arc<dyn InterruptSource> = Arc::new(OsSignals);
        ManagedRun::new(Arc::new(self.engine()))
            .with_interrupts(interrupts)
            .with_settings(self.settings())
    }
}

//! Managed run controller: the lifecycle of one container invocation.
//!
//! pull → create → copy-in → start → attach + stream → inspect →
//! copy-out (exit code 0 only) → remove. Removal is bound to a
//! [`ContainerHandle`] and happens exactly once on every path after create,
//! including operator interrupts handled by the [`CancellationWatcher`].

use crate::cancel::{CancellationWatcher, InterruptSource, OsSignals};
use crate::engine::{ContainerEngine, ContainerState, PullProgress};
use crate::error::{EngineError, RunError};
use crate::handle::ContainerHandle;
use crate::spec::ContainerSpec;
use crate::staging::{CopyFromContainer, CopyToContainer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// How the container finished, as observed by inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i64),
    /// The engine still reported the container as running after its output
    /// stream ended. No exit code is fabricated for this case.
    StillRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub output: String,
    pub exit: ExitState,
}

impl RunResult {
    pub fn exit_code(&self) -> Option<i64> {
        match self.exit {
            ExitState::Exited(code) => Some(code),
            ExitState::StillRunning => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit == ExitState::Exited(0)
    }
}

/// Where the live copy of the container stream goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutput {
    Stdout,
    Silent,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub version: String,
    pub version_check_script: String,
    pub cancel_grace: Duration,
    pub live_output: LiveOutput,
    pub newline_after_pull: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            version_check_script: crate::DEFAULT_VERSION_CHECK_SCRIPT.to_string(),
            cancel_grace: Duration::from_secs(5),
            live_output: LiveOutput::Stdout,
            newline_after_pull: false,
        }
    }
}

#[derive(Clone)]
pub struct ManagedRun {
    engine: Arc<dyn ContainerEngine>,
    interrupts: Arc<dyn InterruptSource>,
    settings: RunSettings,
}

impl ManagedRun {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            interrupts: Arc::new(OsSignals),
            settings: RunSettings::default(),
        }
    }

    pub fn with_interrupts(mut self, interrupts: Arc<dyn InterruptSource>) -> Self {
        self.interrupts = interrupts;
        self
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn newline_after_pull(mut self, enabled: bool) -> Self {
        self.settings.newline_after_pull = enabled;
        self
    }

    /// Run `spec` to completion.
    ///
    /// `copy_in` runs in order before start; `copy_out` runs in order only
    /// when the container exited with code 0. A copy-out failure is returned
    /// as [`RunError::ResultRetrieval`], carrying the captured output. An
    /// operator interrupt at any point after create yields
    /// [`RunError::Cancelled`].
    pub async fn run(
        &self,
        spec: &ContainerSpec,
        copy_in: &[CopyToContainer],
        copy_out: &[CopyFromContainer],
    ) -> Result<RunResult, RunError> {
        let spec = spec.augmented(
            &self.settings.version,
            &self.settings.version_check_script,
        );

        self.pull(&spec.image).await?;

        let id = self
            .engine
            .create_container(&spec)
            .await
            .map_err(RunError::engine("create"))?;
        info!(container = %id.short(), image = %spec.image, "container created");

        let container = ContainerHandle::new(Arc::clone(&self.engine), id);
        let mut watcher = CancellationWatcher::spawn(self.interrupts.listen(), container.remover());

        let started = Instant::now();
        let mut outcome = self.drive(&container, &watcher, copy_in, copy_out).await;
        if watcher.is_cancelled() {
            outcome = Err(RunError::Cancelled);
        }
        watcher.stop();

        if matches!(outcome, Err(RunError::Cancelled)) {
            watcher.wait_for_cleanup(self.settings.cancel_grace).await;
        }

        container.remove().await;
        debug!(
            container = %container.id().short(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run finished"
        );
        outcome
    }

    async fn pull(&self, image: &str) -> Result<(), RunError> {
        let progress = match self.settings.live_output {
            LiveOutput::Stdout => PullProgress::Dots,
            LiveOutput::Silent => PullProgress::Silent,
        };

        info!(image, "pulling image");
        let pulled = self
            .engine
            .pull_image(image, progress)
            .await
            .map_err(|err| pull_error(image, err))?;

        if pulled
            && self.settings.newline_after_pull
            && self.settings.live_output == LiveOutput::Stdout
        {
            let mut out = tokio::io::stdout();
            let _ = out.write_all(b"\n").await;
            let _ = out.flush().await;
        }
        Ok(())
    }

    async fn drive(
        &self,
        container: &ContainerHandle,
        watcher: &CancellationWatcher,
        copy_in: &[CopyToContainer],
        copy_out: &[CopyFromContainer],
    ) -> Result<RunResult, RunError> {
        let engine = container.engine();
        let id = container.id();

        for directive in copy_in {
            debug!(
                container = %id.short(),
                dest = %directive.container_path,
                files = directive.input.files.len(),
                "copying artifacts into container"
            );
            watcher
                .guard(async {
                    engine
                        .copy_to_container(id, &directive.input, &directive.container_path)
                        .await
                        .map_err(RunError::staging("copy-in"))
                })
                .await?;
        }

        watcher
            .guard(async {
                engine
                    .start_container(id)
                    .await
                    .map_err(RunError::engine("start"))
            })
            .await?;
        info!(container = %id.short(), "container started");

        let stream = watcher
            .guard(async { engine.attach(id).await.map_err(RunError::engine("attach")) })
            .await?;

        let live_output = self.settings.live_output;
        let captured = watcher
            .guard(async move {
                let result = match live_output {
                    LiveOutput::Stdout => fan_out(stream, &mut tokio::io::stdout()).await,
                    LiveOutput::Silent => fan_out(stream, &mut tokio::io::sink()).await,
                };
                result.map_err(RunError::Stream)
            })
            .await?;
        let output = normalize_output(&String::from_utf8_lossy(&captured));

        if watcher.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let state = watcher
            .guard(async {
                engine
                    .inspect_container(id)
                    .await
                    .map_err(RunError::engine("inspect"))
            })
            .await?;

        if is_clean_exit(&state) {
            for directive in copy_out {
                debug!(
                    container = %id.short(),
                    src = %directive.container_path,
                    local_dir = %directive.local_dir.display(),
                    "copying results out of container"
                );
                watcher
                    .guard(async {
                        engine
                            .copy_from_container(id, &directive.container_path, &directive.local_dir)
                            .await
                            .map_err(|source| RunError::ResultRetrieval {
                                output: output.clone(),
                                source,
                            })
                    })
                    .await?;
            }
        }

        if state.running {
            warn!(
                container = %id.short(),
                "container still reported as running after its output stream ended"
            );
            return Ok(RunResult {
                output,
                exit: ExitState::StillRunning,
            });
        }

        info!(container = %id.short(), exit_code = state.exit_code, "container exited");
        Ok(RunResult {
            output,
            exit: ExitState::Exited(state.exit_code),
        })
    }
}

fn is_clean_exit(state: &ContainerState) -> bool {
    !state.running && state.exit_code == 0
}

/// Attach pull failures with actionable guidance when they look like an
/// authentication problem.
pub(crate) fn pull_error(image: &str, err: EngineError) -> RunError {
    let mut message = err.to_string();
    if message.contains("auth") {
        message.push_str(&format!(
            "\n\nif your manager image is stored in a private repository: run `docker login` \
             (if you haven't already), download your image with `docker pull {}`, and try this \
             command again",
            image
        ));
    }
    RunError::ImagePull {
        image: image.to_string(),
        message,
    }
}

/// Copy `reader` to `live` until EOF while keeping every byte.
pub async fn fan_out<R, W>(mut reader: R, live: &mut W) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        live.write_all(&buf[..n]).await?;
        live.flush().await?;
        captured.extend_from_slice(&buf[..n]);
    }
    Ok(captured)
}

/// Rewrite `\r\n` to `\n`.
pub fn normalize_output(output: &str) -> String {
    output.replace("\r\n", "\n")
}

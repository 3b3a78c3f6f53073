//! [`ContainerEngine`] backed by a docker-compatible command line binary.

use super::{
    AttachedStream, ContainerEngine, ContainerId, ContainerState, PullProgress, RemoveOptions,
};
use crate::error::EngineError;
use crate::spec::ContainerSpec;
use crate::staging::ArchiveInput;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf};
use tokio::process::{Child, Command};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

pub const DEFAULT_RUNTIME: &str = "docker";

/// Bytes of the attach process's stderr kept for error reporting.
const ATTACH_STDERR_TAIL: usize = 4096;

#[derive(Debug, Clone)]
pub struct DockerCli {
    runtime: String,
}

impl DockerCli {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.runtime);
        command.args(args);
        command.stdin(Stdio::null());
        command.kill_on_drop(true);
        command
    }

    fn spawn_error(&self) -> impl FnOnce(std::io::Error) -> EngineError + '_ {
        move |source| EngineError::Spawn {
            runtime: self.runtime.clone(),
            source,
        }
    }

    /// Run to completion and return trimmed stdout, failing on a non-zero status.
    async fn output(
        &self,
        operation: &'static str,
        mut command: Command,
    ) -> Result<String, EngineError> {
        debug!(operation, command = %command_line_string(&command), "invoking container runtime");

        let output = command.output().await.map_err(self.spawn_error())?;
        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                operation,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn image_present(&self, image: &str) -> Result<bool, EngineError> {
        let mut command = self.command(["image", "inspect", "--format", "{{.Id}}", image]);
        command.stdout(Stdio::null()).stderr(Stdio::null());
        let status = command.status().await.map_err(self.spawn_error())?;
        Ok(status.success())
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn pull_image(&self, image: &str, progress: PullProgress) -> Result<bool, EngineError> {
        if self.image_present(image).await? {
            debug!(image, "image already present locally; skipping pull");
            return Ok(false);
        }

        let mut command = self.command(["pull", image]);
        // An empty client config directory means no stored credentials are offered.
        let anonymous_config = TempDir::new()?;
        command.env("DOCKER_CONFIG", anonymous_config.path());
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(command = %command_line_string(&command), "pulling image");
        let mut child = command.spawn().map_err(self.spawn_error())?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let mut out = tokio::io::stdout();
            while lines.next_line().await?.is_some() {
                if progress == PullProgress::Dots {
                    out.write_all(b".").await?;
                    out.flush().await?;
                }
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        drop(anonymous_config);

        if !status.success() {
            return Err(EngineError::CommandFailed {
                operation: "pull",
                status,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(true)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        let mut command = self.command(create_args(spec));
        command.envs(create_env(spec));
        let id = self.output("create", command).await?;
        if id.is_empty() {
            return Err(EngineError::UnexpectedOutput {
                operation: "create",
                message: "runtime returned an empty container id".to_string(),
            });
        }
        Ok(ContainerId::new(id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.output("start", self.command(["start", id.as_str()]))
            .await
            .map(|_| ())
    }

    async fn attach(&self, id: &ContainerId) -> Result<AttachedStream, EngineError> {
        let mut command = self.command(["attach", "--no-stdin", "--sig-proxy=false", id.as_str()]);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(command = %command_line_string(&command), "attaching to container");
        let mut child = command.spawn().map_err(self.spawn_error())?;

        let stdout = child.stdout.take().ok_or(EngineError::UnexpectedOutput {
            operation: "attach",
            message: "attach process has no stdout pipe".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or(EngineError::UnexpectedOutput {
            operation: "attach",
            message: "attach process has no stderr pipe".to_string(),
        })?;

        let tail = Arc::new(Mutex::new(Vec::new()));
        let stderr = ReaderStream::new(stderr).inspect({
            let tail = Arc::clone(&tail);
            move |chunk| {
                if let (Ok(bytes), Ok(mut tail)) = (chunk, tail.lock()) {
                    tail.extend_from_slice(bytes);
                    let excess = tail.len().saturating_sub(ATTACH_STDERR_TAIL);
                    tail.drain(..excess);
                }
            }
        });
        let combined = futures_util::stream::select(ReaderStream::new(stdout), stderr);

        Ok(Box::new(AttachProcess {
            reader: Box::new(StreamReader::new(combined)),
            eof: false,
            exit_check: Some(Box::pin(check_attach_exit(
                self.clone(),
                id.clone(),
                child,
                tail,
            ))),
        }))
    }

    async fn copy_to_container(
        &self,
        id: &ContainerId,
        input: &ArchiveInput,
        container_path: &str,
    ) -> Result<(), EngineError> {
        let input = input.clone();
        let staging = tokio::task::spawn_blocking(move || -> Result<TempDir, EngineError> {
            let staging = TempDir::new()?;
            input.stage_into(staging.path())?;
            Ok(staging)
        })
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;

        let source = format!("{}/.", staging.path().display());
        let target = format!("{}:{}", id, container_path);
        self.output("copy-in", self.command(["cp", source.as_str(), target.as_str()]))
            .await
            .map(|_| ())
    }

    async fn copy_from_container(
        &self,
        id: &ContainerId,
        container_path: &str,
        local_dir: &Path,
    ) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(local_dir).await?;

        let source = format!("{}:{}", id, container_path);
        let mut command = self.command(["cp", source.as_str()]);
        command.arg(local_dir);
        self.output("copy-out", command).await.map(|_| ())
    }

    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerState, EngineError> {
        let raw = self
            .output(
                "inspect",
                self.command([
                    "container",
                    "inspect",
                    "--format",
                    "{{json .State}}",
                    id.as_str(),
                ]),
            )
            .await?;
        parse_state(&raw)
    }

    async fn remove_container(
        &self,
        id: &ContainerId,
        options: RemoveOptions,
    ) -> Result<(), EngineError> {
        let mut command = self.command(["rm"]);
        if options.force {
            command.arg("--force");
        }
        if options.remove_volumes {
            command.arg("--volumes");
        }
        command.arg(id.as_str());
        self.output("remove", command).await.map(|_| ())
    }
}

/// Output of a running `attach` process. End of stream is only reported once
/// the process has exited cleanly; a failed attach surfaces as a read error.
struct AttachProcess {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    eof: bool,
    exit_check: Option<BoxFuture<'static, io::Result<()>>>,
}

impl AsyncRead for AttachProcess {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if !this.eof {
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.reader).poll_read(cx, buf))?;
            if buf.filled().len() > before {
                return Poll::Ready(Ok(()));
            }
            this.eof = true;
        }

        if let Some(check) = this.exit_check.as_mut() {
            let result = ready!(check.as_mut().poll(cx));
            this.exit_check = None;
            result?;
        }
        Poll::Ready(Ok(()))
    }
}

/// `attach` relays the container's exit code, so a non-zero status is only an
/// attach failure when it does not match the exited container.
async fn check_attach_exit(
    cli: DockerCli,
    id: ContainerId,
    mut child: Child,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
) -> io::Result<()> {
    let status = child.wait().await?;
    if status.success() {
        return Ok(());
    }

    if let Some(code) = status.code() {
        if let Ok(state) = cli.inspect_container(&id).await {
            if !state.running && state.exit_code == i64::from(code) {
                return Ok(());
            }
        }
    }

    let stderr = stderr_tail
        .lock()
        .map(|tail| String::from_utf8_lossy(&tail).trim().to_string())
        .unwrap_or_default();
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("container runtime attach failed ({}): {}", status, stderr),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateJson {
    running: bool,
    exit_code: i64,
}

fn parse_state(raw: &str) -> Result<ContainerState, EngineError> {
    let state: StateJson =
        serde_json::from_str(raw).map_err(|err| EngineError::UnexpectedOutput {
            operation: "inspect",
            message: format!("failed to parse container state '{}': {}", raw, err),
        })?;

    Ok(ContainerState {
        running: state.running,
        exit_code: state.exit_code,
    })
}

/// Arguments for `create`. The first entrypoint element goes to
/// `--entrypoint`; the rest precede the command after the image.
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string()];

    if spec.tty {
        args.push("--tty".to_string());
    }
    if spec.attach_stdout {
        args.push("--attach".to_string());
        args.push("stdout".to_string());
    }
    if spec.attach_stderr {
        args.push("--attach".to_string());
        args.push("stderr".to_string());
    }

    for (key, value) in spec.env.resolved() {
        args.push("--env".to_string());
        if read_by_runtime(&key) {
            args.push(format!("{}={}", key, value));
        } else {
            args.push(key);
        }
    }

    let (entrypoint, entrypoint_args) = match spec.entrypoint.split_first() {
        Some((first, rest)) => (first.clone(), rest.to_vec()),
        None => (String::new(), Vec::new()),
    };
    args.push("--entrypoint".to_string());
    args.push(entrypoint);

    args.push(spec.image.clone());
    args.extend(entrypoint_args);
    args.push(spec.command.clone());

    args
}

/// Values handed to the runtime process's own environment, so they never
/// appear on its command line. `--env KEY` makes the runtime forward them.
pub(crate) fn create_env(spec: &ContainerSpec) -> Vec<(String, String)> {
    spec.env
        .resolved()
        .into_iter()
        .filter(|(key, _)| !read_by_runtime(key))
        .collect()
}

/// Variables the runtime binary itself interprets. They stay inline so the
/// container's values cannot redirect or break the runtime.
fn read_by_runtime(key: &str) -> bool {
    matches!(key, "PATH" | "HOME") || key.starts_with("DOCKER_")
}

fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

/// Loggable command line. `--env` values are redacted since they carry
/// credentials.
fn command_line_string(cmd: &Command) -> String {
    let cmd = cmd.as_std();
    let mut s = String::new();
    s.push_str(&cmd.get_program().to_string_lossy());
    let mut redact_next = false;
    for a in cmd.get_args() {
        s.push(' ');
        let a = a.to_string_lossy();
        if redact_next {
            redact_next = false;
            if let Some((key, _)) = a.split_once('=') {
                s.push_str(key);
                s.push_str("=<redacted>");
                continue;
            }
        }
        redact_next = a == "--env";
        if a.is_empty() || a.contains(' ') || a.contains('"') || a.contains('\'') {
            s.push_str(&shell_escape(&a));
        } else {
            s.push_str(&a);
        }
    }
    s
}

//! Recording fake engine shared by the integration specs.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use manager_runner::engine::{
    AttachedStream, ContainerEngine, ContainerId, ContainerState, PullProgress,
    RemoveOptions,
};
use manager_runner::{
    ArchiveInput, ContainerSpec, EngineError, InterruptSource, LiveOutput, ManagedRun,
    RunSettings,
};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Notify;

pub const CONTAINER_ID: &str = "f00dfacecafe0123456789";

/// What `attach` hands back.
pub enum StreamMode {
    Bytes(Vec<u8>),
    /// Never produces data and never ends.
    Pending,
    /// First read fails.
    Broken,
}

pub struct FakeEngine {
    calls: Mutex<Vec<String>>,
    failing: HashSet<&'static str>,
    pull_failure: String,
    stream: Mutex<Option<StreamMode>>,
    state: ContainerState,
    attached: Option<Arc<Notify>>,
    stalled: Option<(&'static str, Arc<Notify>)>,
    pub created: Mutex<Option<ContainerSpec>>,
    pub copied_in: Mutex<Vec<ArchiveInput>>,
}

impl FakeEngine {
    pub fn new(output: &[u8], exit_code: i64) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: HashSet::new(),
            pull_failure: "pull failed".to_string(),
            stream: Mutex::new(Some(StreamMode::Bytes(output.to_vec()))),
            state: ContainerState {
                running: false,
                exit_code,
            },
            attached: None,
            stalled: None,
            created: Mutex::new(None),
            copied_in: Mutex::new(Vec::new()),
        }
    }

    /// Fail the named operation (`pull`, `create`, `copy-in`, `start`,
    /// `attach`, `inspect`, `copy-out`, `remove`).
    pub fn failing(mut self, operation: &'static str) -> Self {
        self.failing.insert(operation);
        self
    }

    pub fn pull_failure(mut self, message: &str) -> Self {
        self.failing.insert("pull");
        self.pull_failure = message.to_string();
        self
    }

    pub fn stream(self, mode: StreamMode) -> Self {
        *self.stream.lock().unwrap() = Some(mode);
        self
    }

    pub fn still_running(mut self) -> Self {
        self.state.running = true;
        self
    }

    /// Notify `signal` once attach has been called.
    pub fn on_attach(mut self, signal: Arc<Notify>) -> Self {
        self.attached = Some(signal);
        self
    }

    /// Make `operation` notify `signal` and then never complete.
    pub fn stall_during(mut self, operation: &'static str, signal: Arc<Notify>) -> Self {
        self.stalled = Some((operation, signal));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.split(':').next() == Some(operation))
            .count()
    }

    fn record(&self, operation: &'static str, detail: &str) -> Result<(), EngineError> {
        let call = if detail.is_empty() {
            operation.to_string()
        } else {
            format!("{}:{}", operation, detail)
        };
        self.calls.lock().unwrap().push(call);

        if self.failing.contains(operation) {
            let message = if operation == "pull" {
                self.pull_failure.clone()
            } else {
                format!("{} exploded", operation)
            };
            return Err(EngineError::UnexpectedOutput { operation, message });
        }
        Ok(())
    }

    async fn checkpoint(&self, operation: &str) {
        if let Some((stalled, signal)) = &self.stalled {
            if *stalled == operation {
                signal.notify_one();
                std::future::pending::<()>().await;
            }
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull_image(&self, image: &str, _progress: PullProgress) -> Result<bool, EngineError> {
        self.record("pull", image)?;
        Ok(true)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        self.record("create", &spec.image)?;
        *self.created.lock().unwrap() = Some(spec.clone());
        Ok(ContainerId::new(CONTAINER_ID))
    }

    async fn start_container(&self, _id: &ContainerId) -> Result<(), EngineError> {
        self.record("start", "")?;
        self.checkpoint("start").await;
        Ok(())
    }

    async fn attach(&self, _id: &ContainerId) -> Result<AttachedStream, EngineError> {
        self.record("attach", "")?;
        if let Some(signal) = &self.attached {
            signal.notify_one();
        }

        let mode = self
            .stream
            .lock()
            .unwrap()
            .take()
            .unwrap_or(StreamMode::Bytes(Vec::new()));
        let stream: AttachedStream = match mode {
            StreamMode::Bytes(bytes) => Box::new(io::Cursor::new(bytes)),
            StreamMode::Pending => Box::new(PendingReader),
            StreamMode::Broken => Box::new(BrokenReader),
        };
        Ok(stream)
    }

    async fn copy_to_container(
        &self,
        _id: &ContainerId,
        input: &ArchiveInput,
        container_path: &str,
    ) -> Result<(), EngineError> {
        self.record("copy-in", container_path)?;
        self.checkpoint("copy-in").await;
        self.copied_in.lock().unwrap().push(input.clone());
        Ok(())
    }

    async fn copy_from_container(
        &self,
        _id: &ContainerId,
        container_path: &str,
        _local_dir: &Path,
    ) -> Result<(), EngineError> {
        self.record("copy-out", container_path)
    }

    async fn inspect_container(&self, _id: &ContainerId) -> Result<ContainerState, EngineError> {
        self.record("inspect", "")?;
        self.checkpoint("inspect").await;
        Ok(self.state)
    }

    async fn remove_container(
        &self,
        _id: &ContainerId,
        options: RemoveOptions,
    ) -> Result<(), EngineError> {
        assert!(options.force && options.remove_volumes);
        self.record("remove", "")
    }
}

struct PendingReader;

impl AsyncRead for PendingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

struct BrokenReader;

impl AsyncRead for BrokenReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "attach connection reset",
        )))
    }
}

/// Interrupt that fires when `signal` is notified.
pub struct TestInterrupt {
    pub signal: Arc<Notify>,
}

impl InterruptSource for TestInterrupt {
    fn listen(&self) -> BoxFuture<'static, ()> {
        let signal = Arc::clone(&self.signal);
        Box::pin(async move { signal.notified().await })
    }
}

pub fn quiet_settings() -> RunSettings {
    RunSettings {
        live_output: LiveOutput::Silent,
        cancel_grace: Duration::from_secs(1),
        ..RunSettings::default()
    }
}

pub fn runner(engine: &Arc<FakeEngine>) -> ManagedRun {
    let engine: Arc<dyn ContainerEngine> = engine.clone();
    ManagedRun::new(engine)
        .with_interrupts(Arc::new(manager_runner::NoInterrupts))
        .with_settings(quiet_settings())
}

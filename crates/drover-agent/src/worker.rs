//! Worker launch seam.
//!
//! The executor drives workers through the [`Worker`] trait so process
//! construction stays injectable; [`ProcessWorkerLauncher`] is the
//! production implementation backed by
//! [`drover_core::channel::WorkerChannel`], and the test suite scripts the
//! seam instead of forking real children.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use drover_core::channel::{ChannelError, MessageType, WorkerChannel};
use drover_core::process::{ExitWatch, WorkerSpec};
use drover_core::JobRequest;
use tokio_util::sync::CancellationToken;

/// A running worker, as the executor sees it.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Sends a control message to the worker.
    async fn send(
        &mut self,
        kind: MessageType,
        body: Bytes,
        timeout: Duration,
    ) -> Result<(), ChannelError>;

    /// Returns a watch over the worker's exit code.
    fn exit_watch(&self) -> ExitWatch;

    /// Returns the stdio captured so far, for the crash path.
    fn captured_output(&self) -> String;
}

/// Launches workers for dispatched jobs.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launches a worker for `request`. Cancelling `kill` terminates the
    /// worker's process tree.
    async fn launch(
        &self,
        request: &JobRequest,
        kill: CancellationToken,
    ) -> Result<Box<dyn Worker>, ChannelError>;
}

#[async_trait]
impl Worker for WorkerChannel {
    async fn send(
        &mut self,
        kind: MessageType,
        body: Bytes,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        WorkerChannel::send(self, kind, body, timeout).await
    }

    fn exit_watch(&self) -> ExitWatch {
        WorkerChannel::exit_watch(self)
    }

    fn captured_output(&self) -> String {
        WorkerChannel::captured_output(self)
    }
}

/// Production launcher: spawns the worker executable over a fresh pipe
/// pair for every job.
#[derive(Debug, Clone)]
pub struct ProcessWorkerLauncher {
    spec: WorkerSpec,
}

impl ProcessWorkerLauncher {
    /// Creates a launcher for the given worker spec.
    #[must_use]
    pub const fn new(spec: WorkerSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessWorkerLauncher {
    async fn launch(
        &self,
        _request: &JobRequest,
        kill: CancellationToken,
    ) -> Result<Box<dyn Worker>, ChannelError> {
        let spec = self.spec.clone();
        let channel = WorkerChannel::start(move |out_fd, in_fd| spec.spawn(out_fd, in_fd), &kill)?;
        Ok(Box::new(channel))
    }
}

//! Per-job cancellation graph and agent shutdown state.
//!
//! Every dispatched job carries three cancellation signals with strictly
//! separated roles:
//!
//! - `job_cancel` — graceful: an external cancel request, or lease loss.
//! - the kill deadline — escalation: fires once the graceful window has
//!   been exhausted.
//! - `worker_cancel` — terminal: kills the worker's process tree.
//!
//! Graceful cancel must precede the kill by the padded timeout; the
//! executor is the only writer of `worker_cancel`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drover_core::JobRequest;
use tokio_util::sync::CancellationToken;

use crate::metadata::MetadataSlot;

/// One-shot timer that fires the worker kill deadline.
///
/// Both the dispatcher front-end (on an external cancel) and the executor
/// (when it enters graceful termination without one) try to arm it; the
/// first caller wins and later arms are ignored, so the deadline can never
/// shrink after a cancel has promised one.
#[derive(Debug, Clone, Default)]
pub struct KillTimer {
    deadline: CancellationToken,
    armed: Arc<AtomicBool>,
}

impl KillTimer {
    /// Creates an unarmed timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer to fire after `delay`. Later calls are no-ops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm(&self, delay: Duration) {
        if self.armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = self.deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            deadline.cancel();
        });
    }

    /// Returns the token that fires when the deadline elapses.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.deadline
    }

    /// Returns `true` once the timer has been armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

/// Reasons the agent is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An operator or supervisor asked the agent to stop.
    UserRequested,
    /// The host operating system is going down.
    OperatingSystem,
}

/// Agent-wide shutdown state, shared with running executors.
///
/// The first recorded reason sticks; the executor consults it to pick the
/// cancel-family message it sends the worker.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    /// Creates a signal with shutdown not in progress.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks shutdown as in progress. The first reason wins.
    pub fn initiate(&self, reason: ShutdownReason) {
        let mut slot = self.reason.lock().expect("shutdown lock poisoned");
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// Returns `true` once shutdown has been initiated.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.reason.lock().expect("shutdown lock poisoned").is_some()
    }

    /// Returns the recorded shutdown reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().expect("shutdown lock poisoned")
    }
}

/// Per-job context, created by the front-end and owned by the executor.
#[derive(Debug)]
pub struct JobContext {
    /// The job request, frozen at dispatch time.
    pub request: Arc<JobRequest>,

    /// External or lease-loss driven graceful cancellation.
    pub job_cancel: CancellationToken,

    /// Escalation deadline for the graceful window.
    pub kill_timer: KillTimer,

    /// Kills the worker process tree. Driven only by the executor.
    pub worker_cancel: CancellationToken,

    /// Pending metadata rendezvous with the front-end.
    pub metadata: Arc<MetadataSlot>,
}

impl JobContext {
    /// Creates a fresh context for a request.
    #[must_use]
    pub fn new(request: JobRequest) -> Self {
        Self {
            request: Arc::new(request),
            job_cancel: CancellationToken::new(),
            kill_timer: KillTimer::new(),
            worker_cancel: CancellationToken::new(),
            metadata: Arc::new(MetadataSlot::new()),
        }
    }
}

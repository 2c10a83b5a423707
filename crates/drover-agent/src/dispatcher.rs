//! Dispatcher front-end.
//!
//! The front-end accepts the agent's external control events — new job,
//! cancel, metadata update, wait, shutdown — and serializes them against
//! the single in-flight executor. Its producer is the agent's message-queue
//! loop, which invokes these operations one at a time; the internal mutex
//! exists because executor tasks share the registry, not to support
//! concurrent front-end callers.
//!
//! # Registry discipline
//!
//! The registry maps `job_id → entry` and carries a single-element queue
//! of the most recent dispatch, used only so a newly arriving job can
//! locate its predecessor. An executor removes its own entry when it
//! finishes; the front-end removes entries only on the `wait`/`shutdown`
//! paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drover_core::job::RUN_ONCE_VARIABLE;
use drover_core::{JobMetadata, JobRequest};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{
    DispatchConfig, DEFAULT_GRACEFUL_TIMEOUT, KILL_GRACE_PADDING, MAX_CANCEL_TIMEOUT,
};
use crate::context::{JobContext, KillTimer, ShutdownReason, ShutdownSignal};
use crate::executor::{self, DispatchError, PreviousDispatch};
use crate::metadata::MetadataSlot;
use crate::services::DispatchServices;

/// Graceful window injected when [`JobDispatcher::wait`] is interrupted.
pub const WAIT_CANCEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Registry entry for one dispatch.
struct DispatchEntry {
    request_id: u64,
    job_cancel: CancellationToken,
    worker_cancel: CancellationToken,
    kill_timer: KillTimer,
    metadata: Arc<MetadataSlot>,
    done: watch::Receiver<bool>,
    task: Option<JoinHandle<Result<(), DispatchError>>>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<Uuid, DispatchEntry>,
    /// Most recent dispatch; at most one element.
    recent: VecDeque<Uuid>,
}

/// Shared dispatch registry.
struct DispatchRegistry {
    inner: Mutex<RegistryInner>,
    /// Number of live entries, for `wait_until_idle`.
    active: watch::Sender<usize>,
}

impl DispatchRegistry {
    fn new() -> Arc<Self> {
        let (active, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(RegistryInner::default()),
            active,
        })
    }

    fn insert(&self, job_id: Uuid, entry: DispatchEntry) {
        let mut inner = self.inner.lock().expect("dispatch registry lock poisoned");
        inner.entries.insert(job_id, entry);
        inner.recent.push_back(job_id);
        let _ = self.active.send(inner.entries.len());
    }

    fn remove(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().expect("dispatch registry lock poisoned");
        inner.entries.remove(&job_id);
        inner.recent.retain(|id| *id != job_id);
        let _ = self.active.send(inner.entries.len());
    }

    /// Pops the most recent dispatch for the new job to await.
    fn take_previous(&self) -> Option<PreviousDispatch> {
        let mut inner = self.inner.lock().expect("dispatch registry lock poisoned");
        let job_id = inner.recent.pop_front()?;
        inner.entries.get(&job_id).map(|entry| PreviousDispatch {
            job_id,
            request_id: entry.request_id,
            worker_cancel: entry.worker_cancel.clone(),
            done: entry.done.clone(),
        })
    }

    /// Takes the running executor's join handle, for `wait`/`shutdown`.
    ///
    /// Prefers the most recent dispatch; during a handover the older
    /// executor is already being driven to completion by the newer one.
    fn take_task(&self) -> Option<(Uuid, JoinHandle<Result<(), DispatchError>>, CancellationToken)> {
        let mut inner = self.inner.lock().expect("dispatch registry lock poisoned");
        let preferred = inner.recent.front().copied();
        let RegistryInner { entries, .. } = &mut *inner;
        preferred
            .into_iter()
            .chain(entries.keys().copied().collect::<Vec<_>>())
            .find_map(|job_id| {
                let entry = entries.get_mut(&job_id)?;
                let task = entry.task.take()?;
                Some((job_id, task, entry.worker_cancel.clone()))
            })
    }

    fn cancel_handles(&self, job_id: Uuid) -> Option<(CancellationToken, KillTimer)> {
        let inner = self.inner.lock().expect("dispatch registry lock poisoned");
        inner
            .entries
            .get(&job_id)
            .map(|entry| (entry.job_cancel.clone(), entry.kill_timer.clone()))
    }

    fn metadata_slot(&self, job_id: Uuid) -> Option<Arc<MetadataSlot>> {
        let inner = self.inner.lock().expect("dispatch registry lock poisoned");
        inner.entries.get(&job_id).map(|entry| Arc::clone(&entry.metadata))
    }

    fn subscribe_active(&self) -> watch::Receiver<usize> {
        self.active.subscribe()
    }
}

/// The dispatcher front-end.
///
/// One instance lives for the agent's lifetime and processes jobs
/// strictly serially: a new job first drives the previous dispatch to
/// completion before any of its own work starts.
pub struct JobDispatcher {
    config: Arc<DispatchConfig>,
    services: DispatchServices,
    registry: Arc<DispatchRegistry>,
    shutdown: Arc<ShutdownSignal>,
    run_once_done: watch::Sender<bool>,
}

impl JobDispatcher {
    /// Creates a dispatcher over the injected collaborators.
    #[must_use]
    pub fn new(config: DispatchConfig, services: DispatchServices) -> Self {
        let (run_once_done, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            services,
            registry: DispatchRegistry::new(),
            shutdown: Arc::new(ShutdownSignal::new()),
            run_once_done,
        }
    }

    /// Dispatches a newly received job request.
    ///
    /// Returns as soon as the executor task is running; completion is
    /// observed through [`wait`](Self::wait),
    /// [`wait_until_idle`](Self::wait_until_idle) or, in run-once mode,
    /// the [`run_once_completed`](Self::run_once_completed) signal.
    pub fn run(&self, mut message: JobRequest, run_once: bool) {
        if run_once {
            message
                .variables
                .insert(RUN_ONCE_VARIABLE.to_string(), "true".to_string());
        }

        let previous = self.registry.take_previous();
        if let Some(previous) = &previous {
            debug!(
                previous_job = %previous.job_id,
                "new job arrived with a previous dispatch outstanding"
            );
        }

        let ctx = JobContext::new(message);
        let job_id = ctx.request.job_id;
        let request_id = ctx.request.request_id;
        info!(%job_id, request_id, name = %ctx.request.job_name, "dispatching job");

        let (done_tx, done_rx) = watch::channel(false);
        let entry_bits = DispatchEntry {
            request_id,
            job_cancel: ctx.job_cancel.clone(),
            worker_cancel: ctx.worker_cancel.clone(),
            kill_timer: ctx.kill_timer.clone(),
            metadata: Arc::clone(&ctx.metadata),
            done: done_rx,
            task: None,
        };

        // The executor holds at the gate until its entry is registered, so
        // a job that finishes instantly still finds itself in the registry
        // to remove.
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let services = self.services.clone();
        let config = Arc::clone(&self.config);
        let shutdown = Arc::clone(&self.shutdown);
        let registry = Arc::clone(&self.registry);
        let run_once_done = run_once.then(|| self.run_once_done.clone());

        let task = tokio::spawn(async move {
            let _ = gate_rx.await;

            let result = executor::run_job(services.clone(), config, shutdown, ctx, previous).await;
            if let Err(err) = &result {
                error!(%job_id, %err, "job dispatch failed");
            }

            // Guaranteed-execute tail: the executor removes itself, then
            // the completion hook fires strictly after the report.
            registry.remove(job_id);
            let _ = done_tx.send(true);
            services.notifications.job_completed(job_id).await;
            if let Some(tx) = run_once_done {
                let _ = tx.send(true);
            }

            result
        });

        let mut entry = entry_bits;
        entry.task = Some(task);
        self.registry.insert(job_id, entry);
        let _ = gate_tx.send(());
    }

    /// Requests cancellation of a running job.
    ///
    /// The worker gets a graceful window of `max(timeout, 60 s)`, capped at
    /// 35 790 minutes; the forced kill fires 15 seconds before that window
    /// ends so the completion report still has time to run. Returns `false`
    /// when the job is not (or no longer) running.
    pub fn cancel(&self, job_id: Uuid, timeout: Duration) -> bool {
        let Some((job_cancel, kill_timer)) = self.registry.cancel_handles(job_id) else {
            debug!(%job_id, "cancel requested for an unknown job");
            return false;
        };

        let graceful = timeout.clamp(DEFAULT_GRACEFUL_TIMEOUT, MAX_CANCEL_TIMEOUT);
        info!(%job_id, window = ?graceful, "canceling job");
        kill_timer.arm(graceful - KILL_GRACE_PADDING);
        job_cancel.cancel();
        true
    }

    /// Delivers a metadata update to a running job.
    ///
    /// A no-op returning `false` when the job is gone; metadata is
    /// cumulative, so a missed update is covered by the next one.
    pub fn metadata_update(&self, job_id: Uuid, update: JobMetadata) -> bool {
        match self.registry.metadata_slot(job_id) {
            Some(slot) => {
                slot.publish(update);
                true
            }
            None => {
                debug!(%job_id, "metadata update for an unknown job dropped");
                false
            }
        }
    }

    /// Waits for the in-flight dispatch to complete.
    ///
    /// When `interrupt` fires first, a 60-second graceful cancel is
    /// injected and the wait resumes. The registry entry is always removed
    /// on exit.
    ///
    /// # Errors
    ///
    /// Propagates the executor's fatal [`DispatchError`]s.
    pub async fn wait(&self, interrupt: &CancellationToken) -> Result<(), DispatchError> {
        let Some((job_id, mut task, _worker_cancel)) = self.registry.take_task() else {
            return Ok(());
        };

        let result = tokio::select! {
            result = &mut task => result,
            () = interrupt.cancelled() => {
                info!(%job_id, "wait interrupted; canceling the running job");
                self.cancel(job_id, WAIT_CANCEL_TIMEOUT);
                task.await
            }
        };

        self.registry.remove(job_id);
        flatten(result)
    }

    /// Records that agent shutdown has begun.
    ///
    /// Running executors consult this to pick the cancel-family message
    /// they send their worker; call it before canceling or waiting when
    /// the agent is going down gracefully.
    pub fn begin_shutdown(&self, reason: ShutdownReason) {
        self.shutdown.initiate(reason);
    }

    /// Hard-stops the in-flight dispatch.
    ///
    /// Unlike [`wait`](Self::wait) this does not grant a graceful window:
    /// the worker's process tree is killed outright and the executor is
    /// awaited.
    ///
    /// # Errors
    ///
    /// Propagates the executor's fatal [`DispatchError`]s.
    pub async fn shutdown(&self, reason: ShutdownReason) -> Result<(), DispatchError> {
        self.begin_shutdown(reason);

        let Some((job_id, task, worker_cancel)) = self.registry.take_task() else {
            return Ok(());
        };

        warn!(%job_id, "shutting down with a job in flight; killing its worker");
        worker_cancel.cancel();
        let result = task.await;

        self.registry.remove(job_id);
        flatten(result)
    }

    /// Resolves once the run-once dispatch has fully completed.
    ///
    /// Single-fire: the signal is set in the executor's guaranteed-execute
    /// tail, after the completion report and notification.
    pub async fn run_once_completed(&self) {
        let mut rx = self.run_once_done.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves when no dispatch is in flight.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.registry.subscribe_active();
        while *rx.borrow_and_update() != 0 {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn flatten(
    result: Result<Result<(), DispatchError>, tokio::task::JoinError>,
) -> Result<(), DispatchError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DispatchError::TaskFailed(err.to_string())),
    }
}

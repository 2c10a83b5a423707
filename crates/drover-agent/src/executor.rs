//! Job executor: drives one dispatched job end to end.
//!
//! For a single job the executor owns five concerns that must interleave
//! without losing work: the previous dispatch's teardown, the lease
//! renewer, the worker process, cancellation, and completion reporting.
//!
//! # Lifecycle
//!
//! ```text
//! AwaitingPreviousJob
//!   → AwaitingFirstRenewal
//!   → SendingJobPayload
//!   → Running ───────────────→ (worker exit) ─→ Reporting
//!        │
//!        └─ (cancel / lease loss) → TerminatingGracefully
//!                                      → WaitingForWorkerExit → Reporting
//! ```
//!
//! # Invariants
//!
//! - Nothing is sent to the worker before the first lease renewal succeeds.
//! - A graceful cancel always precedes the forced kill by the padded
//!   timeout.
//! - The worker child is reaped before the executor returns, on every path.
//! - `Succeeded`/`Failed` derive from a worker exit code (or the shutdown
//!   override); `Canceled`/`Abandoned` derive from signals, never from exit
//!   codes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use drover_core::channel::{encode_body, MessageType};
use drover_core::outcome::outcome_for_exit;
use drover_core::process::ExitWatch;
use drover_core::{JobRequest, Outcome};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{
    DispatchConfig, CONNECT_TIMEOUT, DEFAULT_GRACEFUL_TIMEOUT, KILL_GRACE_PADDING,
    PREVIOUS_EXIT_GRACE,
};
use crate::context::{JobContext, ShutdownReason, ShutdownSignal};
use crate::renewer::LeaseRenewer;
use crate::reporter::{report_completion, ReportError};
use crate::rpc::{ConnectionKind, JobIssue, ServerError};
use crate::services::{
    DispatchServices, FlagState, TelemetryEvent, FAIL_JOB_WHEN_AGENT_DIES,
};
use crate::worker::Worker;

/// Fatal dispatch failures surfaced to the front-end.
///
/// Everything else the executor encounters is folded into the job's
/// [`Outcome`]; these variants are the cases where continuing would risk
/// running a job twice or reporting against a state the server does not
/// share.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The server handed out a new job while the previous request was
    /// still active on its side.
    #[error("server dispatched a new job while request {request_id} is still active")]
    ProtocolViolation {
        /// The still-active previous request.
        request_id: u64,
    },

    /// The previous dispatch's worker ignored its kill and never exited.
    #[error("previous dispatch for job {job_id} did not exit within {timeout:?}")]
    DispatchNotCanceled {
        /// The stuck previous job.
        job_id: Uuid,
        /// The grace window that elapsed.
        timeout: Duration,
    },

    /// The status query for the previous dispatch failed; the agent must
    /// not continue blind.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The completion report exhausted its retries.
    #[error(transparent)]
    Report(#[from] ReportError),

    /// The executor task itself failed.
    #[error("dispatch task failed: {0}")]
    TaskFailed(String),
}

/// The front-end's handle on a still-outstanding previous dispatch.
#[derive(Debug, Clone)]
pub(crate) struct PreviousDispatch {
    /// The previous job.
    pub job_id: Uuid,
    /// Its server request.
    pub request_id: u64,
    /// Kill switch for its worker.
    pub worker_cancel: CancellationToken,
    /// Flips to `true` when its executor has fully finished.
    pub done: watch::Receiver<bool>,
}

/// Runs one job through its whole lifecycle.
///
/// Returns `Ok(())` for every job that reached an outcome (including
/// canceled and abandoned ones); errors are reserved for the fatal cases
/// in [`DispatchError`].
pub(crate) async fn run_job(
    services: DispatchServices,
    config: Arc<DispatchConfig>,
    shutdown: Arc<ShutdownSignal>,
    ctx: JobContext,
    previous: Option<PreviousDispatch>,
) -> Result<(), DispatchError> {
    let job_id = ctx.request.job_id;

    // ---- AwaitingPreviousJob ------------------------------------------
    if let Some(previous) = previous {
        await_previous(&services, &config, previous).await?;
    }

    // ---- AwaitingFirstRenewal -----------------------------------------
    // The refresh is best effort: the renewer's retry envelope owns
    // connectivity problems from here on.
    if let Err(err) = services
        .client
        .refresh_connection(ConnectionKind::JobServer, CONNECT_TIMEOUT)
        .await
    {
        warn!(%job_id, %err, "job server connection refresh failed");
    }

    let renew_cancel = CancellationToken::new();
    let renewer = LeaseRenewer::new(
        Arc::clone(&services.client),
        config.pool_id,
        ctx.request.request_id,
        ctx.request.lock_token,
    );
    let (first_tx, first_rx) = oneshot::channel();
    let mut renew_task = tokio::spawn(renewer.run(first_tx, renew_cancel.clone()));
    let mut renewer_done = false;

    tokio::select! {
        () = ctx.job_cancel.cancelled() => {
            info!(%job_id, "job canceled before the first lease renewal");
            stop_renewer(&renew_cancel, &mut renew_task, &mut renewer_done).await;
            return finish(&services, &config, &ctx.request, Outcome::Canceled).await;
        }
        first = first_rx => {
            if first.is_err() {
                // The renewer returned without ever succeeding; the job
                // must not start and the server will re-queue it.
                stop_renewer(&renew_cancel, &mut renew_task, &mut renewer_done).await;
                warn!(%job_id, "first lease renewal failed; the job will not start");
                return Ok(());
            }
        }
    }

    // ---- SendingJobPayload --------------------------------------------
    let payload = match encode_job_payload(&ctx.request) {
        Ok(payload) => payload,
        Err(err) => {
            error!(%job_id, %err, "job request could not be serialized for the worker");
            stop_renewer(&renew_cancel, &mut renew_task, &mut renewer_done).await;
            return finish(&services, &config, &ctx.request, Outcome::Failed).await;
        }
    };

    let mut worker = match services
        .launcher
        .launch(&ctx.request, ctx.worker_cancel.clone())
        .await
    {
        Ok(worker) => worker,
        Err(err) => {
            error!(%job_id, %err, "failed to launch the worker process");
            stop_renewer(&renew_cancel, &mut renew_task, &mut renewer_done).await;
            return finish(&services, &config, &ctx.request, Outcome::Failed).await;
        }
    };
    let mut exit = worker.exit_watch();

    services
        .notifications
        .job_started(job_id, &ctx.request.job_name)
        .await;

    if let Err(err) = worker
        .send(
            MessageType::NewJobRequest,
            payload,
            config.channel.send_timeout,
        )
        .await
    {
        // The worker never accepted the job. Kill it and report nothing:
        // the server will observe the lease expiring and re-queue.
        warn!(%job_id, %err, "could not deliver the job to the worker");
        ctx.worker_cancel.cancel();
        exit.wait().await;
        stop_renewer(&renew_cancel, &mut renew_task, &mut renewer_done).await;
        return Ok(());
    }
    debug!(%job_id, "job payload delivered to the worker");

    // ---- Running -------------------------------------------------------
    enum RunEvent {
        Exited(i32),
        LeaseLost,
        CancelRequested,
    }

    // Biased: a worker exit outranks a lease loss outranks a cancel, and a
    // cancel always outranks pending metadata, so no metadata send can be
    // attempted once graceful termination is due.
    let event = loop {
        tokio::select! {
            biased;
            code = exit.wait() => break RunEvent::Exited(code),
            _ = &mut renew_task, if !renewer_done => {
                renewer_done = true;
                break RunEvent::LeaseLost;
            }
            () = ctx.job_cancel.cancelled() => break RunEvent::CancelRequested,
            () = ctx.metadata.updated() => {
                forward_metadata(&ctx, worker.as_mut(), &config).await;
            }
        }
    };

    let outcome = match event {
        RunEvent::Exited(code) => {
            conclude_exit(&services, &config, &ctx, code, worker.as_ref()).await
        }
        RunEvent::LeaseLost => {
            warn!(%job_id, "job lease lost; abandoning the job");
            terminate_worker(
                &services,
                &config,
                &shutdown,
                &ctx,
                worker.as_mut(),
                &mut exit,
                Outcome::Abandoned,
            )
            .await
        }
        RunEvent::CancelRequested => {
            info!(%job_id, "job cancellation requested");
            terminate_worker(
                &services,
                &config,
                &shutdown,
                &ctx,
                worker.as_mut(),
                &mut exit,
                Outcome::Canceled,
            )
            .await
        }
    };

    // ---- Reporting -----------------------------------------------------
    stop_renewer(&renew_cancel, &mut renew_task, &mut renewer_done).await;
    finish(&services, &config, &ctx.request, outcome).await
}

/// Drives the previous dispatch to completion before any new work starts.
///
/// This is the backstop against silent double execution; the fatal paths
/// here are deliberate and must not be softened.
async fn await_previous(
    services: &DispatchServices,
    config: &DispatchConfig,
    mut previous: PreviousDispatch,
) -> Result<(), DispatchError> {
    if *previous.done.borrow() {
        return Ok(());
    }

    info!(
        job_id = %previous.job_id,
        "previous dispatch still running; querying the server for its request"
    );

    match services
        .client
        .get_job_request(config.pool_id, previous.request_id)
        .await
    {
        Ok(status) => {
            if let Some(result) = status.result {
                // The server considers the old job finished while its
                // worker still runs locally; the worker is a straggler
                // with a bounded window to die.
                warn!(
                    job_id = %previous.job_id,
                    %result,
                    "server considers the previous job finished; killing its worker"
                );
                previous.worker_cancel.cancel();
                if !wait_done(&mut previous.done, PREVIOUS_EXIT_GRACE).await {
                    return Err(DispatchError::DispatchNotCanceled {
                        job_id: previous.job_id,
                        timeout: PREVIOUS_EXIT_GRACE,
                    });
                }
                Ok(())
            } else {
                // Should never happen: the server must not hand out a new
                // job while the old request is still active.
                error!(
                    request_id = previous.request_id,
                    "server dispatched a new job while the previous request is still active"
                );
                Err(DispatchError::ProtocolViolation {
                    request_id: previous.request_id,
                })
            }
        }
        Err(err) => {
            // Without the server's view the agent must not continue blind.
            error!(
                request_id = previous.request_id,
                %err,
                "could not query the previous request; stopping"
            );
            previous.worker_cancel.cancel();
            let _ = wait_done(&mut previous.done, PREVIOUS_EXIT_GRACE).await;
            Err(DispatchError::Server(err))
        }
    }
}

/// Waits for a previous dispatch's done flag, bounded by `timeout`.
///
/// A dropped sender counts as done: the executor task is gone.
async fn wait_done(done: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .is_ok()
}

/// Maps a worker exit to the job outcome, handling the crash path.
async fn conclude_exit(
    services: &DispatchServices,
    config: &DispatchConfig,
    ctx: &JobContext,
    code: i32,
    worker: &dyn Worker,
) -> Outcome {
    let job_id = ctx.request.job_id;

    if let Some(outcome) = outcome_for_exit(code) {
        info!(%job_id, code, %outcome, "worker exited");
        return outcome;
    }

    let output = worker.captured_output();
    error!(%job_id, code, "worker exited outside the defined code set");

    let mut message = format!("Worker process exited unexpectedly with code {code}.");
    if !output.is_empty() {
        message.push('\n');
        message.push_str(&output);
    }

    // Timeline and telemetry are ancillary; their failures are logged and
    // swallowed so they can never change the outcome.
    if let Err(err) = services
        .client
        .append_job_issue(config.pool_id, job_id, JobIssue::error(message))
        .await
    {
        warn!(%job_id, %err, "could not record the crash on the job timeline");
    }
    services.telemetry.publish(TelemetryEvent::WorkerCrash {
        job_id,
        exit_code: code,
    });

    Outcome::Failed
}

/// TerminatingGracefully and WaitingForWorkerExit.
///
/// Sends the cancel-family message matching the agent's shutdown state,
/// then waits for the worker to exit, escalating to the process-tree kill
/// when the kill deadline fires or the message cannot be delivered.
async fn terminate_worker(
    services: &DispatchServices,
    config: &DispatchConfig,
    shutdown: &ShutdownSignal,
    ctx: &JobContext,
    worker: &mut dyn Worker,
    exit: &mut ExitWatch,
    mut outcome: Outcome,
) -> Outcome {
    let job_id = ctx.request.job_id;

    let kind = match shutdown.reason() {
        None => MessageType::CancelRequest,
        Some(ShutdownReason::UserRequested) => MessageType::AgentShutdown,
        Some(ShutdownReason::OperatingSystem) => MessageType::OperatingSystemShutdown,
    };

    if let Some(reason) = shutdown.reason() {
        if matches!(
            services.features.get(FAIL_JOB_WHEN_AGENT_DIES).await,
            Some(FlagState::On)
        ) {
            outcome = Outcome::Failed;
        }
        services
            .telemetry
            .publish(TelemetryEvent::JobInterruptedByShutdown {
                job_id,
                reason,
                failed: outcome == Outcome::Failed,
            });
    }

    // Lease loss reaches here without an external cancel having armed the
    // deadline; the default window applies then. An armed timer wins.
    ctx.kill_timer
        .arm(DEFAULT_GRACEFUL_TIMEOUT - KILL_GRACE_PADDING);

    match worker
        .send(kind, Bytes::new(), config.channel.send_timeout)
        .await
    {
        Ok(()) => {
            debug!(%job_id, ?kind, "cancel message delivered; waiting for the worker");
            tokio::select! {
                biased;
                _ = exit.wait() => {}
                () = ctx.kill_timer.token().cancelled() => {
                    warn!(%job_id, "graceful cancel window elapsed; killing the worker");
                    ctx.worker_cancel.cancel();
                    exit.wait().await;
                }
            }
        }
        Err(err) => {
            warn!(%job_id, %err, "cancel message could not be delivered; killing the worker");
            ctx.worker_cancel.cancel();
            exit.wait().await;
        }
    }

    outcome
}

/// Forwards a pending metadata update to the worker.
///
/// Delivery failures are logged and the job keeps running; only the
/// initial payload send is load-bearing enough to tear a job down.
async fn forward_metadata(ctx: &JobContext, worker: &mut dyn Worker, config: &DispatchConfig) {
    let Some(update) = ctx.metadata.take() else {
        return;
    };
    let body = match serde_json::to_string(&update) {
        Ok(json) => encode_body(&json),
        Err(err) => {
            warn!(job_id = %ctx.request.job_id, %err, "metadata update could not be serialized");
            return;
        }
    };
    match worker
        .send(MessageType::JobMetadataUpdate, body, config.channel.send_timeout)
        .await
    {
        Ok(()) => debug!(job_id = %ctx.request.job_id, "metadata update forwarded"),
        Err(err) => {
            warn!(job_id = %ctx.request.job_id, %err, "metadata update could not be delivered");
        }
    }
}

/// Emits the single outcome line and reports completion.
async fn finish(
    services: &DispatchServices,
    config: &DispatchConfig,
    request: &JobRequest,
    outcome: Outcome,
) -> Result<(), DispatchError> {
    info!(
        time = %Utc::now(),
        name = %request.job_name,
        result = %outcome,
        "JobCompleted"
    );
    report_completion(services.client.as_ref(), config.pool_id, request, outcome).await?;
    Ok(())
}

fn encode_job_payload(request: &JobRequest) -> Result<Bytes, serde_json::Error> {
    Ok(encode_body(&serde_json::to_string(request)?))
}

/// Stops the lease renewer and reaps its task. Idempotent.
async fn stop_renewer(
    cancel: &CancellationToken,
    task: &mut JoinHandle<()>,
    done: &mut bool,
) {
    if *done {
        return;
    }
    cancel.cancel();
    if let Err(err) = (&mut *task).await {
        warn!(%err, "lease renewer task failed");
    }
    *done = true;
}

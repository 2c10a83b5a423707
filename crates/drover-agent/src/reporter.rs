//! Completion reporting.
//!
//! Exactly one completion report reaches the server per job, unless the
//! plan's worker emits the terminal event itself. Transient failures are
//! retried on a short fixed cadence; terminal server answers are absorbed
//! because they mean the server already closed the request.

use std::time::Duration;

use chrono::Utc;
use drover_core::{JobRequest, Outcome, PlanFeature};
use tracing::{debug, warn};

use crate::rpc::{OrchestrationClient, ServerError};

/// Attempts before a completion report is declared failed.
pub const COMPLETION_ATTEMPTS: u32 = 5;

/// Fixed delay between completion report attempts.
pub const COMPLETION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Errors surfaced by the completion reporter.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReportError {
    /// Every attempt failed; the individual errors are aggregated.
    #[error(
        "completion report for request {request_id} failed after {attempts} attempts: {}",
        summarize(.errors)
    )]
    Exhausted {
        /// The request being reported.
        request_id: u64,
        /// How many attempts were made.
        attempts: u32,
        /// The error from each attempt, in order.
        errors: Vec<ServerError>,
    },
}

fn summarize(errors: &[ServerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Reports a job's terminal outcome to the orchestration service.
///
/// Skipped entirely when the plan advertises
/// [`PlanFeature::JobCompletedPlanEvent`]: the worker has already emitted
/// the terminal event and a second report would be a protocol error.
///
/// # Errors
///
/// Returns [`ReportError::Exhausted`] once every attempt has failed with a
/// non-terminal error.
pub async fn report_completion(
    client: &dyn OrchestrationClient,
    pool_id: u64,
    request: &JobRequest,
    outcome: Outcome,
) -> Result<(), ReportError> {
    if request.plan.has_feature(PlanFeature::JobCompletedPlanEvent) {
        debug!(
            job_id = %request.job_id,
            "plan emits its own completion event; skipping the report"
        );
        return Ok(());
    }

    let finished_at = Utc::now();
    let mut errors = Vec::new();

    for attempt in 1..=COMPLETION_ATTEMPTS {
        match client
            .finish_job_request(
                pool_id,
                request.request_id,
                request.lock_token,
                outcome,
                finished_at,
            )
            .await
        {
            Ok(()) => {
                debug!(
                    job_id = %request.job_id,
                    request_id = request.request_id,
                    %outcome,
                    "job completion reported"
                );
                return Ok(());
            }
            Err(err) if err.is_terminal() => {
                debug!(
                    job_id = %request.job_id,
                    %err,
                    "server already considers the request finished"
                );
                return Ok(());
            }
            Err(err) => {
                warn!(
                    job_id = %request.job_id,
                    attempt,
                    %err,
                    "completion report attempt failed"
                );
                errors.push(err);
                if attempt < COMPLETION_ATTEMPTS {
                    tokio::time::sleep(COMPLETION_RETRY_DELAY).await;
                }
            }
        }
    }

    Err(ReportError::Exhausted {
        request_id: request.request_id,
        attempts: COMPLETION_ATTEMPTS,
        errors,
    })
}

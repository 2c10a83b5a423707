//! Terminal job outcomes and the worker exit-code contract.
//!
//! The worker communicates its result through its exit code. The defined
//! set below is the entire contract; any other code means the worker died
//! without reaching its own shutdown path, and the dispatcher reports the
//! job as failed with the captured stdio attached.

use serde::{Deserialize, Serialize};

/// Exit code of a worker that completed its job successfully.
pub const EXIT_SUCCEEDED: i32 = 0;

/// Exit code of a worker whose job failed at the task level.
pub const EXIT_TASK_FAILURE: i32 = 64;

/// Exit code of a worker whose job failed for infrastructure reasons.
pub const EXIT_INFRA_FAILURE: i32 = 65;

/// Exit code of a worker acknowledging a cooperative cancel.
pub const EXIT_CANCELED: i32 = 66;

/// Terminal classification of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    /// The worker ran the job to completion.
    Succeeded,
    /// The job failed, either in a task or in the worker itself.
    Failed,
    /// The job was canceled by an external request.
    Canceled,
    /// The server-side lease was lost while the job was still running.
    Abandoned,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Canceled => write!(f, "Canceled"),
            Self::Abandoned => write!(f, "Abandoned"),
        }
    }
}

/// Maps a worker exit code to a terminal outcome.
///
/// Returns `None` for any code outside the defined set. The caller treats
/// that as a crash: the job is reported `Failed` and the captured stdio is
/// attached to the report.
#[must_use]
pub const fn outcome_for_exit(code: i32) -> Option<Outcome> {
    match code {
        EXIT_SUCCEEDED => Some(Outcome::Succeeded),
        EXIT_TASK_FAILURE | EXIT_INFRA_FAILURE => Some(Outcome::Failed),
        EXIT_CANCELED => Some(Outcome::Canceled),
        _ => None,
    }
}

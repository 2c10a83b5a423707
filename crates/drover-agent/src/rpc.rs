//! Orchestration service client seam.
//!
//! The dispatch core never owns a transport. Everything it needs from the
//! orchestration service is expressed through [`OrchestrationClient`], which
//! the hosting agent implements over its HTTP stack and injects at
//! construction time. This keeps the core testable with scripted fakes and
//! keeps credential handling out of scope here.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_core::Outcome;
use uuid::Uuid;

/// Connection classes the agent maintains to the orchestration service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionKind {
    /// The job-request connection used by renew, finish, and query calls.
    JobServer,
}

/// Errors surfaced by the orchestration client.
///
/// Implementations must fold their transport errors into this taxonomy;
/// the dispatch core's retry behavior is driven entirely by it.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ServerError {
    /// The server no longer knows the request; the job is terminal there.
    #[error("job request {0} no longer exists on the server")]
    JobNotFound(u64),

    /// The lease token has expired; the job is terminal on the server.
    #[error("job token expired for request {0}")]
    JobTokenExpired(u64),

    /// A retryable failure: connectivity, server errors, timeouts.
    #[error("transient orchestration error: {0}")]
    Transient(String),
}

impl ServerError {
    /// Terminal errors mean the server already considers the job finished;
    /// retrying them is pointless and reporting against them is a no-op.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::JobTokenExpired(_))
    }
}

/// A renewed lease on a job request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLease {
    /// Instant until which the server holds the job locked for this agent.
    pub locked_until: DateTime<Utc>,
}

/// Server-side view of a job request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestStatus {
    /// Terminal result, if the server has recorded one.
    pub result: Option<Outcome>,
}

/// An issue attached to a job's timeline record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobIssue {
    /// Human-readable issue text.
    pub message: String,
}

impl JobIssue {
    /// Creates an error-severity issue.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Client for the orchestration service, injected by the hosting agent.
#[async_trait]
pub trait OrchestrationClient: Send + Sync {
    /// Extends the server-side lock on a job request.
    async fn renew_job_request(
        &self,
        pool_id: u64,
        request_id: u64,
        lock_token: Uuid,
    ) -> Result<RequestLease, ServerError>;

    /// Records the terminal result of a job request.
    async fn finish_job_request(
        &self,
        pool_id: u64,
        request_id: u64,
        lock_token: Uuid,
        result: Outcome,
        finished_at: DateTime<Utc>,
    ) -> Result<(), ServerError>;

    /// Fetches the server-side status of a job request.
    async fn get_job_request(
        &self,
        pool_id: u64,
        request_id: u64,
    ) -> Result<RequestStatus, ServerError>;

    /// Tears down and re-establishes a server connection, applying the
    /// given request timeout to the new connection.
    async fn refresh_connection(
        &self,
        kind: ConnectionKind,
        timeout: Duration,
    ) -> Result<(), ServerError>;

    /// Adjusts the request timeout of an established connection.
    fn set_connection_timeout(&self, kind: ConnectionKind, timeout: Duration);

    /// Appends an issue to the job's timeline record.
    async fn append_job_issue(
        &self,
        pool_id: u64,
        job_id: Uuid,
        issue: JobIssue,
    ) -> Result<(), ServerError>;
}

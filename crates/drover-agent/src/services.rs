//! Injected agent services: feature flags, notifications, telemetry.
//!
//! Everything here is ancillary to the dispatch itself: flags steer edge
//! behavior, notifications keep the hosting agent's console and message
//! loop informed, and telemetry records the rare events worth counting.
//! Failures in these collaborators are never allowed to fail a job.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::ShutdownReason;
use crate::rpc::OrchestrationClient;
use crate::worker::WorkerLauncher;

/// Feature flag controlling whether agent shutdown fails the running job
/// instead of canceling it.
pub const FAIL_JOB_WHEN_AGENT_DIES: &str = "agent.failJobWhenAgentDies";

/// State of a server-defined feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagState {
    /// The flag is enabled.
    On,
    /// The flag is disabled.
    Off,
}

/// Provider of server-defined feature flags.
#[async_trait]
pub trait FeatureFlagProvider: Send + Sync {
    /// Looks up a feature flag; `None` when the server does not define it.
    async fn get(&self, name: &str) -> Option<FlagState>;
}

/// Sink for job lifecycle notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// A job has been accepted and its worker is being started.
    async fn job_started(&self, job_id: Uuid, job_name: &str);

    /// A dispatch has fully completed, including its completion report.
    async fn job_completed(&self, job_id: Uuid);
}

/// Telemetry events published by the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TelemetryEvent {
    /// A worker exited outside the defined exit-code set.
    WorkerCrash {
        /// The affected job.
        job_id: Uuid,
        /// The undefined exit code.
        exit_code: i32,
    },

    /// A running job was interrupted by agent or OS shutdown.
    JobInterruptedByShutdown {
        /// The affected job.
        job_id: Uuid,
        /// Why the agent is going down.
        reason: ShutdownReason,
        /// Whether the outcome was overridden to `Failed`.
        failed: bool,
    },
}

/// Publisher of telemetry events.
pub trait TelemetryPublisher: Send + Sync {
    /// Publishes an event. Implementations must not block the dispatcher;
    /// buffering and delivery are their concern.
    fn publish(&self, event: TelemetryEvent);
}

/// The collaborators the dispatch core consumes, bundled for injection.
#[derive(Clone)]
pub struct DispatchServices {
    /// Orchestration service client.
    pub client: Arc<dyn OrchestrationClient>,
    /// Worker process launcher.
    pub launcher: Arc<dyn WorkerLauncher>,
    /// Feature flag provider.
    pub features: Arc<dyn FeatureFlagProvider>,
    /// Notification sink.
    pub notifications: Arc<dyn NotificationSink>,
    /// Telemetry publisher.
    pub telemetry: Arc<dyn TelemetryPublisher>,
}

//! Job request data model.
//!
//! A [`JobRequest`] is the message the orchestration service delivers when a
//! job is assigned to this agent. The dispatch core treats most of it as
//! opaque payload for the worker; the fields modeled here are the ones the
//! dispatcher itself needs: identity, the lease handle, the plan's
//! capability flags, and the endpoint list the system connection is
//! extracted from.
//!
//! The request is immutable once dispatched. The only mutation the agent
//! ever performs is the run-once variable overlay, applied by the
//! dispatcher front-end before the request is frozen behind an `Arc`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the endpoint carrying the system connection (server URL plus
/// access token) for the job.
pub const SYSTEM_ENDPOINT: &str = "system";

/// Variable overlaid onto a request dispatched in run-once mode.
pub const RUN_ONCE_VARIABLE: &str = "agent.runOnce";

/// Optional capabilities a plan can advertise.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum PlanFeature {
    /// The worker emits the terminal plan event itself; the agent must not
    /// send a completion report of its own.
    JobCompletedPlanEvent,
    /// Jobs interrupted by agent shutdown finish as `Failed` instead of
    /// `Canceled`.
    FailJobWhenAgentDies,
}

/// Descriptor of the plan a job belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDescriptor {
    /// Plan type, e.g. `"build"` or `"release"`.
    pub plan_type: String,

    /// Plan format version.
    pub version: u32,

    /// Capabilities advertised by the plan.
    #[serde(default)]
    pub features: BTreeSet<PlanFeature>,
}

impl PlanDescriptor {
    /// Returns `true` if the plan advertises `feature`.
    #[must_use]
    pub fn has_feature(&self, feature: PlanFeature) -> bool {
        self.features.contains(&feature)
    }
}

/// A service endpoint delivered with a job request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Endpoint name; [`SYSTEM_ENDPOINT`] identifies the system connection.
    pub name: String,

    /// Endpoint URL.
    pub url: String,

    /// Access token, when the endpoint is authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A job request message, as delivered by the orchestration service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Unique job identifier.
    pub job_id: Uuid,

    /// Monotonic request identifier; this is the server's lease handle.
    pub request_id: u64,

    /// Token authorizing lease renewal and completion for this request.
    pub lock_token: Uuid,

    /// Human-readable job name.
    pub job_name: String,

    /// Plan descriptor.
    pub plan: PlanDescriptor,

    /// Job variables, forwarded to the worker.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Service endpoints available to the job.
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
}

impl JobRequest {
    /// Returns the system connection endpoint, if the request carries one.
    #[must_use]
    pub fn system_connection(&self) -> Option<&ServiceEndpoint> {
        self.endpoints.iter().find(|e| e.name == SYSTEM_ENDPOINT)
    }

    /// Returns `true` if this request was dispatched in run-once mode.
    #[must_use]
    pub fn is_run_once(&self) -> bool {
        self.variables
            .get(RUN_ONCE_VARIABLE)
            .is_some_and(|v| v == "true")
    }
}

/// Cumulative metadata attached to a running job.
///
/// Later updates overwrite earlier keys, which is what makes last-write-wins
/// delivery acceptable at the dispatch layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Metadata properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

//! # drover-agent
//!
//! The job dispatch core of the drover build/release agent.
//!
//! The agent polls a central orchestration service for work and runs each
//! job in an isolated worker child process. This crate owns the hard part
//! of that loop: taking one freshly received job request and driving it
//! through its whole lifecycle — reserving the server-side lease, spawning
//! the worker, exchanging control messages over the worker channel,
//! responding to cancellation, shutdown, and metadata updates, and
//! reporting exactly one terminal outcome.
//!
//! Execution is strictly serial: at most one job runs at a time, and a
//! newly arriving job first drives its predecessor to completion.
//!
//! ## Structure
//!
//! - [`dispatcher`] — the front-end the agent's message loop talks to.
//! - [`executor`] — the per-job state machine.
//! - [`renewer`] / [`reporter`] — the lease-renewal loop and the
//!   completion report.
//! - [`rpc`], [`services`], [`worker`] — the injected collaborator seams.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use drover_agent::{DispatchConfig, DispatchServices, JobDispatcher};
//! use drover_agent::worker::ProcessWorkerLauncher;
//!
//! let dispatcher = JobDispatcher::new(
//!     DispatchConfig::from_env(pool_id),
//!     DispatchServices {
//!         client: Arc::new(client),
//!         launcher: Arc::new(ProcessWorkerLauncher::new(worker_spec)),
//!         features: Arc::new(flags),
//!         notifications: Arc::new(console),
//!         telemetry: Arc::new(telemetry),
//!     },
//! );
//!
//! // Driven by the message-queue loop:
//! dispatcher.run(request, false);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod metadata;
pub mod renewer;
pub mod reporter;
pub mod rpc;
pub mod services;
pub mod worker;

pub use config::DispatchConfig;
pub use context::{ShutdownReason, ShutdownSignal};
pub use dispatcher::JobDispatcher;
pub use executor::DispatchError;
pub use services::DispatchServices;

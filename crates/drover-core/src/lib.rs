//! # drover-core
//!
//! Building blocks for the drover build/release agent: the worker control
//! protocol, worker process supervision, and the job data model.
//!
//! The agent proper (`drover-agent`) drives one job at a time; this crate
//! supplies the pieces that touch the operating system and the wire:
//!
//! - **Job model**: the request message delivered by the orchestration
//!   service, plans, endpoints, and metadata.
//! - **Worker channel**: a length-prefixed control protocol spoken over a
//!   private pipe pair to the worker child process.
//! - **Process supervision**: spawning the worker in its own process group,
//!   capturing its stdio into a bounded buffer, observing its exit code, and
//!   killing the whole tree on demand.
//!
//! ## Example
//!
//! ```rust,no_run
//! use drover_core::config::ChannelConfig;
//! use drover_core::process::WorkerSpec;
//!
//! let channel = ChannelConfig::from_env();
//! let worker = WorkerSpec::builder()
//!     .binary("/opt/drover/bin/drover-worker")
//!     .working_dir("/opt/drover/bin")
//!     .build();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod channel;
pub mod config;
pub mod job;
pub mod outcome;
pub mod process;

pub use channel::{ChannelError, MessageType, WorkerChannel, WorkerMessage};
pub use job::{JobMetadata, JobRequest, PlanDescriptor, PlanFeature, ServiceEndpoint};
pub use outcome::Outcome;
pub use process::{CapturedOutput, ExitWatch, WorkerSpec};

//! Worker spawn specification.
//!
//! The worker executable is launched with the fixed argv contract
//! `spawnclient <out_fd> <in_fd>`: the two pipe descriptors it inherits
//! from the agent, in that order. The worker must read its job message
//! within its own startup window or self-terminate; the agent side only
//! guarantees the descriptors are valid at spawn time.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};

/// Default worker executable name, resolved through `PATH` when no
/// explicit path is configured.
pub const DEFAULT_WORKER_BINARY: &str = "drover-worker";

/// Specification for spawning a worker child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Worker executable.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Working directory; the agent bin directory in production layouts.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for the worker.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_binary() -> PathBuf {
    PathBuf::from(DEFAULT_WORKER_BINARY)
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

impl WorkerSpec {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> WorkerSpecBuilder {
        WorkerSpecBuilder::default()
    }

    /// Launches the worker child with the inherited pipe descriptors.
    ///
    /// The child is placed in its own process group (so kills cover its
    /// whole tree) with stdio piped for capture.
    ///
    /// # Errors
    ///
    /// Returns the spawn error from the operating system.
    pub fn spawn(&self, out_fd: RawFd, in_fd: RawFd) -> io::Result<tokio::process::Child> {
        use std::os::unix::process::CommandExt;

        let mut cmd = std::process::Command::new(&self.binary);
        cmd.arg("spawnclient")
            .arg(out_fd.to_string())
            .arg(in_fd.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(false);
        cmd.spawn()
    }
}

/// Builder for [`WorkerSpec`].
#[derive(Debug, Default)]
pub struct WorkerSpecBuilder {
    binary: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl WorkerSpecBuilder {
    /// Sets the worker executable.
    #[must_use]
    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Builds the spec.
    #[must_use]
    pub fn build(self) -> WorkerSpec {
        WorkerSpec {
            binary: self.binary.unwrap_or_else(default_binary),
            working_dir: self.working_dir,
            env: self.env,
        }
    }
}

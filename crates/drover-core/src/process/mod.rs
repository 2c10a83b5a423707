//! Worker process supervision.
//!
//! This module provides the OS-level plumbing under the worker channel:
//! the anonymous pipe pair the control protocol runs over, the worker spawn
//! specification, bounded stdio capture, exit-code observation, and the
//! token-driven process-tree kill.
//!
//! The worker is spawned into its own process group so a kill takes the
//! whole tree down, not just the immediate child. The child process is
//! always reaped: the reaper task owns the `Child` handle and publishes the
//! exit code through a watch channel every other observer clones.

mod spawner;

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe;
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use spawner::{WorkerSpec, WorkerSpecBuilder};

/// Exit code reported when the worker could not be reaped normally.
///
/// Matches a SIGKILL death (128 + 9), which is what the kill path produces.
pub const ORPHANED_EXIT_CODE: i32 = 137;

/// Upper bound on captured stdio, in bytes. Oldest lines are dropped past
/// it, so a worker that floods stderr before crashing cannot grow the
/// buffer without bound.
pub const CAPTURE_LIMIT: usize = 64 * 1024;

/// Errors from worker process plumbing.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// The control pipe pair could not be created.
    #[error("failed to create worker pipe pair: {0}")]
    PipeCreation(#[source] io::Error),

    /// The worker child could not be spawned.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(#[source] io::Error),
}

/// Bounded, thread-safe capture of the worker's stdio.
///
/// Written by the per-stream reader tasks and read once, by the executor,
/// on the crash path. Anything a healthy worker prints is discarded when
/// the channel is dropped.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    inner: Arc<Mutex<CaptureBuf>>,
}

#[derive(Debug, Default)]
struct CaptureBuf {
    lines: VecDeque<String>,
    bytes: usize,
}

impl CapturedOutput {
    /// Appends a line, evicting the oldest lines past [`CAPTURE_LIMIT`].
    pub fn push_line(&self, line: String) {
        let mut buf = self.inner.lock().expect("capture lock poisoned");
        buf.bytes += line.len() + 1;
        buf.lines.push_back(line);
        while buf.bytes > CAPTURE_LIMIT {
            match buf.lines.pop_front() {
                Some(dropped) => buf.bytes -= dropped.len() + 1,
                None => break,
            }
        }
    }

    /// Returns the captured lines joined with newlines.
    #[must_use]
    pub fn contents(&self) -> String {
        let buf = self.inner.lock().expect("capture lock poisoned");
        buf.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// Returns `true` if nothing has been captured (or everything was
    /// evicted).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("capture lock poisoned").lines.is_empty()
    }
}

/// Watch over a worker's exit code.
///
/// Cloneable; every clone resolves to the same code once the worker
/// terminates, so concurrent waiters agree on the result.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<i32>>,
}

impl ExitWatch {
    /// Wraps an existing watch receiver.
    #[must_use]
    pub const fn new(rx: watch::Receiver<Option<i32>>) -> Self {
        Self { rx }
    }

    /// Creates a reporting pair: the sender publishes the exit code, the
    /// watch observes it.
    #[must_use]
    pub fn channel() -> (watch::Sender<Option<i32>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// Returns the exit code if the worker has already terminated.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        *self.rx.borrow()
    }

    /// Waits for the worker to terminate and returns its exit code.
    pub async fn wait(&mut self) -> i32 {
        loop {
            if let Some(code) = *self.rx.borrow_and_update() {
                return code;
            }
            if self.rx.changed().await.is_err() {
                // The reaper task is gone without publishing a code; the
                // worker was torn down with its supervisor.
                return ORPHANED_EXIT_CODE;
            }
        }
    }
}

/// The four ends of the worker control pipe pair.
///
/// `agent_tx`/`agent_rx` are the agent's nonblocking, close-on-exec ends;
/// `worker_out`/`worker_in` are the plain descriptors the child inherits.
pub(crate) struct PipePair {
    pub agent_tx: pipe::Sender,
    pub agent_rx: pipe::Receiver,
    pub worker_out: OwnedFd,
    pub worker_in: OwnedFd,
}

impl PipePair {
    /// Creates both pipes and registers the agent ends with the runtime.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn create() -> io::Result<Self> {
        // agent -> worker
        let (worker_in, agent_write) = raw_pipe()?;
        // worker -> agent
        let (agent_read, worker_out) = raw_pipe()?;

        // The agent ends must not leak into the child, and must be
        // nonblocking before the runtime adopts them. The worker ends stay
        // inheritable and blocking.
        for fd in [agent_write.as_raw_fd(), agent_read.as_raw_fd()] {
            set_cloexec(fd)?;
            set_nonblocking(fd)?;
        }

        let agent_tx = pipe::Sender::from_owned_fd(agent_write)?;
        let agent_rx = pipe::Receiver::from_owned_fd(agent_read)?;

        Ok(Self {
            agent_tx,
            agent_rx,
            worker_out,
            worker_in,
        })
    }
}

fn raw_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe().map_err(|errno| io::Error::from_raw_os_error(errno as i32))
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl flag manipulation on a descriptor we own.
    let flags = unsafe { nix::libc::fcntl(fd, nix::libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { nix::libc::fcntl(fd, nix::libc::F_SETFD, flags | nix::libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl flag manipulation on a descriptor we own.
    let flags = unsafe { nix::libc::fcntl(fd, nix::libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { nix::libc::fcntl(fd, nix::libc::F_SETFL, flags | nix::libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wires supervision around a freshly spawned worker child.
///
/// Spawns the stdio capture tasks, the reaper that publishes the exit code,
/// and the killer that SIGKILLs the worker's process group when `kill`
/// fires. The returned watch and buffer outlive the child handle, which the
/// reaper consumes.
pub(crate) fn supervise(mut child: Child, kill: &CancellationToken) -> (ExitWatch, CapturedOutput) {
    let output = CapturedOutput::default();
    if let Some(stdout) = child.stdout.take() {
        spawn_capture(stdout, output.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_capture(stderr, output.clone());
    }

    let (exit_tx, exit) = ExitWatch::channel();
    let pid = child.id();

    if let Some(pid) = pid {
        raise_priority(pid);

        let kill = kill.clone();
        let mut exited = exit.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = kill.cancelled() => {
                    debug!(pid, "killing worker process group");
                    kill_process_group(pid);
                }
                _ = exited.wait() => {}
            }
        });
    }

    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(err) => {
                warn!(%err, "failed to reap worker child");
                ORPHANED_EXIT_CODE
            }
        };
        let _ = exit_tx.send(Some(code));
    });

    (exit, output)
}

fn spawn_capture<R>(reader: R, output: CapturedOutput)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            output.push_line(line);
        }
    });
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Best-effort scheduling bump for the worker.
///
/// A negative nice value needs privilege; unprivileged agents keep the
/// default priority.
fn raise_priority(pid: u32) {
    const WORKER_NICE: nix::libc::c_int = -2;
    // SAFETY: setpriority only reads its scalar arguments.
    let rc = unsafe {
        nix::libc::setpriority(
            nix::libc::PRIO_PROCESS as _,
            pid as nix::libc::id_t,
            WORKER_NICE,
        )
    };
    if rc != 0 {
        debug!(pid, "could not raise worker priority");
    }
}

/// SIGKILLs the worker's process group.
///
/// The worker is spawned as its own group leader, so the group id is its
/// pid and the kill takes down any grandchildren it started.
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)] // pids fit in i32 on Linux
    if let Err(errno) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        // ESRCH just means the worker beat us to the exit.
        debug!(pid, %errno, "worker process group kill was a no-op");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_bound_evicts_oldest() {
        let output = CapturedOutput::default();
        let line = "x".repeat(1024);
        for _ in 0..100 {
            output.push_line(line.clone());
        }
        let contents = output.contents();
        assert!(contents.len() <= CAPTURE_LIMIT);
        assert!(!output.is_empty());

        // Oldest lines were evicted, not newest: a distinctive last line
        // must survive.
        output.push_line("sentinel".to_string());
        assert!(output.contents().ends_with("sentinel"));
    }

    #[test]
    fn test_capture_empty() {
        let output = CapturedOutput::default();
        assert!(output.is_empty());
        assert_eq!(output.contents(), "");
    }

    #[tokio::test]
    async fn test_exit_watch_resolves_for_all_clones() {
        let (tx, watch) = ExitWatch::channel();
        let mut first = watch.clone();
        let mut second = watch;

        let waiter = tokio::spawn(async move { first.wait().await });
        tx.send(Some(66)).unwrap();

        assert_eq!(waiter.await.unwrap(), 66);
        assert_eq!(second.wait().await, 66);
        assert_eq!(second.code(), Some(66));
    }

    #[tokio::test]
    async fn test_exit_watch_orphaned_sender() {
        let (tx, mut watch) = ExitWatch::channel();
        drop(tx);
        assert_eq!(watch.wait().await, ORPHANED_EXIT_CODE);
    }

    #[test]
    fn test_exit_code_of_signal_death() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(9); // killed by SIGKILL
        assert_eq!(exit_code_of(status), 137);

        let status = std::process::ExitStatus::from_raw(7 << 8); // exit(7)
        assert_eq!(exit_code_of(status), 7);
    }
}

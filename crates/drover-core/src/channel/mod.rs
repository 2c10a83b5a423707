//! Worker process channel.
//!
//! The agent talks to its worker child over a pair of anonymous pipes
//! created before the worker is spawned. Control messages are framed by
//! [`framing::MessageCodec`]; bodies for the payload-bearing messages are
//! UTF-16LE encoded JSON, and the cancel family travels with an empty body.
//!
//! The channel is strictly one job deep: a [`WorkerChannel`] is created when
//! a worker is spawned and dropped when the dispatch finishes. Delivery is
//! bounded by a caller-supplied timeout on every send; a worker that stops
//! draining its pipe is treated as unreachable and killed by the executor.

pub mod framing;

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use tokio::net::unix::pipe;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::process::{self, CapturedOutput, ExitWatch, PipePair, ProcessError};

pub use framing::{MessageCodec, MAX_FRAME_SIZE};

/// Control messages exchanged with the worker.
///
/// The wire values are a fixed contract with the worker executable and must
/// never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// A new job payload follows (UTF-16 JSON body).
    NewJobRequest = 1,
    /// Cooperative cancel request; empty body.
    CancelRequest = 2,
    /// The agent is shutting down; empty body.
    AgentShutdown = 3,
    /// The host operating system is shutting down; empty body.
    OperatingSystemShutdown = 4,
    /// Cumulative metadata update (UTF-16 JSON body).
    JobMetadataUpdate = 5,
}

impl MessageType {
    /// Decodes a wire value into a message type.
    #[must_use]
    pub const fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::NewJobRequest),
            2 => Some(Self::CancelRequest),
            3 => Some(Self::AgentShutdown),
            4 => Some(Self::OperatingSystemShutdown),
            5 => Some(Self::JobMetadataUpdate),
            _ => None,
        }
    }

    /// Returns `true` for the cancel-family messages, which carry no body.
    #[must_use]
    pub const fn is_cancel_family(self) -> bool {
        matches!(
            self,
            Self::CancelRequest | Self::AgentShutdown | Self::OperatingSystemShutdown
        )
    }
}

/// A framed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMessage {
    /// Message type.
    pub kind: MessageType,
    /// Message body; empty for the cancel family.
    pub body: Bytes,
}

impl WorkerMessage {
    /// Creates a bodyless control message.
    #[must_use]
    pub const fn control(kind: MessageType) -> Self {
        Self {
            kind,
            body: Bytes::new(),
        }
    }
}

/// Errors surfaced by the worker channel.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The send did not complete within the configured timeout.
    #[error("worker channel send timed out after {timeout:?}")]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The worker has exited; the pipe is gone.
    #[error("worker channel is closed")]
    Closed,

    /// Frame exceeds the protocol bound.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Offending frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame length prefix shorter than the mandatory type word.
    #[error("frame length prefix is shorter than the message-type word")]
    MalformedFrame,

    /// Unknown message type on the wire.
    #[error("unknown worker message type {0}")]
    UnknownMessageType(u32),

    /// Message body is not valid UTF-16.
    #[error("message body is not valid UTF-16")]
    MalformedBody,

    /// The worker could not be brought up.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Underlying pipe I/O failure.
    #[error("worker channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Encodes message text as the UTF-16LE body bytes the worker expects.
#[must_use]
pub fn encode_body(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        buf.put_u16_le(unit);
    }
    buf.freeze()
}

/// Decodes a UTF-16LE message body back into a string.
///
/// # Errors
///
/// Returns [`ChannelError::MalformedBody`] on odd-length input or invalid
/// surrogate sequences.
pub fn decode_body(body: &[u8]) -> Result<String, ChannelError> {
    if body.len() % 2 != 0 {
        return Err(ChannelError::MalformedBody);
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| ChannelError::MalformedBody)
}

/// The agent side of a worker control channel.
///
/// Created by [`WorkerChannel::start`], which spawns the worker through a
/// caller-provided callback so process construction stays injectable. The
/// channel owns the outbound pipe, the captured stdio buffer, and a watch
/// over the worker's exit code.
pub struct WorkerChannel {
    writer: FramedWrite<pipe::Sender, MessageCodec>,
    exit: ExitWatch,
    output: CapturedOutput,
    // Held open so the worker's outbound pipe end stays writable for its
    // whole lifetime; the dispatcher does not read worker-bound traffic.
    _inbound: pipe::Receiver,
}

impl WorkerChannel {
    /// Creates the control pipe pair, launches the worker through `spawn`,
    /// and wires stdio capture, exit observation, and the kill path.
    ///
    /// The callback receives the two descriptors the child must inherit, in
    /// the `spawnclient <out_fd> <in_fd>` argv order: the worker writes to
    /// `out_fd` and reads control messages from `in_fd`. Cancelling `kill`
    /// terminates the worker's whole process group.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipes cannot be created or the spawn
    /// callback fails.
    pub fn start<F>(spawn: F, kill: &CancellationToken) -> Result<Self, ChannelError>
    where
        F: FnOnce(RawFd, RawFd) -> io::Result<tokio::process::Child>,
    {
        let pipes = PipePair::create().map_err(ProcessError::PipeCreation)?;
        let child = spawn(pipes.worker_out.as_raw_fd(), pipes.worker_in.as_raw_fd())
            .map_err(ProcessError::SpawnFailed)?;

        let PipePair {
            agent_tx,
            agent_rx,
            worker_out,
            worker_in,
        } = pipes;
        // The parent's copies of the worker ends close here; the worker now
        // holds the only remaining descriptors, so its pipe EOFs track its
        // lifetime.
        drop((worker_out, worker_in));

        let (exit, output) = process::supervise(child, kill);

        Ok(Self {
            writer: FramedWrite::new(agent_tx, MessageCodec::new()),
            exit,
            output,
            _inbound: agent_rx,
        })
    }

    /// Sends a control message to the worker.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Timeout`] if the framed write does not complete
    ///   within `timeout`.
    /// - [`ChannelError::Closed`] if the worker has already exited or the
    ///   pipe reports a broken write.
    pub async fn send(
        &mut self,
        kind: MessageType,
        body: Bytes,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        if self.exit.code().is_some() {
            return Err(ChannelError::Closed);
        }

        let message = WorkerMessage { kind, body };
        match tokio::time::timeout(timeout, self.writer.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ChannelError::Io(err))) if err.kind() == io::ErrorKind::BrokenPipe => {
                Err(ChannelError::Closed)
            }
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(ChannelError::Timeout { timeout }),
        }
    }

    /// Returns a watch over the worker's exit code.
    ///
    /// Clones all resolve to the same code once the worker terminates.
    #[must_use]
    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Returns the stdio captured so far.
    #[must_use]
    pub fn captured_output(&self) -> String {
        self.output.contents()
    }
}

//! Length-prefixed frame codec for the worker control pipe.
//!
//! This module implements a [`tokio_util::codec`] compatible codec for the
//! worker control protocol. Each frame consists of:
//!
//! ```text
//! +----------------------+------------------------+------------------+
//! | Length (4 bytes, BE) | Type (4 bytes, BE)     | Body             |
//! +----------------------+------------------------+------------------+
//! ```
//!
//! The length prefix counts the message-type word plus the body, so the
//! smallest valid frame is a bare control message of length 4.
//!
//! The codec enforces bounded reads: frame length is validated against
//! [`MAX_FRAME_SIZE`] before any allocation, so a corrupt or hostile peer
//! cannot make the agent allocate an arbitrary buffer.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{ChannelError, MessageType, WorkerMessage};

/// Length of the frame length prefix.
const LEN_PREFIX: usize = 4;

/// Length of the message-type word.
const TYPE_LEN: usize = 4;

/// Maximum frame size accepted on either side of the pipe (4 MiB).
///
/// Job payloads are JSON and comfortably fit; anything larger is a protocol
/// error, not a legitimate message.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Codec for worker control messages.
///
/// Used with [`tokio_util::codec::FramedWrite`] on the agent's outbound
/// pipe and, in the worker, with `FramedRead` on its inbound end.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Creates a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Encoder<WorkerMessage> for MessageCodec {
    type Error = ChannelError;

    fn encode(&mut self, item: WorkerMessage, dst: &mut BytesMut) -> Result<(), ChannelError> {
        let frame_len = TYPE_LEN + item.body.len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size: frame_len,
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(LEN_PREFIX + frame_len);
        #[allow(clippy::cast_possible_truncation)] // Validated above
        dst.put_u32(frame_len as u32);
        dst.put_u32(item.kind as u32);
        dst.extend_from_slice(&item.body);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = WorkerMessage;
    type Error = ChannelError;

    /// Decodes a frame from the input buffer.
    ///
    /// The frame length is validated against [`MAX_FRAME_SIZE`] before any
    /// allocation occurs.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(message))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(_)` on oversized, truncated, or unknown-type frames
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WorkerMessage>, ChannelError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Every frame carries at least the message-type word.
        if length < TYPE_LEN {
            return Err(ChannelError::MalformedFrame);
        }
        if length > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total_len = LEN_PREFIX + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let raw_kind = src.get_u32();
        let kind =
            MessageType::from_wire(raw_kind).ok_or(ChannelError::UnknownMessageType(raw_kind))?;
        let body = src.split_to(length - TYPE_LEN).freeze();

        Ok(Some(WorkerMessage { kind, body }))
    }
}

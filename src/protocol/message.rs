use std::time::Duration;

use thiserror::Error;

use super::MAX_PAYLOAD;

/// Error returned when a payload write would exceed the message buffer.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Payload exceeds the {MAX_PAYLOAD}-byte message capacity")]
pub struct PayloadOverflow;

/// A reassembled or to-be-fragmented MCTP message.
///
/// Messages are pool-owned, fixed-capacity buffers: header fields from the
/// transport header of the SOM packet, the 7-bit message-type code carried in
/// the SOM packet's first payload byte, and up to 8192 payload bytes.
#[derive(Debug)]
pub struct MessageBuf {
    /// Destination endpoint ID.
    pub dst: u8,
    /// Source endpoint ID.
    pub src: u8,
    /// Tag-owner flag: set on requests, clear on responses.
    pub owner: bool,
    /// 3-bit message tag.
    pub tag: u8,
    /// 7-bit MCTP message-type code.
    pub msg_type: u8,
    /// Creation timestamp, relative to the pipeline epoch.
    pub(crate) ts: Duration,
    len: usize,
    payload: [u8; MAX_PAYLOAD],
}

impl MessageBuf {
    pub(crate) fn new() -> Self {
        MessageBuf {
            dst: 0,
            src: 0,
            owner: false,
            tag: 0,
            msg_type: 0,
            ts: Duration::ZERO,
            len: 0,
            payload: [0u8; MAX_PAYLOAD],
        }
    }

    /// Current payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The message payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len]
    }

    /// Replaces the payload with `bytes`.
    pub fn set_payload(&mut self, bytes: &[u8]) -> Result<(), PayloadOverflow> {
        if bytes.len() > MAX_PAYLOAD {
            return Err(PayloadOverflow);
        }
        self.payload[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }

    /// Appends `bytes` to the payload. Used by the reassembler to accumulate
    /// packet payloads.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<(), PayloadOverflow> {
        let end = self.len + bytes.len();
        if end > MAX_PAYLOAD {
            return Err(PayloadOverflow);
        }
        self.payload[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// Copies `bytes.len()` payload bytes starting at `offset` into `bytes`.
    /// Bytes past the current length read as zero; the fragmenter uses this
    /// to fill fixed-size packet payloads past the end of short messages.
    pub(crate) fn copy_range(&self, offset: usize, bytes: &mut [u8]) {
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = if offset + i < self.len {
                self.payload[offset + i]
            } else {
                0
            };
        }
    }

    /// Resets the buffer for return to the pool.
    pub(crate) fn recycle(&mut self) {
        self.dst = 0;
        self.src = 0;
        self.owner = false;
        self.tag = 0;
        self.msg_type = 0;
        self.ts = Duration::ZERO;
        self.len = 0;
    }
}

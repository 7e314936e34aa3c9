//! RFC 7766 two-byte length prefix used for DNS over TCP and TLS.

use thiserror::Error;

pub const PREFIX_LEN: usize = 2;
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("message too large: {0} bytes (max 65535)")]
    TooLarge(usize),
}

/// Prefix `message` with its big-endian length.
pub fn encode(message: &[u8]) -> Result<Vec<u8>, FrameError> {
    let length = u16::try_from(message.len()).map_err(|_| FrameError::TooLarge(message.len()))?;
    let mut frame = Vec::with_capacity(PREFIX_LEN + message.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(message);
    Ok(frame)
}

/// The message carried by `frame`, or `None` if the frame is shorter than
/// its prefix claims. Bytes past the declared length are ignored.
pub fn strip(frame: &[u8]) -> Option<&[u8]> {
    let length = declared_length(frame)?;
    frame.get(PREFIX_LEN..PREFIX_LEN + length)
}

fn declared_length(bytes: &[u8]) -> Option<usize> {
    match bytes {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo]) as usize),
        _ => None,
    }
}

/// Incremental deframer for a byte stream. Frames are returned with their
/// prefix so they can be forwarded unchanged.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete frame, prefix included.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let total = PREFIX_LEN + declared_length(&self.pending)?;
        if self.pending.len() < total {
            return None;
        }
        let rest = self.pending.split_off(total);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Bytes buffered towards an incomplete frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

//! Stream framing for the radio's TCP/serial API.
//!
//! Each protobuf message on the link is preceded by a four byte header:
//!
//!   `0x94 0xC3 <len_hi> <len_lo>`
//!
//! [`encode_frame`] and [`decode_frame`] work on whole frames and reject anything
//! malformed. [`StreamFramer`] is the incremental variant used by the read loop: it is
//! fed arbitrary chunks and yields complete payloads, resynchronising on the next
//! magic byte when it sees garbage (debug console output shares the link).
use bytes::{Buf, BytesMut};

use crate::error::FormatError;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
pub const HEADER_LEN: usize = 4;
/// Largest payload the firmware will emit or accept.
pub const MAX_FRAME_LEN: usize = 512;

/// Prefix `payload` with the stream header.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FormatError> {
    if payload.is_empty() {
        return Err(FormatError::Empty);
    }
    if payload.len() > MAX_FRAME_LEN {
        return Err(FormatError::Oversize(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(START1);
    out.push(START2);
    out.push(((payload.len() >> 8) & 0xFF) as u8);
    out.push((payload.len() & 0xFF) as u8);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Validate one complete frame and return its payload.
///
/// The declared length must match the remaining bytes exactly; a short buffer or
/// trailing bytes are both errors rather than being truncated or ignored.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], FormatError> {
    if frame.is_empty() {
        return Err(FormatError::Empty);
    }
    if frame.len() < HEADER_LEN {
        return Err(FormatError::Truncated(frame.len()));
    }
    if frame[0] != START1 || frame[1] != START2 {
        return Err(FormatError::BadMagic(frame[0], frame[1]));
    }
    let declared = ((frame[2] as usize) << 8) | (frame[3] as usize);
    if declared > MAX_FRAME_LEN {
        return Err(FormatError::Oversize(declared));
    }
    if declared == 0 {
        return Err(FormatError::Empty);
    }
    let actual = frame.len() - HEADER_LEN;
    if declared != actual {
        return Err(FormatError::LengthMismatch { declared, actual });
    }
    Ok(&frame[HEADER_LEN..])
}

/// Incremental reassembly of framed payloads from a byte stream.
pub struct StreamFramer {
    buf: BytesMut,
    dropped: u64,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            dropped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes discarded while resynchronising since creation or the last reset.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Forget any partial frame. Used when the link is re-established.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.dropped = 0;
    }

    /// Extract the next complete payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            // Realign to header if needed
            if !(self.buf[0] == START1 && self.buf[1] == START2) {
                match self.buf.iter().skip(1).position(|&b| b == START1) {
                    Some(pos) => {
                        self.dropped += (pos + 1) as u64;
                        self.buf.advance(pos + 1);
                    }
                    None => {
                        // Keep a trailing START1; its partner may arrive in the next chunk.
                        let keep = usize::from(self.buf[self.buf.len() - 1] == START1);
                        let drop = self.buf.len() - keep;
                        self.dropped += drop as u64;
                        self.buf.advance(drop);
                    }
                }
                continue;
            }

            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_FRAME_LEN {
                self.dropped += 1;
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }

            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

//! Length-prefix frame codec.
//!
//! Wire format:
//! ```text
//! ┌────────────┬──────────────────────────┐
//! │ Length (4B)│ postcard payload (N B)   │
//! │ LE u32     │                          │
//! └────────────┴──────────────────────────┘
//! ```
//!
//! Used both on the co-processor link and on the socket endpoint. The
//! decoder accumulates incoming bytes and yields complete frames. This
//! handles partial reads gracefully: a single `receive` may return part of
//! the header, part of the payload, or several frames concatenated, and
//! bytes following a completed frame are kept for the next one.

use core::fmt;

/// Maximum frame payload size (two full 64 KiB buffers plus headroom).
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Frame header size (4-byte little-endian length).
pub const HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Header announced an empty or oversized payload.
    BadLength(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLength(len) => write!(f, "bad frame length {len}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Decoder state machine.
enum DecoderState {
    /// Waiting for header bytes.
    ReadingHeader,
    /// Header received, reading payload.
    ReadingPayload { expected: usize },
}

/// Streaming frame decoder.
pub struct FrameDecoder {
    state: DecoderState,
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::ReadingHeader,
            pending: Vec::new(),
        }
    }

    /// Append received bytes. Call [`next_frame`](Self::next_frame) until it
    /// yields `Ok(None)` to drain every complete frame.
    pub fn feed(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Pop the next complete payload, if any.
    ///
    /// A bad header drops everything buffered so far and resets the
    /// decoder; the stream cannot be resynchronised past it.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            match self.state {
                DecoderState::ReadingHeader => {
                    if self.pending.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let mut header = [0u8; HEADER_SIZE];
                    header.copy_from_slice(&self.pending[..HEADER_SIZE]);
                    let expected = u32::from_le_bytes(header) as usize;

                    if expected == 0 || expected > MAX_FRAME_SIZE {
                        self.reset();
                        return Err(FrameError::BadLength(expected));
                    }

                    self.pending.drain(..HEADER_SIZE);
                    self.state = DecoderState::ReadingPayload { expected };
                }

                DecoderState::ReadingPayload { expected } => {
                    if self.pending.len() < expected {
                        return Ok(None);
                    }
                    let rest = self.pending.split_off(expected);
                    let frame = core::mem::replace(&mut self.pending, rest);
                    self.state = DecoderState::ReadingHeader;
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Reset decoder state (e.g. after a transport reconnect).
    pub fn reset(&mut self) {
        self.state = DecoderState::ReadingHeader;
        self.pending.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a payload into a length-prefixed frame.
///
/// Writes `[LE-u32 length][payload]` into `out_buf`.
/// Returns the total number of bytes written.
pub fn encode_frame_into(payload: &[u8], out_buf: &mut [u8]) -> Option<usize> {
    let total = HEADER_SIZE + payload.len();
    if total > out_buf.len() || payload.is_empty() || payload.len() > MAX_FRAME_SIZE {
        return None;
    }

    let len_bytes = (payload.len() as u32).to_le_bytes();
    out_buf[..HEADER_SIZE].copy_from_slice(&len_bytes);
    out_buf[HEADER_SIZE..total].copy_from_slice(payload);

    Some(total)
}

/// Allocating variant of [`encode_frame_into`].
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    let mut out = vec![0u8; HEADER_SIZE + payload.len()];
    let len = encode_frame_into(payload, &mut out)?;
    out.truncate(len);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_header_and_payload() {
        let frame = encode_frame(b"hello").unwrap();
        let mut d = FrameDecoder::new();
        d.feed(&frame[..2]);
        assert_eq!(d.next_frame(), Ok(None));
        d.feed(&frame[2..6]);
        assert_eq!(d.next_frame(), Ok(None));
        d.feed(&frame[6..]);
        assert_eq!(d.next_frame(), Ok(Some(b"hello".to_vec())));
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn concatenated_frames_are_not_lost() {
        let mut stream = encode_frame(b"one").unwrap();
        stream.extend(encode_frame(b"two").unwrap());
        stream.extend(&encode_frame(b"three").unwrap()[..5]);

        let mut d = FrameDecoder::new();
        d.feed(&stream);
        assert_eq!(d.next_frame(), Ok(Some(b"one".to_vec())));
        assert_eq!(d.next_frame(), Ok(Some(b"two".to_vec())));
        assert_eq!(d.next_frame(), Ok(None));
        d.feed(b"hree");
        assert_eq!(d.next_frame(), Ok(Some(b"three".to_vec())));
    }

    #[test]
    fn oversized_header_resets() {
        let mut d = FrameDecoder::new();
        d.feed(&(MAX_FRAME_SIZE as u32 + 1).to_le_bytes());
        d.feed(b"junk");
        assert_eq!(d.next_frame(), Err(FrameError::BadLength(MAX_FRAME_SIZE + 1)));
        assert_eq!(d.buffered(), 0);

        d.feed(&encode_frame(b"ok").unwrap());
        assert_eq!(d.next_frame(), Ok(Some(b"ok".to_vec())));
    }

    #[test]
    fn zero_length_frame_rejected() {
        let mut d = FrameDecoder::new();
        d.feed(&[0, 0, 0, 0]);
        assert_eq!(d.next_frame(), Err(FrameError::BadLength(0)));
        assert_eq!(encode_frame(b""), None);
    }

    #[test]
    fn encode_into_small_buffer_fails() {
        let mut buf = [0u8; 6];
        assert_eq!(encode_frame_into(b"abc", &mut buf), None);
        let mut buf = [0u8; 7];
        assert_eq!(encode_frame_into(b"abc", &mut buf), Some(7));
        assert_eq!(&buf, &[3, 0, 0, 0, b'a', b'b', b'c']);
    }
}

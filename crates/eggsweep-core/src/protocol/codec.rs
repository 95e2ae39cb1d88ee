//! Frame codec for the MCU serial protocol
//!
//! Wire format, shared by the actor and arm links:
//!
//! ```text
//! [0x24 0x24] [data_type] [data_len] [data_len x u16 BE] [crc] [0x23 0x23]
//! ```
//!
//! `crc` is the XOR of every byte from the first header byte through the
//! last payload byte. The decoder is a resynchronizing stream consumer: any
//! corrupt byte (bogus length, bad CRC, missing footer) costs one byte of
//! buffer and a rescan for the next header, so a valid frame following
//! arbitrary noise is always recovered.

use arrayvec::ArrayVec;

/// Frame header bytes
pub const HEADER: [u8; 2] = [0x24, 0x24];
/// Frame footer bytes
pub const FOOTER: [u8; 2] = [0x23, 0x23];

/// Maximum payload length in 16-bit words (one-byte length field)
pub const MAX_PAYLOAD_WORDS: usize = 125;
/// Size in bytes of the largest legal frame
pub const MAX_FRAME_BYTES: usize = 7 + 2 * MAX_PAYLOAD_WORDS;
/// Size in bytes of an empty frame: header + type + len + crc + footer
pub const MIN_FRAME_BYTES: usize = 7;

/// Frame could not be encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {0} words exceeds the {MAX_PAYLOAD_WORDS}-word frame limit")]
    PayloadTooLong(usize),
}

/// A decoded (or to-be-encoded) protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data_type: u8,
    pub words: ArrayVec<u16, MAX_PAYLOAD_WORDS>,
}

impl Frame {
    /// Build a frame, rejecting payloads the length byte cannot express
    pub fn new(data_type: u8, words: &[u16]) -> Result<Self, EncodeError> {
        if words.len() > MAX_PAYLOAD_WORDS {
            return Err(EncodeError::PayloadTooLong(words.len()));
        }
        let mut v = ArrayVec::new();
        v.try_extend_from_slice(words)
            .expect("length checked above");
        Ok(Self { data_type, words: v })
    }

    /// Payload word by index
    pub fn word(&self, idx: usize) -> Option<u16> {
        self.words.get(idx).copied()
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> ArrayVec<u8, MAX_FRAME_BYTES> {
        let mut out = ArrayVec::new();
        out.extend(HEADER);
        out.push(self.data_type);
        out.push(self.words.len() as u8);
        for w in &self.words {
            out.extend(w.to_be_bytes());
        }
        out.push(xor_crc(&out));
        out.extend(FOOTER);
        out
    }
}

/// XOR accumulator over a byte slice, masked to 8 bits
fn xor_crc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Stateful stream decoder
///
/// Feed it bytes in whatever chunking the transport produces; the emitted
/// frame sequence is the same. Resyncs are counted for diagnostics.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    resyncs: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the decoder discarded bytes to recover framing
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// Bytes currently buffered waiting for a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append received bytes and drain every complete frame at the head
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            self.seek_header();
            if self.buf.len() < 4 {
                break;
            }

            let data_len = self.buf[3] as usize;
            if data_len > MAX_PAYLOAD_WORDS {
                tracing::debug!(data_len, "declared frame length impossible, resyncing");
                self.skip_one();
                continue;
            }

            let total = MIN_FRAME_BYTES + 2 * data_len;
            if self.buf.len() < total {
                break;
            }

            let crc_at = 4 + 2 * data_len;
            let crc_ok = xor_crc(&self.buf[..crc_at]) == self.buf[crc_at];
            let footer_ok = self.buf[crc_at + 1..total] == FOOTER;
            if !crc_ok || !footer_ok {
                tracing::debug!(crc_ok, footer_ok, "invalid frame, resyncing");
                self.skip_one();
                continue;
            }

            let mut words = ArrayVec::new();
            for i in 0..data_len {
                let at = 4 + 2 * i;
                words.push(u16::from_be_bytes([self.buf[at], self.buf[at + 1]]));
            }
            frames.push(Frame {
                data_type: self.buf[2],
                words,
            });
            self.buf.drain(..total);
        }

        frames
    }

    /// Discard leading bytes until the buffer starts with a header candidate
    fn seek_header(&mut self) {
        if self.buf.starts_with(&HEADER) {
            return;
        }
        let at = self
            .buf
            .windows(2)
            .position(|w| w == HEADER)
            .unwrap_or_else(|| {
                // Keep a trailing 0x24 in case its partner is still in flight.
                match self.buf.last() {
                    Some(&b) if b == HEADER[0] => self.buf.len() - 1,
                    _ => self.buf.len(),
                }
            });
        if at > 0 {
            self.buf.drain(..at);
            self.resyncs += 1;
        }
    }

    /// Drop the first buffered byte after a failed parse
    fn skip_one(&mut self) {
        self.buf.drain(..1);
        self.resyncs += 1;
    }
}

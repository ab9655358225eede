//! Frame reassembly for the coach event stream.
//!
//! Network chunks arrive at arbitrary byte boundaries. Bytes are carried over
//! until a blank line (`\n\n`) closes a frame; only then is the frame handed
//! to the classifier. Buffering happens on raw bytes so that a delimiter, a
//! `data:` marker or a multi-byte character split across two chunks is
//! reassembled before anything looks at it.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::constants::FRAME_DELIMITER;
use crate::str_utils::snippet;

/// Carry-over buffer for one turn. Create a fresh one per turn.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: BytesMut,
    // Leading bytes of the buffer already searched without finding a
    // delimiter.
    scanned: usize,
    frames_emitted: usize,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every frame it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = split_frame(&mut self.buffer, &mut self.scanned) {
            frames.push(frame);
        }
        self.frames_emitted += frames.len();
        frames
    }

    /// Ends the stream. Unterminated trailing bytes are dropped; their count
    /// is returned so callers can record it.
    pub fn finish(&mut self) -> usize {
        self.scanned = 0;
        let dropped = drop_tail(&mut self.buffer);
        if dropped > 0 {
            tracing::debug!(
                "[FRAMING] Stream ended after {} frames with {} unterminated bytes",
                self.frames_emitted,
                dropped
            );
        }
        dropped
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_emitted(&self) -> usize {
        self.frames_emitted
    }
}

/// Allows `FramedRead::new(reader, FrameReassembler::new())` over any
/// `AsyncRead` byte source.
impl Decoder for FrameReassembler {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        let frame = split_frame(src, &mut self.scanned);
        if frame.is_some() {
            self.frames_emitted += 1;
        }
        Ok(frame)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.scanned = 0;
        drop_tail(src);
        Ok(None)
    }
}

/// Splits off the first complete frame. The search resumes just before the
/// already scanned prefix, so a frame fed in many small chunks is scanned
/// once overall rather than once per chunk.
fn split_frame(buffer: &mut BytesMut, scanned: &mut usize) -> Option<String> {
    let start = (*scanned)
        .min(buffer.len())
        .saturating_sub(FRAME_DELIMITER.len() - 1);
    let Some(offset) = find_delimiter(&buffer[start..]) else {
        *scanned = buffer.len();
        return None;
    };
    let pos = start + offset;
    let frame = buffer.split_to(pos);
    buffer.advance(FRAME_DELIMITER.len());
    *scanned = 0;
    Some(String::from_utf8_lossy(&frame).into_owned())
}

fn drop_tail(buffer: &mut BytesMut) -> usize {
    let dropped = buffer.len();
    if dropped > 0 {
        tracing::warn!(
            "[FRAMING] Dropping {} bytes without a closing blank line: {:?}",
            dropped,
            snippet(&String::from_utf8_lossy(&buffer[..]), 80)
        );
        buffer.clear();
    }
    dropped
}

pub fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
}

//! Slicing raw PCM chunks into detector-sized frames
//!
//! Chunks arrive at whatever size the OS delivers them. The reassembler keeps
//! the bytes that do not yet fill a frame (including a dangling half sample)
//! and prepends them to the next chunk.

use std::ops::Deref;

/// Bytes per 16-bit sample
const BYTES_PER_SAMPLE: usize = 2;

/// A fixed-length block of 16-bit signed samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFrame(Vec<i16>);

impl SampleFrame {
    /// Samples in this frame
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.0
    }

    /// Take ownership of the samples
    #[must_use]
    pub fn into_samples(self) -> Vec<i16> {
        self.0
    }
}

impl Deref for SampleFrame {
    type Target = [i16];

    fn deref(&self) -> &[i16] {
        &self.0
    }
}

/// Turns arbitrary byte chunks into consecutive, non-overlapping frames
#[derive(Debug)]
pub struct FrameReassembler {
    frame_length: usize,
    leftover: Vec<u8>,
}

impl FrameReassembler {
    /// Create a reassembler producing frames of `frame_length` samples
    ///
    /// # Panics
    ///
    /// Panics if `frame_length` is zero
    #[must_use]
    pub fn new(frame_length: usize) -> Self {
        assert!(frame_length > 0, "frame length must be non-zero");
        Self {
            frame_length,
            leftover: Vec::with_capacity(frame_length * BYTES_PER_SAMPLE),
        }
    }

    /// Samples per emitted frame
    #[must_use]
    pub const fn frame_length(&self) -> usize {
        self.frame_length
    }

    /// Bytes carried over to the next `feed`
    #[must_use]
    pub fn leftover_bytes(&self) -> usize {
        self.leftover.len()
    }

    /// Complete samples carried over to the next `feed`
    #[must_use]
    pub fn leftover_samples(&self) -> usize {
        self.leftover.len() / BYTES_PER_SAMPLE
    }

    /// Append a chunk and return every frame that is now complete
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SampleFrame> {
        self.leftover.extend_from_slice(chunk);

        let frame_bytes = self.frame_length * BYTES_PER_SAMPLE;
        let complete = self.leftover.len() / frame_bytes;
        if complete == 0 {
            return Vec::new();
        }

        let consumed = complete * frame_bytes;
        let frames = self.leftover[..consumed]
            .chunks_exact(frame_bytes)
            .map(|bytes| {
                SampleFrame(
                    bytes
                        .chunks_exact(BYTES_PER_SAMPLE)
                        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                        .collect(),
                )
            })
            .collect();

        self.leftover.drain(..consumed);
        frames
    }

    /// Discard any carried-over bytes
    pub fn reset(&mut self) {
        self.leftover.clear();
    }
}

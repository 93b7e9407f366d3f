//! Listening session
//!
//! One session owns a microphone capture, a frame reassembler and a wake word
//! detector for a single listening cycle. It is started at most once; after
//! `stop` a fresh session has to be built.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::capture::{
    AudioChunk, CaptureConfig, CaptureEvent, CaptureHandle, DeviceSelector, MicrophoneBackend,
};
use super::frames::FrameReassembler;
use super::wake_word::{EngineFactory, WakeSettings, WakeWordDetector};
use crate::{Error, Result};

/// Lifecycle state of a listening session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing acquired
    Unstarted,
    /// Holding the microphone and detector
    Active,
    /// Released; terminal
    Stopped,
}

/// A wake word match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    /// Index of the matched keyword model
    pub keyword_index: usize,
    /// Zero-based index of the matching frame within the session
    pub frame: u64,
}

/// Everything needed to build sessions, shared across cycles
#[derive(Clone)]
pub struct SessionContext {
    /// Microphone backend
    pub microphone: Arc<dyn MicrophoneBackend>,
    /// Wake word engine factory
    pub engines: Arc<dyn EngineFactory>,
    /// Detector settings
    pub wake: Arc<WakeSettings>,
    /// Input device
    pub device: DeviceSelector,
    /// Capacity of the chunk channel
    pub chunk_capacity: usize,
}

/// Microphone, reassembler and detector started and stopped as one unit
pub struct ListeningSession {
    id: u64,
    ctx: SessionContext,
    state: SessionState,
    failed_start: bool,
    capture: Option<Box<dyn CaptureHandle>>,
    chunks: Option<mpsc::Receiver<CaptureEvent>>,
    detector: Option<WakeWordDetector>,
    reassembler: Option<FrameReassembler>,
    pending: VecDeque<Detection>,
    frames: u64,
}

impl ListeningSession {
    /// Create an unstarted session
    #[must_use]
    pub fn new(id: u64, ctx: SessionContext) -> Self {
        Self {
            id,
            ctx,
            state: SessionState::Unstarted,
            failed_start: false,
            capture: None,
            chunks: None,
            detector: None,
            reassembler: None,
            pending: VecDeque::new(),
            frames: 0,
        }
    }

    /// Acquire the microphone, then the detector, and become active
    ///
    /// On failure nothing stays acquired and the session remains unstarted,
    /// but it refuses any further `start`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless this is the first start of an unstarted
    /// session, otherwise whatever device or detector acquisition reports
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Unstarted if !self.failed_start => {}
            SessionState::Unstarted => {
                return Err(Error::InvalidState(format!(
                    "session {} already failed to start",
                    self.id
                )));
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "session {} cannot start from {other:?}",
                    self.id
                )));
            }
        }

        let spec = self.ctx.engines.frame_spec();
        let capture_config = CaptureConfig {
            device: self.ctx.device.clone(),
            sample_rate: spec.sample_rate,
            channels: 1,
            chunk_capacity: self.ctx.chunk_capacity,
        };

        let (mut capture, chunks) = match self.ctx.microphone.open(&capture_config) {
            Ok(opened) => opened,
            Err(e) => {
                self.failed_start = true;
                tracing::warn!(session = self.id, error = %e, "failed to open microphone");
                return Err(e);
            }
        };

        let detector = match WakeWordDetector::create(self.ctx.engines.as_ref(), &self.ctx.wake)
        {
            Ok(detector) => detector,
            Err(e) => {
                drop(chunks);
                capture.close();
                self.failed_start = true;
                tracing::warn!(
                    session = self.id,
                    error = %e,
                    "failed to create detector, microphone released"
                );
                return Err(e);
            }
        };

        self.reassembler = Some(FrameReassembler::new(spec.frame_length));
        self.capture = Some(capture);
        self.chunks = Some(chunks);
        self.detector = Some(detector);
        self.state = SessionState::Active;

        tracing::info!(
            session = self.id,
            device = %self.ctx.device,
            frame_length = spec.frame_length,
            "listening session active"
        );

        Ok(())
    }

    /// Wait for the next wake word match
    ///
    /// Matches are reported once per qualifying frame; the session keeps
    /// listening until stopped. Cancel-safe. If the device goes away the
    /// session tears itself down and returns `DeviceLost`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if not active, `DeviceLost`, or a detector error
    /// (after which the session is stopped)
    pub async fn next_detection(&mut self) -> Result<Detection> {
        loop {
            if let Some(detection) = self.pending.pop_front() {
                return Ok(detection);
            }

            if self.state != SessionState::Active {
                return Err(Error::InvalidState(format!(
                    "session {} is not active",
                    self.id
                )));
            }

            let event = match self.chunks.as_mut() {
                Some(chunks) => chunks.recv().await,
                None => None,
            };

            match event {
                Some(CaptureEvent::Chunk(chunk)) => {
                    if let Err(e) = self.process_chunk(&chunk) {
                        self.stop();
                        return Err(e);
                    }
                }
                Some(CaptureEvent::DeviceLost(reason)) => {
                    tracing::warn!(session = self.id, reason, "microphone lost");
                    self.stop();
                    return Err(Error::DeviceLost(reason));
                }
                None => {
                    tracing::warn!(session = self.id, "capture stream ended");
                    self.stop();
                    return Err(Error::DeviceLost("capture stream ended".to_string()));
                }
            }
        }
    }

    /// Run one chunk through the reassembler and detector
    ///
    /// Returns how many matches the chunk produced; they are queued for
    /// [`next_detection`](Self::next_detection).
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if not active, or a detector error
    pub fn process_chunk(&mut self, chunk: &AudioChunk) -> Result<usize> {
        let (Some(reassembler), Some(detector)) =
            (self.reassembler.as_mut(), self.detector.as_mut())
        else {
            return Err(Error::InvalidState(format!(
                "session {} is not active",
                self.id
            )));
        };

        let mut matches = 0;
        for frame in reassembler.feed(chunk.as_bytes()) {
            let result = detector.process(&frame)?;
            let index = self.frames;
            self.frames += 1;

            if let Some(keyword_index) = result.keyword_index() {
                tracing::info!(
                    session = self.id,
                    frame = index,
                    keyword_index,
                    "wake word detected"
                );
                self.pending.push_back(Detection {
                    keyword_index,
                    frame: index,
                });
                matches += 1;
            }
        }

        Ok(matches)
    }

    /// Release the detector, then the microphone, and stop. Idempotent.
    pub fn stop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }

        if let Some(mut detector) = self.detector.take()
            && let Err(e) = detector.release()
        {
            tracing::warn!(session = self.id, error = %e, "detector release failed");
        }
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        self.chunks = None;
        self.reassembler = None;
        self.pending.clear();
        self.state = SessionState::Stopped;

        tracing::info!(session = self.id, frames = self.frames, "listening session stopped");
    }

    /// Session identifier
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Frames classified so far
    #[must_use]
    pub const fn frames_processed(&self) -> u64 {
        self.frames
    }

    /// Matches queued but not yet returned
    #[must_use]
    pub fn pending_detections(&self) -> usize {
        self.pending.len()
    }

    /// Samples waiting for the next complete frame
    #[must_use]
    pub fn buffered_samples(&self) -> usize {
        self.reassembler
            .as_ref()
            .map_or(0, FrameReassembler::leftover_samples)
    }
}

impl Drop for ListeningSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ListeningSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("frames", &self.frames)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

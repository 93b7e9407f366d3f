//! Utterance endpointing
//!
//! Splits a live capture into spoken utterances by signal energy: speech
//! starts when a chunk is loud enough and ends after enough trailing silence.

use std::time::Duration;

/// Energy endpointing thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSettings {
    /// RMS of normalized samples above which a chunk counts as speech
    pub energy_threshold: f32,
    /// Shortest utterance worth transcribing
    pub min_speech: Duration,
    /// Silence that ends an utterance
    pub trailing_silence: Duration,
    /// Longest utterance before it is cut off
    pub max_utterance: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            energy_threshold: 0.03,
            min_speech: Duration::from_millis(300),
            trailing_silence: Duration::from_millis(500),
            max_utterance: Duration::from_secs(30),
        }
    }
}

/// Where the endpointer is after a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// No speech yet
    Waiting,
    /// Inside an utterance
    Speaking,
    /// An utterance ended; its samples, including trailing silence
    Complete(Vec<i16>),
}

/// Accumulates one utterance at a time
#[derive(Debug)]
pub struct Endpointer {
    energy_threshold: f32,
    min_speech: usize,
    trailing_silence: usize,
    max_utterance: usize,
    buffer: Vec<i16>,
    speaking: bool,
    silence: usize,
}

impl Endpointer {
    /// Endpointer for audio at `sample_rate`
    #[must_use]
    pub fn new(settings: &EndpointSettings, sample_rate: u32) -> Self {
        Self {
            energy_threshold: settings.energy_threshold,
            min_speech: samples_in(settings.min_speech, sample_rate),
            trailing_silence: samples_in(settings.trailing_silence, sample_rate),
            max_utterance: samples_in(settings.max_utterance, sample_rate),
            buffer: Vec::new(),
            speaking: false,
            silence: 0,
        }
    }

    /// Feed the next block of captured samples
    pub fn push(&mut self, samples: &[i16]) -> Endpoint {
        let energy = rms(samples);
        let is_speech = energy > self.energy_threshold;

        if !self.speaking {
            if !is_speech {
                return Endpoint::Waiting;
            }
            tracing::trace!(energy, "speech started");
            self.speaking = true;
            self.silence = 0;
            self.buffer.clear();
        }

        self.buffer.extend_from_slice(samples);
        if is_speech {
            self.silence = 0;
        } else {
            self.silence += samples.len();
        }

        if self.silence > self.trailing_silence && self.buffer.len() > self.min_speech {
            tracing::debug!(samples = self.buffer.len(), "utterance complete");
            return Endpoint::Complete(self.take());
        }

        if self.buffer.len() >= self.max_utterance {
            tracing::debug!(samples = self.buffer.len(), "utterance cut at length limit");
            return Endpoint::Complete(self.take());
        }

        // A click or cough, not an utterance
        if self.silence > self.trailing_silence * 2 {
            tracing::trace!("speech too short, discarded");
            self.reset();
            return Endpoint::Waiting;
        }

        Endpoint::Speaking
    }

    /// Whether an utterance is in progress
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Drop any partial utterance
    pub fn reset(&mut self) {
        self.speaking = false;
        self.silence = 0;
        self.buffer.clear();
    }

    fn take(&mut self) -> Vec<i16> {
        self.speaking = false;
        self.silence = 0;
        std::mem::take(&mut self.buffer)
    }
}

fn samples_in(duration: Duration, sample_rate: u32) -> usize {
    let samples = duration.as_millis() * u128::from(sample_rate) / 1000;
    usize::try_from(samples).unwrap_or(usize::MAX)
}

/// Root mean square of samples scaled to `[-1, 1]`
#[allow(clippy::cast_precision_loss)]
fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples
        .iter()
        .map(|&s| {
            let x = f32::from(s) / 32768.0;
            x * x
        })
        .sum();
    (sum / samples.len() as f32).sqrt()
}

//! Wake word detection
//!
//! The keyword-spotting model itself is an external engine behind
//! [`WakeWordEngine`]. [`WakeWordDetector`] wraps one engine instance and
//! enforces the frame-length and release contract around it.

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

/// Default per-keyword sensitivity
pub const DEFAULT_SENSITIVITY: f32 = 0.65;

/// Audio format an engine requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    /// Samples per second
    pub sample_rate: u32,
    /// Samples per frame handed to `process`
    pub frame_length: usize,
}

/// Outcome of classifying one frame
///
/// Non-negative values index the matched keyword; negative values mean no match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionResult(i32);

impl DetectionResult {
    /// No keyword matched
    pub const NONE: Self = Self(-1);

    /// Wrap a raw engine result
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Raw engine value
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Whether a keyword matched
    #[must_use]
    pub const fn is_match(self) -> bool {
        self.0 >= 0
    }

    /// Index of the matched keyword, if any
    #[must_use]
    pub fn keyword_index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

/// What a detector is created from
#[derive(Debug)]
pub struct WakeSettings {
    /// Secret for engines that need one
    pub access_key: Option<SecretString>,
    /// One model file per keyword
    pub keyword_paths: Vec<PathBuf>,
    /// One threshold in `[0, 1]` per keyword
    pub sensitivities: Vec<f32>,
    /// Optional engine parameter file or directory
    pub model_path: Option<PathBuf>,
}

/// A stateful keyword-spotting engine instance
///
/// Not reentrant; the owner calls `process` from one flow of control.
/// Dropping the engine frees its native resources.
pub trait WakeWordEngine: Send {
    /// Classify one frame; `>= 0` is a keyword index, `< 0` is no match
    ///
    /// # Errors
    ///
    /// Returns error if the engine fails internally
    fn process(&mut self, frame: &[i16]) -> Result<i32>;
}

/// Creates engine instances
pub trait EngineFactory: Send + Sync {
    /// Format the engine requires, known before creation
    fn frame_spec(&self) -> FrameSpec;

    /// Whether `create` needs `WakeSettings::access_key`
    fn requires_credential(&self) -> bool {
        true
    }

    /// Create a fresh engine
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredential` or `ModelLoad` if the engine cannot start
    fn create(&self, settings: &WakeSettings) -> Result<Box<dyn WakeWordEngine>>;
}

/// Reject a missing or blank access key
///
/// # Errors
///
/// Returns `InvalidCredential`
pub fn check_credential(settings: &WakeSettings) -> Result<()> {
    match &settings.access_key {
        Some(key) if !key.expose_secret().trim().is_empty() => Ok(()),
        Some(_) => Err(Error::InvalidCredential("access key is empty".to_string())),
        None => Err(Error::InvalidCredential(
            "access key is not configured".to_string(),
        )),
    }
}

/// A created detector with an explicit release step
pub struct WakeWordDetector {
    engine: Option<Box<dyn WakeWordEngine>>,
    frame_length: usize,
    frames_processed: u64,
}

impl WakeWordDetector {
    /// Create a detector from `factory`
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredential` if the factory needs an access key and it
    /// is missing or blank, `ModelLoad` if the settings are inconsistent, or
    /// whatever the factory reports
    pub fn create(factory: &dyn EngineFactory, settings: &WakeSettings) -> Result<Self> {
        if factory.requires_credential() {
            check_credential(settings)?;
        }
        if settings.keyword_paths.is_empty() {
            return Err(Error::ModelLoad("no keyword models configured".to_string()));
        }
        if settings.keyword_paths.len() != settings.sensitivities.len() {
            return Err(Error::ModelLoad(format!(
                "{} keyword models but {} sensitivities",
                settings.keyword_paths.len(),
                settings.sensitivities.len()
            )));
        }

        let spec = factory.frame_spec();
        let engine = factory.create(settings)?;

        tracing::debug!(
            keywords = settings.keyword_paths.len(),
            sample_rate = spec.sample_rate,
            frame_length = spec.frame_length,
            "wake word detector initialized"
        );

        Ok(Self {
            engine: Some(engine),
            frame_length: spec.frame_length,
            frames_processed: 0,
        })
    }

    /// Classify one frame
    ///
    /// # Errors
    ///
    /// Returns `UseAfterRelease` after `release`, `InvalidFrameLength` if the
    /// frame is not exactly `frame_length` samples, or an engine error
    pub fn process(&mut self, frame: &[i16]) -> Result<DetectionResult> {
        let engine = self.engine.as_mut().ok_or(Error::UseAfterRelease)?;

        if frame.len() != self.frame_length {
            return Err(Error::InvalidFrameLength {
                expected: self.frame_length,
                actual: frame.len(),
            });
        }

        let result = DetectionResult::new(engine.process(frame)?);
        self.frames_processed += 1;

        tracing::trace!(
            frame = self.frames_processed,
            result = result.raw(),
            "processed frame"
        );

        Ok(result)
    }

    /// Free the engine
    ///
    /// # Errors
    ///
    /// Returns `UseAfterRelease` if already released
    pub fn release(&mut self) -> Result<()> {
        let engine = self.engine.take().ok_or(Error::UseAfterRelease)?;
        drop(engine);
        tracing::debug!(frames = self.frames_processed, "wake word detector released");
        Ok(())
    }

    /// Whether `release` has run
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.engine.is_none()
    }

    /// Samples per frame
    #[must_use]
    pub const fn frame_length(&self) -> usize {
        self.frame_length
    }

    /// Frames classified so far
    #[must_use]
    pub const fn frames_processed(&self) -> u64 {
        self.frames_processed
    }
}

impl std::fmt::Debug for WakeWordDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeWordDetector")
            .field("released", &self.is_released())
            .field("frame_length", &self.frame_length)
            .field("frames_processed", &self.frames_processed)
            .finish()
    }
}

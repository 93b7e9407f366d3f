//! Error types for Hearken

use thiserror::Error;

/// Result type alias for Hearken operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Hearken
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No microphone matches the request, or another holder has it
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Microphone disappeared while capturing
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// Wake-word access credential missing or rejected
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Wake-word model could not be loaded
    #[error("model load error: {0}")]
    ModelLoad(String),

    /// Frame handed to the detector has the wrong number of samples
    #[error("invalid frame length: expected {expected} samples, got {actual}")]
    InvalidFrameLength {
        /// Detector-mandated frame length
        expected: usize,
        /// Length actually supplied
        actual: usize,
    },

    /// Wake-word engine failed while classifying
    #[error("wake-word engine error: {0}")]
    Engine(String),

    /// Detector used after `release`
    #[error("wake-word detector used after release")]
    UseAfterRelease,

    /// Remote language model failure
    #[error("remote error: {0}")]
    Remote(String),

    /// Operation not valid in the current lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Another instance holds the instance lock
    #[error("already running: {0}")]
    AlreadyRunning(String),

    /// Audio backend error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text failure
    #[error("speech-to-text error: {0}")]
    Stt(String),

    /// Text-to-speech failure
    #[error("text-to-speech error: {0}")]
    Tts(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error is a caller bug rather than a runtime condition
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(self, Self::InvalidFrameLength { .. } | Self::UseAfterRelease)
    }

    /// Whether a later attempt at acquiring the same resources may succeed
    ///
    /// Engine faults count: a fresh engine instance starts from clean state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_) | Self::DeviceLost(_) | Self::Engine(_)
        )
    }
}

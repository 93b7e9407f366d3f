//! Voice processing module
//!
//! Handles microphone capture, frame reassembly, wake word detection, the
//! listening session that ties them together, and the speech path used by
//! the spoken interaction surface.

mod capture;
mod frames;
#[cfg(feature = "openwakeword")]
mod openwakeword;
mod playback;
mod session;
mod stt;
mod tts;
mod utterance;
mod wake_word;

pub use capture::{
    AudioChunk, BITS_PER_SAMPLE, CaptureConfig, CaptureEvent, CaptureHandle, CpalMicrophone,
    DEFAULT_CHUNK_CAPACITY, DeviceSelector, InputDevice, MicrophoneBackend, SAMPLE_RATE,
    samples_to_wav, select_device,
};
pub use frames::{FrameReassembler, SampleFrame};
#[cfg(feature = "openwakeword")]
pub use openwakeword::OpenWakeWordFactory;
pub use playback::AudioPlayback;
pub use session::{Detection, ListeningSession, SessionContext, SessionState};
pub use stt::{SpeechToText, Transcriber};
pub use tts::{Speaker, TextToSpeech, VoiceOutput};
pub use utterance::{Endpoint, EndpointSettings, Endpointer};
pub use wake_word::{
    DEFAULT_SENSITIVITY, DetectionResult, EngineFactory, FrameSpec, WakeSettings,
    WakeWordDetector, WakeWordEngine, check_credential,
};

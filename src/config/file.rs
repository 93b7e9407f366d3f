//! TOML configuration file loading
//!
//! Supports `~/.config/hearken/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HearkenConfigFile {
    /// Wake word detection
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Microphone capture
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Remote language model
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Interaction surface
    #[serde(default)]
    pub interaction: InteractionFileConfig,

    /// Listening retry policy
    #[serde(default)]
    pub retry: RetryFileConfig,

    /// Spoken surface speech services
    #[serde(default)]
    pub speech: SpeechFileConfig,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Engine access key, for engines that need one
    pub access_key: Option<String>,
    /// Per-keyword classifier models (`.onnx`)
    pub keyword_paths: Option<Vec<PathBuf>>,
    /// Per-keyword sensitivities
    pub sensitivities: Option<Vec<f32>>,
    /// Directory holding the shared feature models
    pub model_path: Option<PathBuf>,
}

/// Audio capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Input device name, or "default"
    pub device: Option<String>,
    /// Bounded chunk channel capacity
    pub chunk_capacity: Option<usize>,
}

/// LLM configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// Interaction configuration
#[derive(Debug, Default, Deserialize)]
pub struct InteractionFileConfig {
    /// `voice` or `console`
    pub surface: Option<String>,
    /// Inactivity timeout in seconds
    pub inactivity_secs: Option<u64>,
    /// Greeting spoken when an interaction opens
    pub greeting: Option<String>,
}

/// Speech service configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub stt_model: Option<String>,
    pub tts_model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    /// RMS level that counts as speech
    pub energy_threshold: Option<f32>,
    /// Silence that ends an utterance
    pub silence_ms: Option<u64>,
    /// Longest utterance
    pub max_utterance_secs: Option<u64>,
}

/// Retry configuration
#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    pub initial_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// Load the TOML config file
///
/// An explicit path must exist and parse. The standard path is optional:
/// a missing file yields defaults and an unparsable one is logged and
/// ignored.
///
/// # Errors
///
/// Returns error if an explicitly given file cannot be read or parsed
pub fn load_config_file(explicit: Option<&Path>) -> Result<HearkenConfigFile> {
    if let Some(path) = explicit {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(HearkenConfigFile::default());
    };

    if !path.exists() {
        return Ok(HearkenConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(HearkenConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(HearkenConfigFile::default())
        }
    }
}

/// Return the config file path: `~/.config/hearken/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("hearken").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_partial_file_parses() {
        let config: HearkenConfigFile = toml::from_str(
            r#"
            [wake]
            keyword_paths = ["/opt/hey_computer.onnx"]

            [audio]
            device = "USB Microphone"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.wake.keyword_paths,
            Some(vec![PathBuf::from("/opt/hey_computer.onnx")])
        );
        assert_eq!(config.audio.device.as_deref(), Some("USB Microphone"));
        assert!(config.llm.model.is_none());
        assert!(config.retry.max_attempts.is_none());
        assert!(config.speech.api_key.is_none());
    }

    #[test]
    fn test_speech_section_parses() {
        let config: HearkenConfigFile = toml::from_str(
            r#"
            [interaction]
            surface = "console"

            [speech]
            voice = "nova"
            silence_ms = 700
            "#,
        )
        .unwrap();

        assert_eq!(config.interaction.surface.as_deref(), Some("console"));
        assert_eq!(config.speech.voice.as_deref(), Some("nova"));
        assert_eq!(config.speech.silence_ms, Some(700));
    }

    #[test]
    fn test_explicit_file_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[interaction]\ninactivity_secs = 12").unwrap();

        let config = load_config_file(Some(file.path())).unwrap();
        assert_eq!(config.interaction.inactivity_secs, Some(12));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config_file(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_explicit_invalid_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[wake\nkeyword_paths = 3").unwrap();

        assert!(matches!(
            load_config_file(Some(file.path())),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let result: std::result::Result<HearkenConfigFile, _> =
            toml::from_str("[server]\nport = 1");
        assert!(result.is_err());
    }
}

//! Configuration management for Hearken

pub mod file;

use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::arbiter::RetryPolicy;
use crate::interaction::InteractionSettings;
use crate::voice::{
    DEFAULT_CHUNK_CAPACITY, DEFAULT_SENSITIVITY, DeviceSelector, EndpointSettings, WakeSettings,
};
use crate::{Error, Result};

use self::file::HearkenConfigFile;

/// Default Gemini model
pub const DEFAULT_LLM_MODEL: &str = "gemini-1.5-flash";

/// Default Gemini API base URL
pub const DEFAULT_LLM_URL: &str = "https://generativelanguage.googleapis.com";

/// Default base URL for the speech APIs
pub const DEFAULT_SPEECH_URL: &str = "https://api.openai.com";

/// Resolved runtime configuration
#[derive(Debug)]
pub struct Config {
    /// Wake word detector settings
    pub wake: WakeSettings,

    /// Microphone capture
    pub audio: AudioConfig,

    /// Remote language model
    pub llm: LlmConfig,

    /// Which surface opens after a wake word
    pub surface: SurfaceKind,

    /// Interaction surface tuning
    pub interaction: InteractionSettings,

    /// Speech services for the spoken surface
    pub speech: SpeechConfig,

    /// Listening restart policy
    pub retry: RetryPolicy,
}

/// Interaction surface choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceKind {
    /// Speech in, speech out
    #[default]
    Voice,
    /// Lines on stdin, replies on stdout
    Console,
}

impl SurfaceKind {
    /// Parse `voice` or `console`
    ///
    /// # Errors
    ///
    /// Returns error for any other value
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "voice" => Ok(Self::Voice),
            "console" => Ok(Self::Console),
            other => Err(Error::Config(format!(
                "unknown interaction surface {other:?} (expected voice or console)"
            ))),
        }
    }
}

impl fmt::Display for SurfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voice => write!(f, "voice"),
            Self::Console => write!(f, "console"),
        }
    }
}

/// Microphone configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    /// Input device
    pub device: DeviceSelector,

    /// Capacity of the bounded chunk channel
    pub chunk_capacity: usize,
}

/// Remote LLM configuration
#[derive(Debug)]
pub struct LlmConfig {
    /// API key (from `GEMINI_API_KEY`)
    pub api_key: Option<SecretString>,

    /// Model identifier
    pub model: String,

    /// API base URL
    pub base_url: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Reply length cap
    pub max_output_tokens: u32,
}

/// Speech-to-text and text-to-speech configuration
#[derive(Debug)]
pub struct SpeechConfig {
    /// API key (from `OPENAI_API_KEY`)
    pub api_key: Option<SecretString>,

    /// Base URL of the OpenAI-compatible speech API
    pub base_url: String,

    /// Transcription model
    pub stt_model: String,

    /// Synthesis model
    pub tts_model: String,

    /// Synthesis voice
    pub voice: String,

    /// Speaking rate
    pub speed: f32,

    /// Utterance endpointing
    pub endpointing: EndpointSettings,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_SPEECH_URL.to_string(),
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            speed: 1.0,
            endpointing: EndpointSettings::default(),
        }
    }
}

impl SpeechConfig {
    /// The API key the spoken surface needs
    ///
    /// # Errors
    ///
    /// Returns `Config` if no key is configured
    pub fn require_key(&self) -> Result<SecretString> {
        self.api_key.clone().ok_or_else(|| {
            Error::Config(
                "the voice surface needs OPENAI_API_KEY (env or speech.api_key); \
                 set interaction.surface = \"console\" to type instead"
                    .to_string(),
            )
        })
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_LLM_MODEL.to_string(),
            base_url: DEFAULT_LLM_URL.to_string(),
            temperature: 0.8,
            max_output_tokens: 256,
        }
    }
}

/// Return the directory for runtime state such as the instance lock
///
/// Uses `~/.local/share/hearken/` on Linux
pub fn state_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/hearken"),
        |d| d.data_local_dir().join("hearken"),
    )
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// `path` overrides the standard config file location.
    ///
    /// # Errors
    ///
    /// Returns error if the file is invalid or a value fails validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // env > toml > default
        let fc = file::load_config_file(path)?;
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value fails validation
    pub fn resolve(fc: HearkenConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        // Wake word; engines that need a key check for it at startup
        let access_key = env("HEARKEN_ACCESS_KEY")
            .or(fc.wake.access_key)
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);

        let keyword_paths: Vec<PathBuf> = env("HEARKEN_KEYWORD_PATHS")
            .map(|v| split_list(&v).map(PathBuf::from).collect())
            .or(fc.wake.keyword_paths)
            .unwrap_or_default();
        if keyword_paths.is_empty() {
            return Err(Error::Config(
                "no keyword model configured (HEARKEN_KEYWORD_PATHS or wake.keyword_paths)"
                    .to_string(),
            ));
        }

        let sensitivities = match env("HEARKEN_SENSITIVITIES") {
            Some(v) => Some(parse_list::<f32>("HEARKEN_SENSITIVITIES", &v)?),
            None => fc.wake.sensitivities,
        };
        let sensitivities = broadcast_sensitivities(sensitivities, keyword_paths.len())?;

        let wake = WakeSettings {
            access_key,
            keyword_paths,
            sensitivities,
            model_path: env("HEARKEN_MODEL_PATH")
                .map(PathBuf::from)
                .or(fc.wake.model_path),
        };

        // Audio
        let device = match env("HEARKEN_DEVICE").or(fc.audio.device) {
            Some(name) => DeviceSelector::parse(&name)?,
            None => DeviceSelector::Default,
        };
        let chunk_capacity = fc.audio.chunk_capacity.unwrap_or(DEFAULT_CHUNK_CAPACITY);
        if chunk_capacity == 0 {
            return Err(Error::Config("audio.chunk_capacity must be positive".to_string()));
        }
        let audio = AudioConfig {
            device,
            chunk_capacity,
        };

        // LLM
        let defaults = LlmConfig::default();
        let llm = LlmConfig {
            api_key: env("GEMINI_API_KEY")
                .or(fc.llm.api_key)
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            model: env("HEARKEN_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or(defaults.model),
            base_url: env("HEARKEN_LLM_URL")
                .or(fc.llm.base_url)
                .unwrap_or(defaults.base_url),
            temperature: fc.llm.temperature.unwrap_or(defaults.temperature),
            max_output_tokens: fc
                .llm
                .max_output_tokens
                .unwrap_or(defaults.max_output_tokens),
        };
        if !llm.temperature.is_finite() || llm.temperature < 0.0 {
            return Err(Error::Config(format!(
                "llm.temperature must be a non-negative number, got {}",
                llm.temperature
            )));
        }
        if llm.max_output_tokens == 0 {
            return Err(Error::Config("llm.max_output_tokens must be positive".to_string()));
        }

        // Interaction
        let surface = match env("HEARKEN_SURFACE").or(fc.interaction.surface) {
            Some(value) => SurfaceKind::parse(&value)?,
            None => SurfaceKind::default(),
        };
        let inactivity_secs = match env("HEARKEN_INACTIVITY_SECS") {
            Some(v) => Some(parse_value::<u64>("HEARKEN_INACTIVITY_SECS", &v)?),
            None => fc.interaction.inactivity_secs,
        };
        let mut interaction = InteractionSettings::default();
        if let Some(secs) = inactivity_secs {
            if secs == 0 {
                return Err(Error::Config("inactivity timeout must be positive".to_string()));
            }
            interaction.inactivity_timeout = Duration::from_secs(secs);
        }
        if let Some(greeting) = fc.interaction.greeting {
            interaction.greeting = greeting;
        }

        let speech = resolve_speech(fc.speech, &env)?;

        // Retry
        let mut retry = RetryPolicy::default();
        if let Some(ms) = fc.retry.initial_ms {
            retry.initial = Duration::from_millis(ms);
        }
        if let Some(ms) = fc.retry.max_ms {
            retry.max = Duration::from_millis(ms);
        }
        if let Some(attempts) = fc.retry.max_attempts {
            retry.max_attempts = attempts;
        }
        if retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if retry.initial > retry.max {
            return Err(Error::Config(
                "retry.initial_ms must not exceed retry.max_ms".to_string(),
            ));
        }

        Ok(Self {
            wake,
            audio,
            llm,
            surface,
            interaction,
            speech,
            retry,
        })
    }

    /// Human-readable summary with secrets redacted
    #[must_use]
    pub fn redacted_summary(&self) -> String {
        let presence = |set: bool| if set { "set" } else { "missing" };
        let keywords: Vec<String> = self
            .wake
            .keyword_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "wake.access_key        = {}",
            presence(self.wake.access_key.is_some())
        );
        let _ = writeln!(out, "wake.keyword_paths     = {}", keywords.join(", "));
        let _ = writeln!(out, "wake.sensitivities     = {:?}", self.wake.sensitivities);
        let _ = writeln!(
            out,
            "wake.model_path        = {}",
            self.wake
                .model_path
                .as_ref()
                .map_or_else(|| "(engine default)".to_string(), |p| p.display().to_string())
        );
        let _ = writeln!(out, "audio.device           = {}", self.audio.device);
        let _ = writeln!(out, "audio.chunk_capacity   = {}", self.audio.chunk_capacity);
        let _ = writeln!(
            out,
            "llm.api_key            = {}",
            presence(self.llm.api_key.is_some())
        );
        let _ = writeln!(out, "llm.model              = {}", self.llm.model);
        let _ = writeln!(out, "llm.base_url           = {}", self.llm.base_url);
        let _ = writeln!(out, "interaction.surface    = {}", self.surface);
        let _ = writeln!(
            out,
            "interaction.inactivity = {}s",
            self.interaction.inactivity_timeout.as_secs()
        );
        let _ = writeln!(
            out,
            "speech.api_key         = {}",
            presence(self.speech.api_key.is_some())
        );
        let _ = writeln!(out, "speech.base_url        = {}", self.speech.base_url);
        let _ = writeln!(
            out,
            "speech.models          = {} / {} ({})",
            self.speech.stt_model, self.speech.tts_model, self.speech.voice
        );
        let _ = write!(
            out,
            "retry                  = {}ms..{}ms x{}",
            self.retry.initial.as_millis(),
            self.retry.max.as_millis(),
            self.retry.max_attempts
        );
        out
    }
}

fn resolve_speech(
    fc: file::SpeechFileConfig,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<SpeechConfig> {
    let defaults = SpeechConfig::default();
    let mut endpointing = defaults.endpointing;

    if let Some(threshold) = fc.energy_threshold {
        if threshold.is_nan() || threshold <= 0.0 || threshold > 1.0 {
            return Err(Error::Config(format!(
                "speech.energy_threshold must be in (0, 1], got {threshold}"
            )));
        }
        endpointing.energy_threshold = threshold;
    }
    if let Some(ms) = fc.silence_ms {
        if ms == 0 {
            return Err(Error::Config("speech.silence_ms must be positive".to_string()));
        }
        endpointing.trailing_silence = Duration::from_millis(ms);
    }
    if let Some(secs) = fc.max_utterance_secs {
        if secs == 0 {
            return Err(Error::Config(
                "speech.max_utterance_secs must be positive".to_string(),
            ));
        }
        endpointing.max_utterance = Duration::from_secs(secs);
    }

    let speed = fc.speed.unwrap_or(defaults.speed);
    if !(0.25..=4.0).contains(&speed) {
        return Err(Error::Config(format!(
            "speech.speed must be within [0.25, 4.0], got {speed}"
        )));
    }

    Ok(SpeechConfig {
        api_key: env("OPENAI_API_KEY")
            .or(fc.api_key)
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from),
        base_url: env("HEARKEN_SPEECH_URL")
            .or(fc.base_url)
            .unwrap_or(defaults.base_url),
        stt_model: fc.stt_model.unwrap_or(defaults.stt_model),
        tts_model: fc.tts_model.unwrap_or(defaults.tts_model),
        voice: fc.voice.unwrap_or(defaults.voice),
        speed,
        endpointing,
    })
}

/// Expand sensitivities to one per keyword and range-check them
fn broadcast_sensitivities(configured: Option<Vec<f32>>, keywords: usize) -> Result<Vec<f32>> {
    let sensitivities = match configured {
        None => vec![DEFAULT_SENSITIVITY; keywords],
        Some(values) if values.len() == 1 => vec![values[0]; keywords],
        Some(values) if values.len() == keywords => values,
        Some(values) => {
            return Err(Error::Config(format!(
                "{} sensitivities configured for {keywords} keywords",
                values.len()
            )));
        }
    };

    if let Some(bad) = sensitivities
        .iter()
        .find(|s| !(0.0..=1.0).contains(*s))
    {
        return Err(Error::Config(format!(
            "sensitivity {bad} is outside [0, 1]"
        )));
    }

    Ok(sensitivities)
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_list<T: FromStr>(key: &str, value: &str) -> Result<Vec<T>> {
    split_list(value).map(|item| parse_value(key, item)).collect()
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse {value:?}")))
}

//! Text-to-speech (TTS) over an OpenAI-compatible speech API

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::playback::AudioPlayback;
use crate::{Error, Result};

/// Says text out loud
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Speak `text`, returning once it has been heard
    ///
    /// # Errors
    ///
    /// Returns `Tts` or `Audio` if synthesis or playback fails
    async fn speak(&self, text: &str) -> Result<()>;
}

/// Synthesizes speech from text
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    voice: String,
    speed: f32,
}

impl TextToSpeech {
    /// Create a client for `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is blank
    pub fn new(
        api_key: SecretString,
        base_url: &str,
        model: String,
        voice: String,
        speed: f32,
    ) -> Result<Self> {
        if api_key.expose_secret().trim().is_empty() {
            return Err(Error::Config("speech API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            voice,
            speed,
        })
    }

    /// Synthesize `text` to MP3 bytes
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Tts(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("speech API error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Tts(e.to_string()))?;
        tracing::debug!(
            chars = text.len(),
            audio_bytes = audio.len(),
            "speech synthesized"
        );
        Ok(audio.to_vec())
    }
}

/// Synthesized speech through the speakers
pub struct VoiceOutput {
    tts: TextToSpeech,
    playback: AudioPlayback,
}

impl VoiceOutput {
    /// Pair a synthesizer with a playback device
    #[must_use]
    pub const fn new(tts: TextToSpeech, playback: AudioPlayback) -> Self {
        Self { tts, playback }
    }
}

#[async_trait]
impl Speaker for VoiceOutput {
    async fn speak(&self, text: &str) -> Result<()> {
        let mp3 = self.tts.synthesize(text).await?;
        self.playback.play_mp3(mp3).await
    }
}

//! Interaction surface and remote model collaborators
//!
//! After a wake word the arbiter opens an [`InteractionSurface`]. The surface
//! runs the conversation on its own and reports exactly one
//! [`InteractionClosed`] when it is done. [`SpokenSurface`] talks through the
//! microphone and speakers; [`ConsoleSurface`] is the text fallback.

mod console;
mod gemini;
mod spoken;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::Result;

pub use console::{ConsoleSurface, StdioSurface};
pub use gemini::GeminiClient;
pub use spoken::{SpeechIo, SpokenSurface};

/// Default greeting shown when an interaction opens
pub const DEFAULT_GREETING: &str = "Hello! How can I help you?";

/// Reply shown when the remote model fails
pub const DEFAULT_ERROR_REPLY: &str = "I'm sorry, I encountered an error. Please try again later.";

/// Default inactivity timeout before an interaction closes itself
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(7);

/// Who produced a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person speaking to the assistant
    User,
    /// The language model
    Model,
}

/// One utterance in a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// Speaker
    pub role: Role,
    /// Utterance text
    pub text: String,
}

/// Ordered conversation history
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    /// Start a conversation with the assistant's greeting
    #[must_use]
    pub fn with_greeting(greeting: &str) -> Self {
        let mut conversation = Self::default();
        conversation.push_model(greeting);
        conversation
    }

    /// Record a user utterance
    pub fn push_user(&mut self, text: &str) {
        self.turns.push(Turn {
            role: Role::User,
            text: text.to_string(),
        });
    }

    /// Record a model reply
    pub fn push_model(&mut self, text: &str) {
        self.turns.push(Turn {
            role: Role::Model,
            text: text.to_string(),
        });
    }

    /// All turns in order
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }
}

/// How an interaction ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionClosed {
    /// The user finished (end of input)
    Completed,
    /// Nothing was said within the inactivity timeout
    TimedOut,
    /// The surface broke down
    Failed(String),
}

/// Interaction surface tuning
#[derive(Debug, Clone)]
pub struct InteractionSettings {
    /// Close after this long without input
    pub inactivity_timeout: Duration,
    /// First model turn
    pub greeting: String,
    /// Shown when the remote model fails
    pub error_reply: String,
}

impl Default for InteractionSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            greeting: DEFAULT_GREETING.to_string(),
            error_reply: DEFAULT_ERROR_REPLY.to_string(),
        }
    }
}

/// The conversational UI opened after a wake word
#[async_trait]
pub trait InteractionSurface: Send {
    /// Begin an interaction; send one value on `closed` when it ends
    ///
    /// Called only after listening has released the microphone.
    ///
    /// # Errors
    ///
    /// Returns error if the surface cannot start; `closed` is then dropped
    async fn open(&mut self, closed: oneshot::Sender<InteractionClosed>) -> Result<()>;
}

/// Remote language model
#[async_trait]
pub trait RemoteModel: Send + Sync {
    /// Generate the next model turn for `turns`
    ///
    /// # Errors
    ///
    /// Returns `Remote` if the request fails or the reply is unusable
    async fn generate(&self, turns: &[Turn]) -> Result<String>;
}

//! Hearken - wake word listening and interaction handoff
//!
//! This library provides the core of a voice-activated assistant:
//! - Microphone capture and frame reassembly
//! - Wake word detection behind a guarded detector
//! - Listening sessions that acquire and release devices as one unit
//! - An arbiter alternating between listening and an open interaction
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   SessionArbiter                      │
//! │   Listening(session)  ⇄  Interacting  ·  Degraded     │
//! └──────────┬──────────────────────────────┬────────────┘
//!            │                              │
//! ┌──────────▼───────────────┐   ┌──────────▼────────────┐
//! │     ListeningSession     │   │  InteractionSurface   │
//! │ capture → frames → wake  │   │   → RemoteModel       │
//! └──────────────────────────┘   └───────────────────────┘
//! ```

pub mod arbiter;
pub mod config;
pub mod daemon;
pub mod error;
pub mod instance;
pub mod interaction;
pub mod voice;

pub use arbiter::{ArbiterEvent, ArbiterStatus, RetryPolicy, SessionArbiter};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use instance::InstanceLock;

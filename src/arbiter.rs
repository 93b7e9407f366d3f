//! Session arbiter
//!
//! Owns the control loop that alternates between ambient listening and an
//! open interaction. At most one of the two holds the microphone at any
//! time: a wake word stops the listening session before the interaction
//! surface is opened, and a closed interaction is followed by a brand-new
//! session.
//!
//! The loop is pull-based. [`SessionArbiter::wait_event`] waits for whatever
//! the current state can produce and [`SessionArbiter::handle`] applies it,
//! so every transition happens on one flow of control.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::interaction::{InteractionClosed, InteractionSurface};
use crate::voice::{Detection, ListeningSession, SessionContext};
use crate::{Error, Result};

/// Bounded exponential backoff for restarting listening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound on any delay
    pub max: Duration,
    /// Consecutive failures after which retrying stops
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once exhausted
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

/// Externally visible arbiter state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterStatus {
    /// Nothing active
    Idle,
    /// A listening session is active
    Listening {
        /// Session identifier
        session: u64,
    },
    /// The interaction surface is open
    Interacting,
    /// Listening could not start
    Degraded {
        /// Human-readable failure
        reason: String,
        /// When the next attempt happens, if any
        retry_in: Option<Duration>,
    },
}

/// Something the arbiter has to react to
#[derive(Debug)]
pub enum ArbiterEvent {
    /// The active session matched a wake word
    WakeWord(Detection),
    /// The active session ended on its own
    ListeningFailed(Error),
    /// The interaction surface closed
    InteractionClosed(InteractionClosed),
    /// A scheduled listening retry is due
    RetryDue,
}

enum ArbiterState {
    Idle,
    Listening(ListeningSession),
    Interacting(oneshot::Receiver<InteractionClosed>),
    Degraded { retry_at: Option<Instant> },
}

/// Drives the listening/interaction cycle
pub struct SessionArbiter {
    ctx: SessionContext,
    surface: Box<dyn InteractionSurface>,
    retry: RetryPolicy,
    state: ArbiterState,
    status: watch::Sender<ArbiterStatus>,
    next_session_id: u64,
    sessions_started: u64,
    wake_events: u64,
    failures: u32,
}

impl SessionArbiter {
    /// Create an idle arbiter
    #[must_use]
    pub fn new(
        ctx: SessionContext,
        surface: Box<dyn InteractionSurface>,
        retry: RetryPolicy,
    ) -> Self {
        let (status, _) = watch::channel(ArbiterStatus::Idle);
        Self {
            ctx,
            surface,
            retry,
            state: ArbiterState::Idle,
            status,
            next_session_id: 0,
            sessions_started: 0,
            wake_events: 0,
            failures: 0,
        }
    }

    /// Enter the initial listening state
    ///
    /// A failed start leaves the arbiter degraded rather than failing.
    pub fn start(&mut self) {
        if matches!(self.state, ArbiterState::Idle) {
            self.start_listening();
        }
    }

    /// Run until `shutdown` fires or a contract violation occurs
    ///
    /// The active session is stopped before this returns.
    ///
    /// # Errors
    ///
    /// Returns the contract violation that aborted the loop
    pub async fn run(&mut self, shutdown: &mut mpsc::Receiver<()>) -> Result<()> {
        self.start();

        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => None,
                event = self.wait_event() => Some(event),
            };

            let Some(event) = event else {
                tracing::info!("arbiter shutting down");
                break;
            };

            if let Err(e) = self.handle(event).await {
                tracing::error!(error = %e, "arbiter aborted");
                self.shutdown();
                return Err(e);
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Wait for the next event the current state can produce
    ///
    /// Cancel-safe. Never completes while idle or degraded without a retry.
    pub async fn wait_event(&mut self) -> ArbiterEvent {
        match &mut self.state {
            ArbiterState::Listening(session) => match session.next_detection().await {
                Ok(detection) => ArbiterEvent::WakeWord(detection),
                Err(e) => ArbiterEvent::ListeningFailed(e),
            },
            ArbiterState::Interacting(closed) => {
                let outcome = closed.await.unwrap_or_else(|_| {
                    InteractionClosed::Failed("surface dropped the close notification".to_string())
                });
                ArbiterEvent::InteractionClosed(outcome)
            }
            ArbiterState::Degraded {
                retry_at: Some(at),
            } => {
                tokio::time::sleep_until(*at).await;
                ArbiterEvent::RetryDue
            }
            ArbiterState::Degraded { retry_at: None } | ArbiterState::Idle => {
                std::future::pending().await
            }
        }
    }

    /// Apply one event
    ///
    /// # Errors
    ///
    /// Returns the error carried by a contract-violating listening failure
    pub async fn handle(&mut self, event: ArbiterEvent) -> Result<()> {
        match event {
            ArbiterEvent::WakeWord(detection) => self.on_wake(detection).await,
            ArbiterEvent::ListeningFailed(error) => return self.on_listening_failed(error),
            ArbiterEvent::InteractionClosed(outcome) => self.on_interaction_closed(&outcome),
            ArbiterEvent::RetryDue => self.on_retry_due(),
        }
        Ok(())
    }

    async fn on_wake(&mut self, detection: Detection) {
        let ArbiterState::Listening(session) = &mut self.state else {
            tracing::warn!(
                keyword_index = detection.keyword_index,
                "wake word outside listening, ignored"
            );
            return;
        };

        self.wake_events += 1;
        tracing::info!(
            session = session.id(),
            keyword_index = detection.keyword_index,
            frame = detection.frame,
            "wake word, handing off to interaction"
        );

        // The microphone must be free before the surface asks for it
        session.stop();

        let (closed_tx, closed_rx) = oneshot::channel();
        self.state = ArbiterState::Interacting(closed_rx);
        self.publish(ArbiterStatus::Interacting);

        if let Err(e) = self.surface.open(closed_tx).await {
            tracing::warn!(error = %e, "failed to open interaction, resuming listening");
            self.start_listening();
        }
    }

    fn on_interaction_closed(&mut self, outcome: &InteractionClosed) {
        if !matches!(self.state, ArbiterState::Interacting(_)) {
            tracing::warn!(?outcome, "interaction close outside interaction, ignored");
            return;
        }

        tracing::info!(?outcome, "interaction closed, resuming listening");
        self.start_listening();
    }

    fn on_listening_failed(&mut self, error: Error) -> Result<()> {
        if let ArbiterState::Listening(session) = &mut self.state {
            session.stop();
        }

        if error.is_contract_violation() {
            self.state = ArbiterState::Degraded { retry_at: None };
            self.publish(ArbiterStatus::Degraded {
                reason: error.to_string(),
                retry_in: None,
            });
            return Err(error);
        }

        tracing::warn!(error = %error, "listening ended");
        self.degrade(&error);
        Ok(())
    }

    fn on_retry_due(&mut self) {
        if matches!(self.state, ArbiterState::Degraded { .. }) {
            tracing::info!(attempt = self.failures + 1, "retrying listening");
            self.start_listening();
        }
    }

    /// Build and start a fresh session, or degrade
    fn start_listening(&mut self) {
        // Drop any previous session or close receiver first
        self.state = ArbiterState::Idle;

        self.next_session_id += 1;
        let mut session = ListeningSession::new(self.next_session_id, self.ctx.clone());

        match session.start() {
            Ok(()) => {
                self.failures = 0;
                self.sessions_started += 1;
                self.publish(ArbiterStatus::Listening {
                    session: session.id(),
                });
                self.state = ArbiterState::Listening(session);
            }
            Err(e) => self.degrade(&e),
        }
    }

    fn degrade(&mut self, error: &Error) {
        self.failures = self.failures.saturating_add(1);

        let retry_in = if error.is_retryable() {
            self.retry.delay(self.failures)
        } else {
            None
        };

        match retry_in {
            Some(delay) => tracing::warn!(
                error = %error,
                attempt = self.failures,
                retry_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "listening unavailable, retry scheduled"
            ),
            None => tracing::error!(
                error = %error,
                attempts = self.failures,
                "listening unavailable, not retrying"
            ),
        }

        self.state = ArbiterState::Degraded {
            retry_at: retry_in.map(|delay| Instant::now() + delay),
        };
        self.publish(ArbiterStatus::Degraded {
            reason: error.to_string(),
            retry_in,
        });
    }

    /// Stop whatever is active and go idle
    pub fn shutdown(&mut self) {
        if let ArbiterState::Listening(session) = &mut self.state {
            session.stop();
        }
        self.state = ArbiterState::Idle;
        self.publish(ArbiterStatus::Idle);
    }

    fn publish(&self, status: ArbiterStatus) {
        tracing::debug!(?status, "arbiter status");
        self.status.send_replace(status);
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ArbiterStatus> {
        self.status.subscribe()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> ArbiterStatus {
        self.status.borrow().clone()
    }

    /// Sessions that reached active
    #[must_use]
    pub const fn sessions_started(&self) -> u64 {
        self.sessions_started
    }

    /// Wake words acted upon
    #[must_use]
    pub const fn wake_events(&self) -> u64 {
        self.wake_events
    }
}

impl Drop for SessionArbiter {
    fn drop(&mut self) {
        if let ArbiterState::Listening(session) = &mut self.state {
            session.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_double_until_capped() {
        let policy = RetryPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            max_attempts: 5,
        };

        let delays: Vec<_> = (1..=5).filter_map(|n| policy.delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn test_retry_exhausted() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), None);
        assert!(policy.delay(policy.max_attempts).is_some());
        assert_eq!(policy.delay(policy.max_attempts + 1), None);
    }

    #[test]
    fn test_retry_large_attempt_saturates() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: u32::MAX,
        };
        assert_eq!(policy.delay(64), Some(Duration::from_secs(30)));
    }
}

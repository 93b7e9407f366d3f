//! Daemon - the assistant service
//!
//! Takes the instance lock, wires the listening pipeline to the interaction
//! surface through the arbiter, and runs until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::arbiter::{ArbiterStatus, RetryPolicy, SessionArbiter};
use crate::config::state_dir;
use crate::instance::InstanceLock;
use crate::interaction::InteractionSurface;
use crate::voice::{EngineFactory, SessionContext};
use crate::Result;

/// The Hearken daemon
pub struct Daemon {
    ctx: SessionContext,
    surface: Box<dyn InteractionSurface>,
    retry: RetryPolicy,
    lock_dir: PathBuf,
}

impl Daemon {
    /// Create a daemon locking the standard state directory
    #[must_use]
    pub fn new(
        ctx: SessionContext,
        surface: Box<dyn InteractionSurface>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ctx,
            surface,
            retry,
            lock_dir: state_dir(),
        }
    }

    /// Lock a different directory
    #[must_use]
    pub fn with_lock_dir(mut self, dir: PathBuf) -> Self {
        self.lock_dir = dir;
        self
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if another instance is running or the arbiter aborts
    pub async fn run(self) -> Result<()> {
        // Set up shutdown signal
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });

        self.run_until(&mut shutdown_rx).await
    }

    /// Run until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns error if another instance is running or the arbiter aborts
    pub async fn run_until(self, shutdown: &mut mpsc::Receiver<()>) -> Result<()> {
        let _lock = InstanceLock::acquire(&self.lock_dir)?;

        tracing::info!(
            device = %self.ctx.device,
            keywords = self.ctx.wake.keyword_paths.len(),
            "daemon running"
        );

        let mut arbiter = SessionArbiter::new(self.ctx, self.surface, self.retry);
        let reporter = tokio::spawn(report_status(arbiter.subscribe()));

        let result = arbiter.run(shutdown).await;

        // Dropping the arbiter closes the status channel and ends the reporter
        drop(arbiter);
        if let Err(e) = reporter.await {
            tracing::debug!(error = %e, "status reporter ended abnormally");
        }

        tracing::info!("daemon stopped");
        result
    }
}

/// Log status changes and surface degraded states to the operator
async fn report_status(mut status: watch::Receiver<ArbiterStatus>) {
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        match current {
            ArbiterStatus::Idle => tracing::debug!("idle"),
            ArbiterStatus::Listening { session } => {
                tracing::info!(session, "listening for wake word");
            }
            ArbiterStatus::Interacting => tracing::info!("interaction open"),
            ArbiterStatus::Degraded { reason, retry_in } => match retry_in {
                Some(delay) => eprintln!(
                    "hearken: listening unavailable ({reason}); retrying in {}s",
                    delay.as_secs_f32()
                ),
                None => eprintln!("hearken: listening unavailable ({reason}); not retrying"),
            },
        }
    }
}

/// The wake word engine compiled into this build
///
/// # Errors
///
/// Returns `ModelLoad` when built without an engine
#[cfg(feature = "openwakeword")]
pub fn default_engine_factory() -> Result<Arc<dyn EngineFactory>> {
    Ok(Arc::new(crate::voice::OpenWakeWordFactory))
}

/// The wake word engine compiled into this build
///
/// # Errors
///
/// Returns `ModelLoad` when built without an engine
#[cfg(not(feature = "openwakeword"))]
pub fn default_engine_factory() -> Result<Arc<dyn EngineFactory>> {
    Err(crate::Error::ModelLoad(
        "no wake word engine in this build; rebuild with `--features openwakeword`"
            .to_string(),
    ))
}

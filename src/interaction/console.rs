//! Terminal interaction surface
//!
//! Prints the assistant's turns and reads the user's from a line-oriented
//! input. The input reader is shared across interactions so buffered lines
//! are never lost between them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{Mutex, oneshot};

use super::{Conversation, InteractionClosed, InteractionSettings, InteractionSurface, RemoteModel};
use crate::{Error, Result};

/// Console surface over stdin and stdout
pub type StdioSurface = ConsoleSurface<BufReader<tokio::io::Stdin>, tokio::io::Stdout>;

/// Line-based interaction surface
pub struct ConsoleSurface<R, W> {
    model: Arc<dyn RemoteModel>,
    input: Arc<Mutex<Lines<R>>>,
    output: Arc<Mutex<W>>,
    settings: InteractionSettings,
}

impl StdioSurface {
    /// Surface reading stdin and writing stdout
    #[must_use]
    pub fn stdio(model: Arc<dyn RemoteModel>, settings: InteractionSettings) -> Self {
        Self::new(
            model,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            settings,
        )
    }
}

impl<R, W> ConsoleSurface<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Surface over an arbitrary reader and writer
    #[must_use]
    pub fn new(
        model: Arc<dyn RemoteModel>,
        input: R,
        output: W,
        settings: InteractionSettings,
    ) -> Self {
        Self {
            model,
            input: Arc::new(Mutex::new(input.lines())),
            output: Arc::new(Mutex::new(output)),
            settings,
        }
    }

    /// Shared handle to the output, for inspection
    #[must_use]
    pub fn output(&self) -> Arc<Mutex<W>> {
        Arc::clone(&self.output)
    }
}

#[async_trait]
impl<R, W> InteractionSurface for ConsoleSurface<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn open(&mut self, closed: oneshot::Sender<InteractionClosed>) -> Result<()> {
        // A previous interaction still holding the input means it never closed
        let input = Arc::clone(&self.input)
            .try_lock_owned()
            .map_err(|_| Error::InvalidState("an interaction is already open".to_string()))?;

        let model = Arc::clone(&self.model);
        let output = Arc::clone(&self.output);
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let outcome = converse(model.as_ref(), input, &output, &settings).await;
            tracing::info!(?outcome, "interaction closed");
            if closed.send(outcome).is_err() {
                tracing::debug!("interaction close went unobserved");
            }
        });

        Ok(())
    }
}

async fn converse<R, W>(
    model: &dyn RemoteModel,
    mut input: tokio::sync::OwnedMutexGuard<Lines<R>>,
    output: &Mutex<W>,
    settings: &InteractionSettings,
) -> InteractionClosed
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut conversation = Conversation::with_greeting(&settings.greeting);
    if let Err(e) = say(output, &settings.greeting).await {
        return InteractionClosed::Failed(e.to_string());
    }

    loop {
        let line = match tokio::time::timeout(settings.inactivity_timeout, input.next_line()).await
        {
            Err(_) => return InteractionClosed::TimedOut,
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return InteractionClosed::Completed,
            Ok(Err(e)) => return InteractionClosed::Failed(e.to_string()),
        };

        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        tracing::debug!(chars = text.len(), "user turn");
        conversation.push_user(text);

        let reply = match model.generate(conversation.turns()).await {
            Ok(reply) => {
                conversation.push_model(&reply);
                reply
            }
            Err(e) => {
                tracing::warn!(error = %e, "remote model failed");
                settings.error_reply.clone()
            }
        };

        if let Err(e) = say(output, &reply).await {
            return InteractionClosed::Failed(e.to_string());
        }
    }
}

async fn say<W: AsyncWrite + Unpin>(output: &Mutex<W>, text: &str) -> std::io::Result<()> {
    let mut output = output.lock().await;
    output.write_all(format!("assistant: {text}\n").as_bytes()).await?;
    output.flush().await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::interaction::{Role, Turn};

    /// Echoes the last user turn, or fails when asked to
    struct EchoModel {
        seen: StdMutex<Vec<Vec<Turn>>>,
    }

    #[async_trait]
    impl RemoteModel for EchoModel {
        async fn generate(&self, turns: &[Turn]) -> Result<String> {
            self.seen.lock().unwrap().push(turns.to_vec());
            let last = turns.last().map(|t| t.text.clone()).unwrap_or_default();
            if last == "fail" {
                return Err(Error::Remote("boom".to_string()));
            }
            Ok(format!("echo {last}"))
        }
    }

    fn settings() -> InteractionSettings {
        InteractionSettings {
            inactivity_timeout: Duration::from_millis(200),
            ..InteractionSettings::default()
        }
    }

    #[tokio::test]
    async fn test_conversation_until_end_of_input() {
        let model = Arc::new(EchoModel {
            seen: StdMutex::new(Vec::new()),
        });
        let input: &'static [u8] = b"hello\n\nfail\nbye\n";
        let mut surface = ConsoleSurface::new(model.clone(), input, Vec::new(), settings());

        let (tx, rx) = oneshot::channel();
        surface.open(tx).await.unwrap();
        assert_eq!(rx.await.unwrap(), InteractionClosed::Completed);

        let output = surface.output();
        let text = String::from_utf8(output.lock().await.clone()).unwrap();
        assert_eq!(
            text,
            "assistant: Hello! How can I help you?\n\
             assistant: echo hello\n\
             assistant: I'm sorry, I encountered an error. Please try again later.\n\
             assistant: echo bye\n"
        );

        // The failed turn's reply is not recorded
        let seen = model.seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last[0].role, Role::Model);
        let roles: Vec<Role> = last.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::Model, Role::User, Role::Model, Role::User, Role::User]
        );
    }

    #[tokio::test]
    async fn test_inactivity_times_out() {
        let model = Arc::new(EchoModel {
            seen: StdMutex::new(Vec::new()),
        });
        // Keep the write half alive so the read never reaches end of input
        let (_writer, reader) = tokio::io::duplex(64);
        let mut surface =
            ConsoleSurface::new(model, BufReader::new(reader), Vec::new(), settings());

        let (tx, rx) = oneshot::channel();
        surface.open(tx).await.unwrap();
        assert_eq!(rx.await.unwrap(), InteractionClosed::TimedOut);
    }

    #[tokio::test]
    async fn test_second_open_while_open_is_rejected() {
        let model = Arc::new(EchoModel {
            seen: StdMutex::new(Vec::new()),
        });
        let (_writer, reader) = tokio::io::duplex(64);
        let mut surface = ConsoleSurface::new(
            model,
            BufReader::new(reader),
            Vec::new(),
            InteractionSettings {
                inactivity_timeout: Duration::from_secs(5),
                ..InteractionSettings::default()
            },
        );

        let (tx, _rx) = oneshot::channel();
        surface.open(tx).await.unwrap();
        // Let the spawned interaction take the input
        tokio::task::yield_now().await;

        let (tx, _rx2) = oneshot::channel();
        assert!(matches!(
            surface.open(tx).await,
            Err(Error::InvalidState(_))
        ));
    }
}

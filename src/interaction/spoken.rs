//! Spoken interaction surface
//!
//! Takes the microphone once listening has released it, transcribes each
//! utterance and speaks the model's replies. Audio captured while the
//! assistant is talking is discarded so it never hears itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::{Conversation, InteractionClosed, InteractionSettings, InteractionSurface, RemoteModel};
use crate::voice::{
    CaptureConfig, CaptureEvent, Endpoint, EndpointSettings, Endpointer, MicrophoneBackend,
    Speaker, Transcriber, samples_to_wav,
};
use crate::{Error, Result};

/// Speech input and output for a [`SpokenSurface`]
#[derive(Clone)]
pub struct SpeechIo {
    /// Utterance recognition
    pub transcriber: Arc<dyn Transcriber>,
    /// Reply synthesis and playback
    pub speaker: Arc<dyn Speaker>,
}

/// Voice conversation over the microphone and speakers
pub struct SpokenSurface {
    microphone: Arc<dyn MicrophoneBackend>,
    capture: CaptureConfig,
    speech: SpeechIo,
    model: Arc<dyn RemoteModel>,
    settings: InteractionSettings,
    endpointing: EndpointSettings,
    busy: Arc<AtomicBool>,
}

impl SpokenSurface {
    /// Surface capturing with `capture` from `microphone`
    #[must_use]
    pub fn new(
        microphone: Arc<dyn MicrophoneBackend>,
        capture: CaptureConfig,
        speech: SpeechIo,
        model: Arc<dyn RemoteModel>,
        settings: InteractionSettings,
        endpointing: EndpointSettings,
    ) -> Self {
        Self {
            microphone,
            capture,
            speech,
            model,
            settings,
            endpointing,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Clears the busy flag when an interaction ends
struct Busy(Arc<AtomicBool>);

impl Drop for Busy {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[async_trait]
impl InteractionSurface for SpokenSurface {
    async fn open(&mut self, closed: oneshot::Sender<InteractionClosed>) -> Result<()> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidState("an interaction is already open".to_string()));
        }
        let busy = Busy(Arc::clone(&self.busy));

        let (mut handle, mut events) = self.microphone.open(&self.capture)?;
        tracing::debug!(device = %self.capture.device, "spoken interaction listening");

        let dialogue = Dialogue {
            speech: self.speech.clone(),
            model: Arc::clone(&self.model),
            settings: self.settings.clone(),
            endpointing: self.endpointing.clone(),
            sample_rate: self.capture.sample_rate,
        };

        tokio::spawn(async move {
            let outcome = dialogue.converse(&mut events).await;

            // Listening may only restart once the microphone is free
            handle.close();
            drop(events);
            drop(busy);

            tracing::info!(?outcome, "interaction closed");
            if closed.send(outcome).is_err() {
                tracing::debug!("interaction close went unobserved");
            }
        });

        Ok(())
    }
}

/// One open interaction
struct Dialogue {
    speech: SpeechIo,
    model: Arc<dyn RemoteModel>,
    settings: InteractionSettings,
    endpointing: EndpointSettings,
    sample_rate: u32,
}

impl Dialogue {
    async fn converse(&self, events: &mut mpsc::Receiver<CaptureEvent>) -> InteractionClosed {
        let mut conversation = Conversation::with_greeting(&self.settings.greeting);
        let mut endpointer = Endpointer::new(&self.endpointing, self.sample_rate);

        self.say(&self.settings.greeting).await;
        if let Err(closed) = discard_pending(events) {
            return closed;
        }

        loop {
            endpointer.reset();
            let samples =
                match next_utterance(events, &mut endpointer, self.settings.inactivity_timeout)
                    .await
                {
                    Ok(samples) => samples,
                    Err(closed) => return closed,
                };

            let text = match self.transcribe(&samples).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "speech recognition failed");
                    return InteractionClosed::Failed(e.to_string());
                }
            };
            let text = text.trim();
            if text.is_empty() {
                tracing::debug!("nothing recognized");
                continue;
            }

            tracing::debug!(chars = text.len(), "user turn");
            conversation.push_user(text);

            let reply = match self.model.generate(conversation.turns()).await {
                Ok(reply) => {
                    conversation.push_model(&reply);
                    reply
                }
                Err(e) => {
                    tracing::warn!(error = %e, "remote model failed");
                    self.settings.error_reply.clone()
                }
            };

            self.say(&reply).await;
            if let Err(closed) = discard_pending(events) {
                return closed;
            }
        }
    }

    async fn transcribe(&self, samples: &[i16]) -> Result<String> {
        let wav = samples_to_wav(samples, self.sample_rate)?;
        self.speech.transcriber.transcribe(&wav).await
    }

    async fn say(&self, text: &str) {
        if let Err(e) = self.speech.speaker.speak(text).await {
            tracing::warn!(error = %e, "speech output failed");
        }
    }
}

/// Wait for the next complete utterance
///
/// The inactivity timeout covers the wait for speech to start; once the user
/// is talking the endpointer decides when the utterance ends.
async fn next_utterance(
    events: &mut mpsc::Receiver<CaptureEvent>,
    endpointer: &mut Endpointer,
    inactivity: Duration,
) -> std::result::Result<Vec<i16>, InteractionClosed> {
    let deadline = Instant::now() + inactivity;

    loop {
        let event = if endpointer.is_speaking() {
            events.recv().await
        } else {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(event) => event,
                Err(_) => return Err(InteractionClosed::TimedOut),
            }
        };

        match event {
            Some(CaptureEvent::Chunk(chunk)) => {
                if let Endpoint::Complete(samples) = endpointer.push(&chunk.to_samples()) {
                    return Ok(samples);
                }
            }
            Some(CaptureEvent::DeviceLost(reason)) => return Err(microphone_lost(&reason)),
            None => return Err(microphone_lost("capture ended")),
        }
    }
}

/// Drop audio captured while the assistant was talking
fn discard_pending(
    events: &mut mpsc::Receiver<CaptureEvent>,
) -> std::result::Result<(), InteractionClosed> {
    let mut discarded = 0;
    loop {
        match events.try_recv() {
            Ok(CaptureEvent::Chunk(_)) => discarded += 1,
            Ok(CaptureEvent::DeviceLost(reason)) => return Err(microphone_lost(&reason)),
            Err(mpsc::error::TryRecvError::Empty) => break,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return Err(microphone_lost("capture ended"));
            }
        }
    }
    if discarded > 0 {
        tracing::trace!(chunks = discarded, "discarded audio captured during speech");
    }
    Ok(())
}

fn microphone_lost(reason: &str) -> InteractionClosed {
    tracing::warn!(reason, "microphone lost during interaction");
    InteractionClosed::Failed(format!("microphone lost: {reason}"))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::interaction::{Role, Turn};
    use crate::voice::{AudioChunk, CaptureHandle};

    type Log = Arc<StdMutex<Vec<String>>>;

    fn record(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    /// Microphone whose capture the test feeds through `feeder`
    struct TestMic {
        log: Log,
        feeder: Arc<StdMutex<Option<mpsc::Sender<CaptureEvent>>>>,
        unavailable: AtomicBool,
    }

    struct TestHandle {
        log: Log,
        feeder: Arc<StdMutex<Option<mpsc::Sender<CaptureEvent>>>>,
        open: bool,
    }

    impl MicrophoneBackend for TestMic {
        fn open(
            &self,
            config: &CaptureConfig,
        ) -> Result<(Box<dyn CaptureHandle>, mpsc::Receiver<CaptureEvent>)> {
            if self.unavailable.swap(false, Ordering::SeqCst) {
                return Err(Error::DeviceUnavailable("microphone is in use".to_string()));
            }
            let (tx, rx) = mpsc::channel(config.chunk_capacity);
            *self.feeder.lock().unwrap() = Some(tx);
            record(&self.log, "mic open");
            Ok((
                Box::new(TestHandle {
                    log: Arc::clone(&self.log),
                    feeder: Arc::clone(&self.feeder),
                    open: true,
                }),
                rx,
            ))
        }
    }

    impl CaptureHandle for TestHandle {
        fn close(&mut self) {
            if self.open {
                self.open = false;
                self.feeder.lock().unwrap().take();
                record(&self.log, "mic close");
            }
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    /// Hears each spoken line, then lets the user say the next scripted thing
    struct TestSpeaker {
        log: Log,
        feeder: Arc<StdMutex<Option<mpsc::Sender<CaptureEvent>>>>,
        answers: StdMutex<VecDeque<Vec<CaptureEvent>>>,
    }

    #[async_trait]
    impl Speaker for TestSpeaker {
        async fn speak(&self, text: &str) -> Result<()> {
            record(&self.log, format!("say {text}"));
            let answer = self.answers.lock().unwrap().pop_front();
            let feeder = self.feeder.lock().unwrap().clone();
            if let (Some(events), Some(feeder)) = (answer, feeder) {
                // Runs once the surface waits for input again
                tokio::spawn(async move {
                    for event in events {
                        let _ = feeder.send(event).await;
                    }
                });
            }
            Ok(())
        }
    }

    struct TestTranscriber {
        log: Log,
        texts: StdMutex<VecDeque<Result<String>>>,
    }

    #[async_trait]
    impl Transcriber for TestTranscriber {
        async fn transcribe(&self, wav: &[u8]) -> Result<String> {
            assert_eq!(&wav[0..4], b"RIFF");
            record(&self.log, "transcribe");
            self.texts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

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

    struct Rig {
        log: Log,
        mic: Arc<TestMic>,
        model: Arc<EchoModel>,
        surface: SpokenSurface,
    }

    fn rig(answers: Vec<Vec<CaptureEvent>>, texts: Vec<Result<String>>) -> Rig {
        let log: Log = Arc::default();
        let feeder = Arc::new(StdMutex::new(None));
        let mic = Arc::new(TestMic {
            log: Arc::clone(&log),
            feeder: Arc::clone(&feeder),
            unavailable: AtomicBool::new(false),
        });
        let speech = SpeechIo {
            transcriber: Arc::new(TestTranscriber {
                log: Arc::clone(&log),
                texts: StdMutex::new(texts.into()),
            }),
            speaker: Arc::new(TestSpeaker {
                log: Arc::clone(&log),
                feeder,
                answers: StdMutex::new(answers.into()),
            }),
        };
        let model = Arc::new(EchoModel {
            seen: StdMutex::new(Vec::new()),
        });
        let surface = SpokenSurface::new(
            mic.clone(),
            CaptureConfig::default(),
            speech,
            model.clone(),
            InteractionSettings {
                inactivity_timeout: Duration::from_millis(200),
                ..InteractionSettings::default()
            },
            EndpointSettings::default(),
        );
        Rig {
            log,
            mic,
            model,
            surface,
        }
    }

    /// Half a second of speech followed by enough silence to end it
    fn utterance() -> Vec<CaptureEvent> {
        let loud = CaptureEvent::Chunk(AudioChunk::from_samples(&[8000; 1600]));
        let quiet = CaptureEvent::Chunk(AudioChunk::from_samples(&[0; 1600]));
        let mut events = vec![loud; 5];
        events.extend(std::iter::repeat_n(quiet, 6));
        events
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_spoken_turns_until_silence() {
        let mut rig = rig(
            vec![utterance(), utterance()],
            vec![Ok("what time is it".to_string()), Ok("fail".to_string())],
        );

        let (tx, rx) = oneshot::channel();
        rig.surface.open(tx).await.unwrap();
        assert_eq!(rx.await.unwrap(), InteractionClosed::TimedOut);

        assert_eq!(
            entries(&rig.log),
            vec![
                "mic open",
                "say Hello! How can I help you?",
                "transcribe",
                "say echo what time is it",
                "transcribe",
                "say I'm sorry, I encountered an error. Please try again later.",
                "mic close",
            ]
        );

        // The failed turn's reply is not recorded
        let seen = rig.model.seen.lock().unwrap();
        let roles: Vec<Role> = seen.last().unwrap().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::Model, Role::User, Role::Model, Role::User]);
    }

    #[tokio::test]
    async fn test_empty_transcript_is_skipped() {
        let mut rig = rig(vec![utterance()], vec![Ok("  ".to_string())]);

        let (tx, rx) = oneshot::channel();
        rig.surface.open(tx).await.unwrap();
        assert_eq!(rx.await.unwrap(), InteractionClosed::TimedOut);

        assert!(rig.model.seen.lock().unwrap().is_empty());
        assert_eq!(entries(&rig.log).last().unwrap(), "mic close");
    }

    #[tokio::test]
    async fn test_recognition_failure_closes_interaction() {
        let mut rig = rig(
            vec![utterance()],
            vec![Err(Error::Stt("service unavailable".to_string()))],
        );

        let (tx, rx) = oneshot::channel();
        rig.surface.open(tx).await.unwrap();
        assert!(matches!(rx.await.unwrap(), InteractionClosed::Failed(_)));
        assert_eq!(entries(&rig.log).last().unwrap(), "mic close");
    }

    #[tokio::test]
    async fn test_lost_microphone_fails_interaction() {
        let mut rig = rig(
            vec![vec![CaptureEvent::DeviceLost("unplugged".to_string())]],
            Vec::new(),
        );

        let (tx, rx) = oneshot::channel();
        rig.surface.open(tx).await.unwrap();
        assert_eq!(
            rx.await.unwrap(),
            InteractionClosed::Failed("microphone lost: unplugged".to_string())
        );
        assert_eq!(entries(&rig.log).last().unwrap(), "mic close");
    }

    #[tokio::test]
    async fn test_second_open_while_open_is_rejected() {
        let mut rig = rig(Vec::new(), Vec::new());
        rig.surface.settings.inactivity_timeout = Duration::from_secs(5);

        let (tx, _rx) = oneshot::channel();
        rig.surface.open(tx).await.unwrap();

        let (tx, _rx2) = oneshot::channel();
        assert!(matches!(
            rig.surface.open(tx).await,
            Err(Error::InvalidState(_))
        ));
        assert_eq!(
            entries(&rig.log).iter().filter(|e| *e == "mic open").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_unavailable_microphone_fails_open() {
        let mut rig = rig(Vec::new(), Vec::new());
        rig.mic.unavailable.store(true, Ordering::SeqCst);

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            rig.surface.open(tx).await,
            Err(Error::DeviceUnavailable(_))
        ));

        // The failed open leaves the surface usable
        let (tx, rx) = oneshot::channel();
        rig.surface.open(tx).await.unwrap();
        assert_eq!(rx.await.unwrap(), InteractionClosed::TimedOut);
    }
}

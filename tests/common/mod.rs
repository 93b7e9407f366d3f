//! Shared test utilities
//!
//! In-memory stand-ins for the microphone, the wake word engine and the
//! interaction surface. All of them write to one [`Journal`] so tests can
//! check the order in which resources were acquired and released.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hearken::interaction::{InteractionClosed, InteractionSurface};
use hearken::voice::{
    AudioChunk, CaptureConfig, CaptureEvent, CaptureHandle, DeviceSelector, EngineFactory,
    FrameSpec, MicrophoneBackend, SessionContext, WakeSettings, WakeWordEngine,
};
use hearken::{Error, Result};
use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot};

/// Samples per frame used by the scripted engine
pub const FRAME_LENGTH: usize = 4;

/// Ordered record of resource events
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: &str) {
        self.0.lock().unwrap().push(entry.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

#[derive(Default)]
struct MicState {
    held: bool,
    opens: usize,
    closes: usize,
    refused: usize,
    fail_opens: usize,
    feeder: Option<mpsc::Sender<CaptureEvent>>,
    on_open: VecDeque<CaptureEvent>,
}

/// Exclusive in-memory microphone
#[derive(Clone)]
pub struct MockMicrophone {
    state: Arc<Mutex<MicState>>,
    journal: Journal,
}

impl MockMicrophone {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Arc::new(Mutex::new(MicState::default())),
            journal,
        }
    }

    /// Make the next `n` opens fail with `DeviceUnavailable`
    pub fn fail_next_opens(&self, n: usize) {
        self.state.lock().unwrap().fail_opens = n;
    }

    /// Deliver `events` as soon as the next open succeeds
    pub fn queue_on_open(&self, events: Vec<CaptureEvent>) {
        self.state.lock().unwrap().on_open.extend(events);
    }

    /// Push an event into the open capture
    pub fn feed(&self, event: CaptureEvent) {
        let state = self.state.lock().unwrap();
        let feeder = state.feeder.as_ref().expect("microphone is not open");
        feeder.try_send(event).expect("chunk channel full");
    }

    pub fn feed_samples(&self, samples: &[i16]) {
        self.feed(CaptureEvent::Chunk(AudioChunk::from_samples(samples)));
    }

    /// Claim the device for something other than a capture
    pub fn claim(&self, who: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.held {
            state.refused += 1;
            self.journal.record(&format!("{who} refused mic"));
            return Err(Error::DeviceUnavailable("microphone is in use".to_string()));
        }
        state.held = true;
        self.journal.record(&format!("{who} claimed mic"));
        Ok(())
    }

    pub fn unclaim(&self, who: &str) {
        self.state.lock().unwrap().held = false;
        self.journal.record(&format!("{who} released mic"));
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().unwrap().held
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn refused(&self) -> usize {
        self.state.lock().unwrap().refused
    }
}

impl MicrophoneBackend for MockMicrophone {
    fn open(
        &self,
        config: &CaptureConfig,
    ) -> Result<(Box<dyn CaptureHandle>, mpsc::Receiver<CaptureEvent>)> {
        let mut state = self.state.lock().unwrap();

        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            self.journal.record("mic open failed");
            return Err(Error::DeviceUnavailable("no such microphone".to_string()));
        }
        if state.held {
            state.refused += 1;
            self.journal.record("mic open refused");
            return Err(Error::DeviceUnavailable("microphone is in use".to_string()));
        }

        let (tx, rx) = mpsc::channel(config.chunk_capacity);
        for event in state.on_open.drain(..) {
            tx.try_send(event).expect("queued events exceed capacity");
        }

        state.held = true;
        state.opens += 1;
        state.feeder = Some(tx);
        self.journal.record("mic open");

        Ok((
            Box::new(MockHandle {
                state: Arc::clone(&self.state),
                journal: self.journal.clone(),
                open: true,
            }),
            rx,
        ))
    }
}

struct MockHandle {
    state: Arc<Mutex<MicState>>,
    journal: Journal,
    open: bool,
}

impl CaptureHandle for MockHandle {
    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let mut state = self.state.lock().unwrap();
        state.held = false;
        state.closes += 1;
        state.feeder = None;
        self.journal.record("mic close");
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Engine factory whose engines match on chosen frame indices
#[derive(Clone)]
pub struct ScriptedFactory {
    pub journal: Journal,
    pub matches: HashSet<u64>,
    pub created: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
    pub create_error: Option<fn() -> Error>,
    pub process_error_at: Option<(u64, fn() -> Error)>,
}

impl ScriptedFactory {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            matches: HashSet::new(),
            created: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
            create_error: None,
            process_error_at: None,
        }
    }

    pub fn matching_at(mut self, frames: &[u64]) -> Self {
        self.matches = frames.iter().copied().collect();
        self
    }

    pub fn failing_with(mut self, error: fn() -> Error) -> Self {
        self.create_error = Some(error);
        self
    }

    pub fn erroring_at(mut self, frame: u64, error: fn() -> Error) -> Self {
        self.process_error_at = Some((frame, error));
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl EngineFactory for ScriptedFactory {
    fn frame_spec(&self) -> FrameSpec {
        FrameSpec {
            sample_rate: 16_000,
            frame_length: FRAME_LENGTH,
        }
    }

    fn create(&self, _settings: &WakeSettings) -> Result<Box<dyn WakeWordEngine>> {
        if let Some(error) = self.create_error {
            self.journal.record("detector create failed");
            return Err(error());
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        self.journal.record("detector create");
        Ok(Box::new(ScriptedEngine {
            frame: 0,
            matches: self.matches.clone(),
            process_error_at: self.process_error_at,
            released: Arc::clone(&self.released),
            journal: self.journal.clone(),
        }))
    }
}

struct ScriptedEngine {
    frame: u64,
    matches: HashSet<u64>,
    process_error_at: Option<(u64, fn() -> Error)>,
    released: Arc<AtomicUsize>,
    journal: Journal,
}

impl WakeWordEngine for ScriptedEngine {
    fn process(&mut self, _frame: &[i16]) -> Result<i32> {
        let index = self.frame;
        self.frame += 1;

        if let Some((at, error)) = self.process_error_at
            && at == index
        {
            return Err(error());
        }

        Ok(if self.matches.contains(&index) { 0 } else { -1 })
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.journal.record("detector release");
    }
}

/// Interaction surface that needs the microphone while open
pub struct MockSurface {
    control: SurfaceControl,
}

/// Test-side handle to a [`MockSurface`]
#[derive(Clone)]
pub struct SurfaceControl {
    microphone: MockMicrophone,
    journal: Journal,
    closed: Arc<Mutex<Option<oneshot::Sender<InteractionClosed>>>>,
    opens: Arc<AtomicUsize>,
    fail_next: Arc<AtomicUsize>,
}

impl MockSurface {
    pub fn new(microphone: MockMicrophone, journal: Journal) -> (Self, SurfaceControl) {
        let control = SurfaceControl {
            microphone,
            journal,
            closed: Arc::new(Mutex::new(None)),
            opens: Arc::new(AtomicUsize::new(0)),
            fail_next: Arc::new(AtomicUsize::new(0)),
        };
        (
            Self {
                control: control.clone(),
            },
            control,
        )
    }
}

#[async_trait]
impl InteractionSurface for MockSurface {
    async fn open(&mut self, closed: oneshot::Sender<InteractionClosed>) -> Result<()> {
        let control = &self.control;
        control.journal.record("surface open");
        if control.fail_next.load(Ordering::SeqCst) > 0 {
            control.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::InvalidState("surface unavailable".to_string()));
        }
        control.microphone.claim("surface")?;
        control.opens.fetch_add(1, Ordering::SeqCst);
        *control.closed.lock().unwrap() = Some(closed);
        Ok(())
    }
}

impl SurfaceControl {
    /// End the open interaction
    pub fn close(&self, outcome: InteractionClosed) {
        let sender = self
            .closed
            .lock()
            .unwrap()
            .take()
            .expect("no interaction open");
        self.microphone.unclaim("surface");
        sender.send(outcome).expect("arbiter stopped listening for close");
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Make the next open fail
    pub fn fail_next_open(&self) {
        self.fail_next.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.closed.lock().unwrap().is_some()
    }
}

/// Detector settings accepted by the scripted engine
pub fn wake_settings() -> WakeSettings {
    WakeSettings {
        access_key: Some(SecretString::from("test-access-key".to_string())),
        keyword_paths: vec![PathBuf::from("hey_hearken.onnx")],
        sensitivities: vec![0.5],
        model_path: None,
    }
}

/// Session context over the mocks
pub fn context(microphone: &MockMicrophone, engines: &ScriptedFactory) -> SessionContext {
    SessionContext {
        microphone: Arc::new(microphone.clone()),
        engines: Arc::new(engines.clone()),
        wake: Arc::new(wake_settings()),
        device: DeviceSelector::Default,
        chunk_capacity: 64,
    }
}

/// `frames` frames of distinct samples, starting at frame `start`
pub fn frame_samples(start: usize, frames: usize) -> Vec<i16> {
    (start * FRAME_LENGTH..(start + frames) * FRAME_LENGTH)
        .map(|i| i16::try_from(i % 30_000).unwrap())
        .collect()
}

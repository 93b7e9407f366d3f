//! Audio capture from microphone
//!
//! A [`MicrophoneBackend`] opens the device and hands back a bounded channel
//! of [`CaptureEvent`]s plus a [`CaptureHandle`] that releases the device.
//! The cpal backend keeps each stream on its own thread because cpal streams
//! aren't `Send`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::{Error, Result};

/// Sample rate for wake word capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Bits per captured sample (signed, little-endian)
pub const BITS_PER_SAMPLE: u16 = 16;

/// Default capacity of the chunk channel
pub const DEFAULT_CHUNK_CAPACITY: usize = 64;

/// How often a pending device-loss notice rechecks for room
const LOSS_DELIVERY_POLL: Duration = Duration::from_millis(20);

/// An immutable block of raw little-endian i16 PCM bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    bytes: Vec<u8>,
}

impl AudioChunk {
    /// Wrap raw bytes
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Encode samples as little-endian bytes
    #[must_use]
    pub fn from_samples(samples: &[i16]) -> Self {
        Self {
            bytes: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
        }
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Byte length
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the chunk carries no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode whole samples; a trailing odd byte is ignored
    #[must_use]
    pub fn to_samples(&self) -> Vec<i16> {
        self.bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }
}

/// Which input device to open
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// The host's default input device
    #[default]
    Default,
    /// A device matched by name
    Named(String),
}

impl DeviceSelector {
    /// Parse a configured device name; `default` selects the host default
    ///
    /// # Errors
    ///
    /// Returns error if the name is blank
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::Config("microphone device name is empty".to_string()));
        }
        if trimmed.eq_ignore_ascii_case("default") {
            Ok(Self::Default)
        } else {
            Ok(Self::Named(trimmed.to_string()))
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

/// How to open the microphone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Device to open
    pub device: DeviceSelector,
    /// Samples per second
    pub sample_rate: u32,
    /// Channels delivered in each chunk (always mono today)
    pub channels: u16,
    /// Capacity of the bounded chunk channel
    pub chunk_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: DeviceSelector::Default,
            sample_rate: SAMPLE_RATE,
            channels: 1,
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
        }
    }
}

/// What an open microphone delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Raw PCM from the device
    Chunk(AudioChunk),
    /// The device went away; no more chunks follow
    DeviceLost(String),
}

/// Releases an open microphone
pub trait CaptureHandle: Send {
    /// Release the device; returns once it is closed. Idempotent.
    fn close(&mut self);

    /// Whether `close` has not yet run
    fn is_open(&self) -> bool;
}

/// Opens microphones
pub trait MicrophoneBackend: Send + Sync {
    /// Open the configured device exclusively
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no device matches or it is already held
    fn open(
        &self,
        config: &CaptureConfig,
    ) -> Result<(Box<dyn CaptureHandle>, mpsc::Receiver<CaptureEvent>)>;
}

/// An input device as reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDevice {
    /// Device name
    pub name: String,
    /// Whether this is the host default
    pub is_default: bool,
}

/// Pick the device matching `wanted`: exact (case-insensitive) first, then a
/// unique substring match
///
/// # Errors
///
/// Returns `DeviceUnavailable` if nothing matches or the match is ambiguous
pub fn select_device(names: &[String], wanted: &str) -> Result<usize> {
    let wanted_lower = wanted.to_lowercase();

    if let Some(index) = names.iter().position(|n| n.to_lowercase() == wanted_lower) {
        return Ok(index);
    }

    let partial: Vec<usize> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| n.to_lowercase().contains(&wanted_lower))
        .map(|(i, _)| i)
        .collect();

    match partial.as_slice() {
        [index] => Ok(*index),
        [] => Err(Error::DeviceUnavailable(format!(
            "no input device matches '{wanted}' (available: {})",
            names.join(", ")
        ))),
        many => Err(Error::DeviceUnavailable(format!(
            "'{wanted}' matches several input devices: {}",
            many.iter()
                .map(|&i| names[i].as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Microphone backend over the default cpal host
pub struct CpalMicrophone {
    in_use: Arc<AtomicBool>,
}

impl CpalMicrophone {
    /// Create a backend with no device held
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    /// List input devices on the default host
    ///
    /// # Errors
    ///
    /// Returns error if the host cannot enumerate devices
    pub fn list_devices() -> Result<Vec<InputDevice>> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let devices = host
            .input_devices()
            .map_err(|e| Error::Audio(e.to_string()))?;

        Ok(devices
            .filter_map(|d| d.name().ok())
            .map(|name| InputDevice {
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
            })
            .collect())
    }

    /// Resolve a selector to a concrete device name
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the selector matches nothing
    pub fn resolve(selector: &DeviceSelector) -> Result<String> {
        let device = resolve_device(selector)?;
        device.name().map_err(|e| Error::DeviceUnavailable(e.to_string()))
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl MicrophoneBackend for CpalMicrophone {
    fn open(
        &self,
        config: &CaptureConfig,
    ) -> Result<(Box<dyn CaptureHandle>, mpsc::Receiver<CaptureEvent>)> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::DeviceUnavailable(
                "microphone is already held by another capture".to_string(),
            ));
        }
        let claim = Claim(Arc::clone(&self.in_use));

        let (tx, rx) = mpsc::channel(config.chunk_capacity.max(1));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<String>>();
        let (signal_tx, signal_rx) = std::sync::mpsc::channel::<Signal>();

        let thread_config = config.clone();
        let stream_signals = signal_tx.clone();
        let thread = std::thread::Builder::new()
            .name("hearken-capture".to_string())
            .spawn(move || {
                capture_thread(&thread_config, tx, stream_signals, &ready_tx, &signal_rx);
            })
            .map_err(|e| Error::Audio(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(device_name)) => {
                tracing::debug!(
                    device = %device_name,
                    sample_rate = config.sample_rate,
                    "audio capture started"
                );
                Ok((
                    Box::new(CpalCaptureHandle {
                        device_name,
                        stop_tx: Some(signal_tx),
                        thread: Some(thread),
                        claim: Some(claim),
                    }),
                    rx,
                ))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio(
                    "capture thread exited during startup".to_string(),
                ))
            }
        }
    }
}

/// Wakes the capture thread
#[derive(Debug)]
enum Signal {
    /// The handle is releasing the device
    Stop,
    /// The stream reported an error; no more audio will arrive
    Lost(String),
}

/// Marks the backend's device as held until dropped
struct Claim(Arc<AtomicBool>);

impl Drop for Claim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to a running cpal capture thread
struct CpalCaptureHandle {
    device_name: String,
    stop_tx: Option<Sender<Signal>>,
    thread: Option<JoinHandle<()>>,
    claim: Option<Claim>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn close(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(Signal::Stop);
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!(device = %self.device_name, "capture thread panicked");
        }
        if self.claim.take().is_some() {
            tracing::debug!(device = %self.device_name, "audio capture stopped");
        }
    }

    fn is_open(&self) -> bool {
        self.claim.is_some()
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the cpal stream for the life of one capture
fn capture_thread(
    config: &CaptureConfig,
    tx: mpsc::Sender<CaptureEvent>,
    stream_signals: Sender<Signal>,
    ready_tx: &Sender<Result<String>>,
    signals: &Receiver<Signal>,
) {
    let lost_tx = tx.clone();
    let (stream, device_name) = match build_stream(config, tx, stream_signals) {
        Ok(built) => built,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(Error::DeviceUnavailable(e.to_string())));
        return;
    }

    if ready_tx.send(Ok(device_name)).is_err() {
        return;
    }

    hold_stream(stream, lost_tx, signals);
}

/// Keep `stream` alive until the handle stops it or the stream fails
///
/// On failure the stream is dropped first, taking the data callback's sender
/// with it, so the receiver sees `DeviceLost` and then the end of the channel.
fn hold_stream<S>(stream: S, lost_tx: mpsc::Sender<CaptureEvent>, signals: &Receiver<Signal>) {
    match signals.recv() {
        Ok(Signal::Lost(reason)) => {
            drop(stream);
            tracing::error!(%reason, "input stream failed");
            if !deliver_lost(&lost_tx, reason, signals) {
                tracing::debug!("device loss not delivered; capture already released");
            }
        }
        Ok(Signal::Stop) | Err(_) => drop(stream),
    }
    drop(lost_tx);
}

/// Queue `DeviceLost` behind any chunks still buffered
///
/// Waits for room rather than dropping the notice. Gives up if the handle
/// stops the capture or the receiver is gone.
fn deliver_lost(
    tx: &mpsc::Sender<CaptureEvent>,
    reason: String,
    signals: &Receiver<Signal>,
) -> bool {
    let mut event = CaptureEvent::DeviceLost(reason);
    loop {
        match tx.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(pending)) => {
                event = pending;
                match signals.recv_timeout(LOSS_DELIVERY_POLL) {
                    Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => return false,
                    Ok(Signal::Lost(_)) | Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }
}

fn resolve_device(selector: &DeviceSelector) -> Result<Device> {
    let host = cpal::default_host();

    match selector {
        DeviceSelector::Default => host.default_input_device().ok_or_else(|| {
            Error::DeviceUnavailable("no default input device available".to_string())
        }),
        DeviceSelector::Named(wanted) => {
            let devices: Vec<Device> = host
                .input_devices()
                .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
                .collect();
            let names: Vec<String> = devices
                .iter()
                .map(|d| d.name().unwrap_or_default())
                .collect();
            let index = select_device(&names, wanted)?;
            devices
                .into_iter()
                .nth(index)
                .ok_or_else(|| Error::DeviceUnavailable(wanted.clone()))
        }
    }
}

fn build_stream(
    config: &CaptureConfig,
    tx: mpsc::Sender<CaptureEvent>,
    signals: Sender<Signal>,
) -> Result<(Stream, String)> {
    let device = resolve_device(&config.device)?;
    let device_name = device.name().unwrap_or_else(|_| config.device.to_string());
    let rate = SampleRate(config.sample_rate);

    let ranges: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .collect();

    // Prefer a native mono config; otherwise down-mix
    let supported = ranges
        .iter()
        .find(|c| c.channels() == config.channels)
        .or_else(|| ranges.first())
        .cloned()
        .ok_or_else(|| {
            Error::DeviceUnavailable(format!(
                "'{device_name}' does not support {} Hz capture",
                config.sample_rate
            ))
        })?
        .with_sample_rate(rate);

    let format = supported.sample_format();
    let stream_config: StreamConfig = supported.config();
    let channels = usize::from(stream_config.channels.max(1));

    tracing::debug!(
        device = %device_name,
        ?format,
        channels,
        sample_rate = config.sample_rate,
        "audio capture initialized"
    );

    let target = InputTarget {
        channels,
        tx,
        signals,
    };

    #[allow(clippy::cast_possible_truncation)]
    let stream = match format {
        SampleFormat::I16 => build_input(&device, &stream_config, target, |s: i16| s),
        SampleFormat::F32 => build_input(&device, &stream_config, target, |s: f32| {
            (s.clamp(-1.0, 1.0) * 32767.0) as i16
        }),
        SampleFormat::U16 => build_input(&device, &stream_config, target, |s: u16| {
            (i32::from(s) - 32768) as i16
        }),
        other => Err(Error::DeviceUnavailable(format!(
            "unsupported sample format: {other:?}"
        ))),
    }?;

    Ok((stream, device_name))
}

/// Where a stream's callbacks deliver
struct InputTarget {
    channels: usize,
    tx: mpsc::Sender<CaptureEvent>,
    signals: Sender<Signal>,
}

fn build_input<T, F>(
    device: &Device,
    config: &StreamConfig,
    target: InputTarget,
    convert: F,
) -> Result<Stream>
where
    T: SizedSample,
    F: Fn(T) -> i16 + Send + 'static,
{
    let InputTarget {
        channels,
        tx,
        signals,
    } = target;
    let mut dropped: u64 = 0;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let chunk = interleaved_to_chunk(data, channels, &convert);
                if let Err(TrySendError::Full(_)) = tx.try_send(CaptureEvent::Chunk(chunk)) {
                    dropped += 1;
                    if dropped.is_power_of_two() {
                        tracing::warn!(dropped, "chunk channel full, dropping audio");
                    }
                }
            },
            move |err| {
                let reason = match err {
                    cpal::StreamError::DeviceNotAvailable => {
                        "input device disconnected".to_string()
                    }
                    other => other.to_string(),
                };
                let _ = signals.send(Signal::Lost(reason));
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))
}

/// Down-mix interleaved frames to mono and encode as i16 LE bytes
fn interleaved_to_chunk<T: Copy>(
    data: &[T],
    channels: usize,
    convert: impl Fn(T) -> i16,
) -> AudioChunk {
    if channels <= 1 {
        return AudioChunk::new(data.iter().flat_map(|&s| convert(s).to_le_bytes()).collect());
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let bytes = data
        .chunks_exact(channels)
        .flat_map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(convert(s))).sum();
            ((sum / channels as i32) as i16).to_le_bytes()
        })
        .collect();

    AudioChunk::new(bytes)
}

/// Convert i16 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!(DeviceSelector::parse("Default").unwrap(), DeviceSelector::Default);
        assert_eq!(
            DeviceSelector::parse(" Microphone ").unwrap(),
            DeviceSelector::Named("Microphone".to_string())
        );
        assert!(DeviceSelector::parse("   ").is_err());
    }

    #[test]
    fn test_select_device_exact_beats_substring() {
        let list = names(&["USB Microphone", "microphone", "HDMI"]);
        assert_eq!(select_device(&list, "Microphone").unwrap(), 1);
    }

    #[test]
    fn test_select_device_unique_substring() {
        let list = names(&["Built-in Audio", "USB Microphone (Yeti)"]);
        assert_eq!(select_device(&list, "yeti").unwrap(), 1);
    }

    #[test]
    fn test_select_device_missing_or_ambiguous() {
        let list = names(&["USB Microphone", "Headset Microphone"]);
        assert!(matches!(
            select_device(&list, "webcam"),
            Err(Error::DeviceUnavailable(_))
        ));
        assert!(matches!(
            select_device(&list, "microphone"),
            Err(Error::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_chunk_samples() {
        let chunk = AudioChunk::from_samples(&[1, -1, i16::MAX]);
        assert_eq!(chunk.len(), 6);
        assert_eq!(chunk.to_samples(), vec![1, -1, i16::MAX]);
    }

    #[test]
    fn test_downmix_stereo() {
        let chunk = interleaved_to_chunk(&[100_i16, 300, -50, -150], 2, |s| s);
        assert_eq!(chunk.to_samples(), vec![200, -100]);
    }

    fn chunk_event(sample: i16) -> CaptureEvent {
        CaptureEvent::Chunk(AudioChunk::from_samples(&[sample]))
    }

    #[test]
    fn test_stream_failure_with_full_channel_reports_loss_then_ends() {
        let (tx, mut rx) = mpsc::channel(2);
        let (signal_tx, signals) = std::sync::mpsc::channel();

        // Stands in for the stream: its data callback owns a sender
        let stream = tx.clone();
        stream.try_send(chunk_event(1)).unwrap();
        stream.try_send(chunk_event(2)).unwrap();
        signal_tx.send(Signal::Lost("stream error".to_string())).unwrap();

        let holder = std::thread::spawn(move || hold_stream(stream, tx, &signals));

        assert_eq!(rx.blocking_recv(), Some(chunk_event(1)));
        assert_eq!(rx.blocking_recv(), Some(chunk_event(2)));
        assert_eq!(
            rx.blocking_recv(),
            Some(CaptureEvent::DeviceLost("stream error".to_string()))
        );
        assert_eq!(rx.blocking_recv(), None);

        holder.join().unwrap();
        drop(signal_tx);
    }

    #[test]
    fn test_stop_abandons_pending_loss_notice() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(chunk_event(1)).unwrap();

        let (signal_tx, signals) = std::sync::mpsc::channel();
        signal_tx.send(Signal::Stop).unwrap();

        assert!(!deliver_lost(&tx, "gone".to_string(), &signals));
        drop(tx);
        assert_eq!(rx.blocking_recv(), Some(chunk_event(1)));
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn test_stop_releases_stream_without_notice() {
        let (tx, mut rx) = mpsc::channel(4);
        let (signal_tx, signals) = std::sync::mpsc::channel();
        signal_tx.send(Signal::Stop).unwrap();

        hold_stream(tx.clone(), tx, &signals);
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn test_samples_to_wav_header() {
        let wav = samples_to_wav(&[0, 1000, -1000], SAMPLE_RATE).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() >= 44 + 6);
    }
}

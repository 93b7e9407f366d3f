//! Audio playback to speakers

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Frames per resampler block
const RESAMPLE_CHUNK: usize = 1024;

/// Plays decoded speech on the default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct AudioPlayback;

impl AudioPlayback {
    /// Check that an output device exists
    ///
    /// # Errors
    ///
    /// Returns error if the host has no output device
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio playback initialized"
        );
        Ok(Self)
    }

    /// Decode MP3 bytes and play them to completion
    ///
    /// # Errors
    ///
    /// Returns error if decoding or playback fails
    pub async fn play_mp3(&self, mp3: Vec<u8>) -> Result<()> {
        tokio::task::spawn_blocking(move || {
            let (samples, sample_rate) = decode_mp3(&mp3)?;
            play_blocking(&samples, sample_rate)
        })
        .await
        .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }
}

fn audio_error(e: impl std::fmt::Display) -> Error {
    Error::Audio(e.to_string())
}

/// An f32 config at the device's preferred rate
fn output_config(device: &Device) -> Result<StreamConfig> {
    let preferred = device.default_output_config().map_err(audio_error)?;
    if preferred.sample_format() == SampleFormat::F32 {
        return Ok(preferred.config());
    }

    let rate = preferred.sample_rate();
    device
        .supported_output_configs()
        .map_err(audio_error)?
        .find(|c| {
            c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        })
        .map(|c| c.with_sample_rate(rate).config())
        .ok_or_else(|| Error::Audio("no f32 output config found".to_string()))
}

fn play_blocking(samples: &[f32], sample_rate: u32) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;
    let config = output_config(&device)?;
    let channels = usize::from(config.channels.max(1));
    let device_rate = config.sample_rate.0;

    let samples = Arc::new(resample(samples, sample_rate, device_rate)?);
    let finished = Arc::new(AtomicBool::new(false));

    let stream = {
        let samples = Arc::clone(&samples);
        let done = Arc::clone(&finished);
        let failed = Arc::clone(&finished);
        let mut position = 0;

        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(position).copied().unwrap_or_else(|| {
                            done.store(true, Ordering::Release);
                            0.0
                        });
                        frame.fill(sample);
                        position += 1;
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    failed.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(audio_error)?
    };

    stream.play().map_err(audio_error)?;

    let duration_ms = samples.len() as u64 * 1000 / u64::from(device_rate.max(1));
    let deadline = Instant::now() + Duration::from_millis(duration_ms + 500);
    while !finished.load(Ordering::Acquire) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    // Let the device drain its last buffer
    std::thread::sleep(Duration::from_millis(100));
    drop(stream);

    tracing::debug!(
        samples = samples.len(),
        sample_rate = device_rate,
        "playback complete"
    );
    Ok(())
}

/// Convert mono samples from `from_rate` to `to_rate`
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let expected = samples.len() * to_rate as usize / from_rate as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    // Zero-pad the last block and push one more so the filter delay flushes
    let mut blocks: Vec<Vec<f32>> = samples
        .chunks(RESAMPLE_CHUNK)
        .map(<[f32]>::to_vec)
        .collect();
    blocks.push(Vec::new());
    for mut block in blocks {
        block.resize(RESAMPLE_CHUNK, 0.0);
        let resampled = resampler
            .process(&[block], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&resampled[0]);
    }

    Ok(output.into_iter().skip(delay).take(expected).collect())
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
fn decode_mp3(mp3: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3));
    let mut samples = Vec::new();
    let mut sample_rate = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate.get_or_insert(frame.sample_rate);
                if frame.channels >= 2 {
                    samples.extend(frame.data.chunks(frame.channels).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = chunk.get(1).map_or(left, |&s| f32::from(s) / 32768.0);
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => {}
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    let sample_rate = match sample_rate {
        Some(rate) => u32::try_from(rate).map_err(audio_error)?,
        None => return Ok((Vec::new(), 0)),
    };
    Ok((samples, sample_rate))
}

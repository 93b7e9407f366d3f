use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hearken::config::{Config, SpeechConfig, SurfaceKind, file};
use hearken::daemon::{Daemon, default_engine_factory};
use hearken::interaction::{
    GeminiClient, InteractionSettings, InteractionSurface, RemoteModel, SpeechIo, SpokenSurface,
    StdioSurface,
};
use hearken::voice::{
    AudioPlayback, CaptureConfig, CaptureEvent, CpalMicrophone, DeviceSelector, MicrophoneBackend,
    SAMPLE_RATE, SessionContext, SpeechToText, TextToSpeech, VoiceOutput, check_credential,
    samples_to_wav,
};

/// Hearken - wake word voice assistant
#[derive(Parser)]
#[command(name = "hearken", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (default: ~/.config/hearken/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Microphone device name, or "default"
    #[arg(short, long, env = "HEARKEN_DEVICE")]
    device: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for the wake word and run the assistant (default)
    Run,
    /// List input devices
    ListDevices,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the capture as a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration and print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,hearken=info",
        1 => "info,hearken=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_assistant(config_path, cli.device.as_deref()).await,
        Command::ListDevices => list_devices(),
        Command::TestMic { duration, output } => {
            test_mic(config_path, cli.device.as_deref(), duration, output.as_deref()).await
        }
        Command::CheckConfig => check_config(config_path, cli.device.as_deref()),
    }
}

fn load_config(path: Option<&Path>, device: Option<&str>) -> anyhow::Result<Config> {
    let mut config = Config::load(path)?;
    if let Some(name) = device {
        config.audio.device = DeviceSelector::parse(name)?;
    }
    Ok(config)
}

async fn run_assistant(path: Option<&Path>, device: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(path, device)?;
    tracing::debug!(?config, "loaded configuration");

    let Config {
        wake,
        audio,
        llm,
        surface: surface_kind,
        interaction,
        speech,
        retry,
    } = config;

    // Resolve the device once up front so a bad name fails at startup
    let device_name = CpalMicrophone::resolve(&audio.device)?;
    tracing::info!(device = %device_name, "microphone resolved");

    let engines = default_engine_factory()?;
    if engines.requires_credential() {
        check_credential(&wake)?;
    }

    let microphone = Arc::new(CpalMicrophone::new());
    let model: Arc<dyn RemoteModel> = Arc::new(GeminiClient::new(llm)?);
    let capture = CaptureConfig {
        device: audio.device.clone(),
        sample_rate: SAMPLE_RATE,
        channels: 1,
        chunk_capacity: audio.chunk_capacity,
    };
    let surface: Box<dyn InteractionSurface> = match surface_kind {
        SurfaceKind::Voice => Box::new(spoken_surface(
            Arc::clone(&microphone) as Arc<dyn MicrophoneBackend>,
            capture,
            speech,
            model,
            interaction,
        )?),
        SurfaceKind::Console => Box::new(StdioSurface::stdio(model, interaction)),
    };

    let ctx = SessionContext {
        microphone,
        engines,
        wake: Arc::new(wake),
        device: audio.device,
        chunk_capacity: audio.chunk_capacity,
    };

    tracing::info!(surface = %surface_kind, "hearken ready - say the wake word; Ctrl-C to quit");

    Daemon::new(ctx, surface, retry).run().await?;

    Ok(())
}

/// Build the voice surface from the speech settings
fn spoken_surface(
    microphone: Arc<dyn MicrophoneBackend>,
    capture: CaptureConfig,
    speech: SpeechConfig,
    model: Arc<dyn RemoteModel>,
    interaction: InteractionSettings,
) -> anyhow::Result<SpokenSurface> {
    let api_key = speech.require_key()?;
    let transcriber = SpeechToText::new(api_key.clone(), &speech.base_url, speech.stt_model)?;
    let tts = TextToSpeech::new(
        api_key,
        &speech.base_url,
        speech.tts_model,
        speech.voice,
        speech.speed,
    )?;
    let speaker = VoiceOutput::new(tts, AudioPlayback::new()?);

    Ok(SpokenSurface::new(
        microphone,
        capture,
        SpeechIo {
            transcriber: Arc::new(transcriber),
            speaker: Arc::new(speaker),
        },
        model,
        interaction,
        speech.endpointing,
    ))
}

fn list_devices() -> anyhow::Result<()> {
    let devices = CpalMicrophone::list_devices()?;
    if devices.is_empty() {
        println!("No input devices found");
        return Ok(());
    }

    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("{}{marker}", device.name);
    }

    Ok(())
}

fn check_config(path: Option<&Path>, device: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(path, device)?;
    println!("{}", config.redacted_summary());

    if config.llm.api_key.is_none() {
        println!("\nwarning: GEMINI_API_KEY is not set; `run` will refuse to start");
    }
    if config.surface == SurfaceKind::Voice && config.speech.api_key.is_none() {
        println!("\nwarning: OPENAI_API_KEY is not set; the voice surface cannot start");
    }
    if let Ok(engines) = default_engine_factory()
        && engines.requires_credential()
        && let Err(e) = check_credential(&config.wake)
    {
        println!("\nwarning: {e}");
    }

    match CpalMicrophone::resolve(&config.audio.device) {
        Ok(name) => println!("\nmicrophone: {name}"),
        Err(e) => println!("\nmicrophone: {e}"),
    }

    Ok(())
}

/// Test microphone input
async fn test_mic(
    path: Option<&Path>,
    device: Option<&str>,
    duration: u64,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    // Only the device matters here, so the credential is not required
    let device = match device {
        Some(name) => Some(name.to_string()),
        None => file::load_config_file(path)?.audio.device,
    };
    let device = device
        .as_deref()
        .map_or(Ok(DeviceSelector::Default), DeviceSelector::parse)?;

    println!("Testing microphone '{device}' for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let microphone = CpalMicrophone::new();
    let (mut handle, mut events) = microphone.open(&CaptureConfig {
        device,
        ..CaptureConfig::default()
    })?;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    let mut recorded: Vec<i16> = Vec::new();
    'seconds: for i in 0..duration {
        let mut second: Vec<i16> = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);

        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => break,
                Ok(Some(CaptureEvent::Chunk(chunk))) => second.extend(chunk.to_samples()),
                Ok(Some(CaptureEvent::DeviceLost(reason))) => {
                    println!("Device lost: {reason}");
                    break 'seconds;
                }
                Ok(None) => break 'seconds,
            }
        }

        let energy = calculate_rms(&second);
        let peak = second
            .iter()
            .map(|&s| f32::from(s).abs() / f32::from(i16::MAX))
            .fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );

        if output.is_some() {
            recorded.extend(second);
        }
    }

    handle.close();

    if let Some(path) = output {
        let wav = samples_to_wav(&recorded, SAMPLE_RATE)?;
        std::fs::write(path, wav)?;
        println!("\nSaved {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: hearken list-devices");
    println!("  3. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Calculate RMS energy of i16 samples, normalized to [0, 1]
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = f32::from(s) / f32::from(i16::MAX);
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

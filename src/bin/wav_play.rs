//! WAV Player
//!
//! Plays a 16-bit PCM WAV file through the render engine.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_rtp::{
    audio::{CpalDevice, RenderEngine, WavReader},
    constants::DEFAULT_DEVICE_BUFFER_MS,
};

#[derive(Parser, Debug)]
#[command(name = "wav-play", about = "Play a WAV file on an output device")]
struct Cli {
    /// File to play
    file: PathBuf,

    /// Output device name (system default when omitted)
    #[arg(short, long)]
    device: Option<String>,

    /// Device buffer in milliseconds
    #[arg(long, default_value_t = DEFAULT_DEVICE_BUFFER_MS)]
    buffer_ms: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let reader = WavReader::open(&cli.file)
        .with_context(|| format!("reading {}", cli.file.display()))?;
    let format = *reader.format();
    tracing::info!(
        "Playing {} ({}, {} bytes)",
        cli.file.display(),
        format,
        reader.data_len()
    );

    let device = CpalDevice::render(cli.device, Duration::from_millis(cli.buffer_ms as u64));
    let mut engine = RenderEngine::open(device, Some(format)).context("opening output device")?;
    engine.start(reader)?;
    engine.wait().context("playback failed")?;

    tracing::info!("Rendered {} frames", engine.frames_rendered());
    Ok(())
}

//! Voice Peer Application
//!
//! Talks to one or more peers over RTP until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_rtp::{
    audio::{list_devices, CpalBackend},
    codec::{CodecInfo, CodecKind},
    config::AppConfig,
    network::bind_socket,
    voice::{VoiceLoopback, VoiceSession},
};

#[derive(Parser, Debug)]
#[command(name = "voice-peer", about = "Peer-to-peer voice over RTP")]
struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local UDP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Peer address, repeatable
    #[arg(long = "peer", value_name = "ADDR")]
    peers: Vec<SocketAddr>,

    /// Codec (l16 or opus)
    #[arg(long)]
    codec: Option<CodecKind>,

    /// Transmit threshold (0.0 - 1.0); 0 always transmits
    #[arg(long)]
    talk_level: Option<f32>,

    /// Print audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Play the microphone back locally through the codec
    #[arg(long)]
    loopback: bool,

    /// Seconds between statistics lines
    #[arg(long, default_value_t = 5)]
    stats_secs: u64,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.list_devices {
        print_devices();
        return Ok(());
    }

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(codec) = cli.codec {
        config.voice.codec = codec;
    }
    if let Some(level) = cli.talk_level {
        config.voice.talk_level = level;
    }
    config.validate().context("invalid configuration")?;

    let info = config.voice.codec_info().context("codec setup")?;
    let backend = CpalBackend::new(
        config.audio.capture_device.clone(),
        config.audio.render_device.clone(),
    )
    .with_buffer_duration(Duration::from_millis(config.audio.buffer_ms as u64));

    if cli.loopback {
        return run_loopback(&backend, &config, info, cli.stats_secs).await;
    }

    let socket = bind_socket(config.network.bind_addr(), config.network.recv_buffer_size)
        .context("binding RTP socket")?;
    let mut session = VoiceSession::new(backend, info, socket, config.voice_options())
        .context("creating voice session")?;

    let mut peers = config.voice.peer_addrs()?;
    peers.extend(cli.peers.iter().copied());
    for peer in peers {
        session.add_peer(peer).with_context(|| format!("adding peer {}", peer))?;
    }

    session.open().context("opening voice session")?;
    tracing::info!(
        "Listening on {} with {} peers ({} at {} bytes per packet)",
        session.local_addr()?,
        session.peers().len(),
        info.codec,
        info.payload_size
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(cli.stats_secs.max(1)));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                for error in session.errors().try_iter() {
                    tracing::warn!("{}", error);
                }
                if let Some(error) = session.take_audio_error() {
                    tracing::error!("Audio stopped: {}", error);
                    break;
                }

                let stats = session.stats();
                tracing::info!(
                    "level {:.2} | sent {} suppressed {} | received {} concealed {} dropped {} | keepalives {}",
                    stats.level,
                    stats.packets_transmitted,
                    stats.packets_suppressed,
                    stats.packets_received,
                    stats.packets_concealed,
                    stats.packets_dropped,
                    stats.rtp.keepalives_sent
                );
            }
        }
    }

    session.close().context("closing voice session")?;
    Ok(())
}

async fn run_loopback(
    backend: &CpalBackend,
    config: &AppConfig,
    info: CodecInfo,
    stats_secs: u64,
) -> Result<()> {
    let mut loopback =
        VoiceLoopback::new(backend, info, config.voice_options()).context("opening loopback")?;
    loopback.start()?;
    tracing::info!("Loopback running, Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(stats_secs.max(1)));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => tracing::info!("level {:.2}", loopback.level()),
        }
    }

    loopback.stop()?;
    Ok(())
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

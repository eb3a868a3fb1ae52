//! Audio Receiver Application
//!
//! Receives a PCM stream over UDP and plays it on an output device.
//!
//! Usage: `receiver [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtp_pcm_receiver::{audio::device::list_output_devices, config::AppConfig, Engine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting RTP PCM receiver");

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => AppConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load_or_default()?,
    };

    // List available output devices
    println!("\n=== Available Output Devices ===");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let mut engine = Engine::create(config).context("starting receiver")?;
    if let Some(addr) = engine.local_addr() {
        tracing::info!("Waiting for audio on udp://{}", addr);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stats_interval = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = stats_interval.tick() => {
                engine.poll_errors();
                let d = engine.diagnostics();
                tracing::info!(
                    "Stats: {} packets ({} discarded, {} lost, {} restarts), buffer {}/{} ({} dropped), \
                     {} underruns, state {:?}, output buffer {} frames",
                    d.network.packets_received,
                    d.network.discarded,
                    d.network.sequence_gaps,
                    d.network.restarts,
                    d.buffer.size,
                    d.buffer.capacity,
                    d.buffer.dropped,
                    d.underruns,
                    d.render_state,
                    d.audio_buffer_size,
                );
                tracing::debug!("{}", serde_json::to_string(&d)?);
            }
        }
    }

    tracing::info!("Shutting down");
    engine.stop();
    Ok(())
}

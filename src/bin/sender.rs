//! Test Tone Sender
//!
//! Streams a sine tone as RTP-framed s16le PCM at the nominal packet rate.
//!
//! Usage: `sender [target_addr] [frequency_hz]`

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtp_pcm_receiver::{
    constants::*,
    network::packet::{encode_datagram, RtpHeader, RTP_PAYLOAD_TYPE},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let target_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_UDP_PORT))
        .parse()
        .context("invalid target address")?;
    let frequency: f32 = args
        .next()
        .map(|f| f.parse())
        .transpose()
        .context("invalid frequency")?
        .unwrap_or(440.0);

    let channels = DEFAULT_CHANNELS as usize;
    let sample_rate = DEFAULT_SAMPLE_RATE;
    let frames = DEFAULT_MTU / 2 / channels;
    let period = Duration::from_secs_f64(frames as f64 / sample_rate as f64);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    tracing::info!(
        "Sending {}Hz tone to {}: {} frames per packet every {:.2}ms",
        frequency,
        target_addr,
        frames,
        period.as_secs_f64() * 1000.0
    );

    let mut header = RtpHeader {
        payload_type: RTP_PAYLOAD_TYPE,
        sequence: 0,
        timestamp: 0,
        ssrc: std::process::id(),
    };
    let mut samples = vec![0i16; frames * channels];
    let mut phase = 0.0f32;
    let step = frequency * 2.0 * std::f32::consts::PI / sample_rate as f32;

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut packets_sent = 0u64;
    let mut last_stats_time = Instant::now();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {}
        }

        for frame in samples.chunks_exact_mut(channels) {
            let value = (phase.sin() * 0.3 * i16::MAX as f32) as i16;
            frame.fill(value);
            phase = (phase + step) % (2.0 * std::f32::consts::PI);
        }

        let datagram = encode_datagram(&header, &samples);
        if let Err(e) = socket.send_to(&datagram, target_addr).await {
            tracing::warn!("Failed to send packet: {}", e);
        }
        packets_sent += 1;
        header.sequence = header.sequence.wrapping_add(1);
        header.timestamp = header.timestamp.wrapping_add(frames as u32);

        // Periodic stats logging
        if last_stats_time.elapsed() >= Duration::from_secs(5) {
            last_stats_time = Instant::now();
            tracing::info!("Stats: {} packets sent", packets_sent);
        }
    }

    tracing::info!("Stopped after {} packets", packets_sent);
    Ok(())
}

//! # RTP PCM Receiver
//!
//! Low-latency receiver for raw 16-bit PCM audio streamed over UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               RECEIVER                               │
//! │                                                                      │
//! │   UDP datagrams [RTP header | 1280 bytes s16le PCM]                  │
//! │          │                                                           │
//! │          ▼                                                           │
//! │  ┌───────────────────────────────┐                                   │
//! │  │ NetworkReceiver               │  thread "net-receiver"            │
//! │  │ (network::receiver)           │  tokio current-thread runtime     │
//! │  │  - exact-size validation      │  idle timer → close + rebind      │
//! │  │  - decode into tail slot      │                                   │
//! │  └───────────────┬───────────────┘                                   │
//! │                  │ acquire_write_tail / commit_write_tail            │
//! │                  ▼                                                   │
//! │  ┌───────────────────────────────┐                                   │
//! │  │ PacketBuffer (audio::buffer)  │  SPSC ring, drop-oldest on full   │
//! │  │  [pkt][pkt][pkt][   ][   ]    │  head/tail/size + move counters   │
//! │  └───────────────┬───────────────┘                                   │
//! │                  │ peek_read_head / advance_read_head                │
//! │                  ▼                                                   │
//! │  ┌───────────────────────────────┐                                   │
//! │  │ RenderEngine (audio::render)  │  platform real-time thread        │
//! │  │  - channel mask / downmix     │  never blocks, never allocates    │
//! │  │  - None/Overrun/Underrun/     │                                   │
//! │  │    Depleted + concealment     │──▶ LatencyTuner ──▶ StreamControl │
//! │  └───────────────┬───────────────┘                                   │
//! │                  ▼                                                   │
//! │            cpal output stream (audio::playback)                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod network;

pub use engine::{Diagnostics, Engine};
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Largest supported channel count per packet
    pub const MAX_CHANNELS: u16 = 16;

    /// Default UDP port for audio streaming
    pub const DEFAULT_UDP_PORT: u16 = 4010;

    /// Default PCM payload per datagram: 640 samples, 320 stereo frames
    pub const DEFAULT_MTU: usize = 1280;

    /// Fixed RTP header length
    pub const RTP_HEADER_BYTES: usize = 12;

    /// Largest datagram the receiver will read
    pub const MAX_DATAGRAM_SIZE: usize = 65_507;

    /// Default jitter buffer depth in milliseconds
    pub const DEFAULT_MAX_LATENCY_MS: u32 = 100;

    /// Default fill above which the buffer reports overrun
    pub const DEFAULT_TARGET_LATENCY_MS: u32 = 50;

    /// Default socket idle timeout before a restart
    pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1000;

    /// Default number of callbacks concealment takes to reach silence
    pub const DEFAULT_CONCEAL_FADE_CALLBACKS: u32 = 4;
}

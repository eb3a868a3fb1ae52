//! Receiver configuration
//!
//! Everything the engine needs is fixed at construction. The config is
//! loaded from TOML (or defaulted), then validated as a whole so that an
//! inconsistent combination fails before anything is allocated or bound.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub audio: AudioConfig,
}

/// UDP ingress settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address to bind
    pub bind_address: String,
    /// Local UDP port (0 picks an ephemeral port)
    pub udp_port: u16,
    /// PCM payload bytes per datagram
    pub mtu: usize,
    /// Bytes of transport header preceding the payload
    pub header_bytes: usize,
    /// Restart the socket when nothing arrives for this long
    pub idle_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            udp_port: DEFAULT_UDP_PORT,
            mtu: DEFAULT_MTU,
            header_bytes: RTP_HEADER_BYTES,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl NetworkConfig {
    /// Resolve the configured bind address
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.udp_port))
    }

    /// Exact size of an acceptable datagram
    pub fn datagram_bytes(&self) -> usize {
        self.header_bytes + self.mtu
    }
}

/// Output and latency behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMode {
    /// Smallest device buffer, grown on underruns
    #[default]
    LowLatency,
    /// Half the buffer capacity, grown on underruns
    Normal,
    /// Full buffer capacity, never tuned
    PowerSaving,
}

impl LatencyMode {
    pub fn tunes(&self) -> bool {
        !matches!(self, LatencyMode::PowerSaving)
    }
}

/// Audio format and jitter buffer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Channels carried in each packet
    pub num_channel: u16,
    /// Bit i set means source channel i is rendered
    pub mask_channel: u32,
    /// Jitter buffer holds at most this much audio
    pub max_latency_ms: u32,
    /// Buffer fill above this is reported as overrun
    pub target_latency_ms: u32,
    pub latency_mode: LatencyMode,
    /// Callbacks over which concealment fades to silence
    pub conceal_fade_callbacks: u32,
    /// Output device name, `None` for the host default
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            num_channel: DEFAULT_CHANNELS,
            mask_channel: 0b11,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            target_latency_ms: DEFAULT_TARGET_LATENCY_MS,
            latency_mode: LatencyMode::default(),
            conceal_fade_callbacks: DEFAULT_CONCEAL_FADE_CALLBACKS,
            output_device: None,
        }
    }
}

impl AppConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Write as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Read(e.to_string()))?;
        }
        std::fs::write(path, text).map_err(|e| ConfigError::Read(e.to_string()))
    }

    /// `<config dir>/rtp-pcm-receiver/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "rtp-pcm-receiver")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check every parameter and their combinations
    pub fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        let audio = &self.audio;

        if net.mtu == 0 || net.mtu % 2 != 0 {
            return Err(ConfigError::InvalidMtu(net.mtu));
        }
        if audio.num_channel == 0 || audio.num_channel > MAX_CHANNELS {
            return Err(ConfigError::InvalidChannelCount {
                got: audio.num_channel,
                max: MAX_CHANNELS,
            });
        }
        if (net.mtu / 2) % audio.num_channel as usize != 0 {
            return Err(ConfigError::PartialFrame {
                mtu: net.mtu,
                channels: audio.num_channel,
            });
        }
        if self.active_channels() == 0 {
            return Err(ConfigError::EmptyChannelMask {
                mask: audio.mask_channel,
                channels: audio.num_channel,
            });
        }
        if audio.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate);
        }
        if audio.max_latency_ms == 0 {
            return Err(ConfigError::InvalidMaxLatency);
        }
        if audio.target_latency_ms > audio.max_latency_ms {
            return Err(ConfigError::TargetAboveMax {
                target_ms: audio.target_latency_ms,
                max_ms: audio.max_latency_ms,
            });
        }
        if net.idle_timeout_ms == 0 {
            return Err(ConfigError::InvalidIdleTimeout);
        }
        if audio.conceal_fade_callbacks == 0 {
            return Err(ConfigError::InvalidFade);
        }
        net.socket_addr()?;
        Ok(())
    }

    /// Samples (all channels) per packet
    pub fn packet_samples(&self) -> usize {
        self.network.mtu / 2
    }

    pub fn frames_per_packet(&self) -> usize {
        self.packet_samples() / self.audio.num_channel.max(1) as usize
    }

    /// Source channels selected by the mask
    pub fn active_channels(&self) -> u32 {
        (self.audio.mask_channel & channel_bits(self.audio.num_channel)).count_ones()
    }

    /// Slots needed to hold `max_latency_ms` of audio
    pub fn buffer_capacity(&self) -> usize {
        self.packets_for_ms(self.audio.max_latency_ms).max(1)
    }

    /// Buffer fill (in packets) above which the stream counts as overrun.
    /// A zero target disables overrun reporting.
    pub fn target_packets(&self) -> usize {
        match self.audio.target_latency_ms {
            0 => self.buffer_capacity(),
            ms => self.packets_for_ms(ms),
        }
    }

    fn packets_for_ms(&self, ms: u32) -> usize {
        let frames = ms as u64 * self.audio.sample_rate as u64 / 1000;
        let per_packet = self.frames_per_packet().max(1) as u64;
        frames.div_ceil(per_packet) as usize
    }
}

fn channel_bits(num_channel: u16) -> u32 {
    if num_channel >= 32 {
        u32::MAX
    } else {
        (1u32 << num_channel) - 1
    }
}

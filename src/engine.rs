//! Receiver engine: buffer, network receiver and output wired together

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::audio::buffer::{create_shared_buffer, PacketBufferStats, SharedPacketBuffer};
use crate::audio::playback::AudioPlayback;
use crate::audio::render::{RenderEngine, RenderSettings, RenderState, RenderStats};
use crate::audio::stream::{StreamControl, StreamInfo};
use crate::audio::tuner::tuner_for;
use crate::config::AppConfig;
use crate::error::Result;
use crate::network::receiver::{NetworkReceiver, ReceiverStats};

/// Snapshot of every counter the receiver exposes
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub buffer: PacketBufferStats,
    pub network: ReceiverStats,
    pub render_state: RenderState,
    pub underruns: u64,
    /// Output buffer size in frames the stream runs with. With a device,
    /// 0 means the device rejected fixed sizes and uses its default.
    pub audio_buffer_size: u32,
    pub callbacks: u64,
    pub frames_concealed: u64,
    pub stream: StreamInfo,
}

/// Running receiver
pub struct Engine {
    config: AppConfig,
    buffer: SharedPacketBuffer,
    receiver: NetworkReceiver,
    playback: Option<AudioPlayback>,
    render_stats: Arc<RenderStats>,
    stream_info: StreamInfo,
}

impl Engine {
    /// Validate the config, start receiving and open the output device.
    /// Nothing keeps running if any step fails.
    pub fn create(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let buffer = create_shared_buffer(config.buffer_capacity(), config.packet_samples());

        let receiver = NetworkReceiver::new(buffer.clone(), config.network.clone());
        receiver.start()?;

        let playback = AudioPlayback::start(&config, buffer.clone())?;
        let render_stats = playback.render_stats();
        let stream_info = playback.info().clone();

        Self::log_started(&config, &buffer);
        Ok(Self {
            config,
            buffer,
            receiver,
            playback: Some(playback),
            render_stats,
            stream_info,
        })
    }

    /// Like [`create`](Self::create) but without opening a device: the
    /// caller drives the returned renderer from its own audio callback.
    pub fn detached(
        config: AppConfig,
        stream: Box<dyn StreamControl>,
    ) -> Result<(Self, RenderEngine)> {
        config.validate()?;
        let buffer = create_shared_buffer(config.buffer_capacity(), config.packet_samples());

        let receiver = NetworkReceiver::new(buffer.clone(), config.network.clone());
        receiver.start()?;

        let stream_info = stream.info().clone();
        let renderer = RenderEngine::new(
            buffer.clone(),
            RenderSettings::from_config(&config),
            tuner_for(
                config.audio.latency_mode,
                stream_info.frames_per_burst,
                stream_info.buffer_capacity_in_frames,
            ),
            stream,
        );
        let render_stats = renderer.stats();

        Self::log_started(&config, &buffer);
        let engine = Self {
            config,
            buffer,
            receiver,
            playback: None,
            render_stats,
            stream_info,
        };
        Ok((engine, renderer))
    }

    fn log_started(config: &AppConfig, buffer: &SharedPacketBuffer) {
        tracing::info!(
            "Jitter buffer: {} packets of {} frames ({}ms max, overrun above {} packets)",
            buffer.capacity(),
            config.frames_per_packet(),
            config.audio.max_latency_ms,
            config.target_packets()
        );
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Bound UDP address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.receiver.local_addr()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            buffer: self.buffer.stats(),
            network: self.receiver.stats(),
            render_state: self.render_stats.state(),
            underruns: self.render_stats.underruns(),
            audio_buffer_size: match &self.playback {
                Some(playback) => playback.active_buffer_size(),
                None => self.render_stats.audio_buffer_size(),
            },
            callbacks: self.render_stats.callbacks(),
            frames_concealed: self.render_stats.frames_concealed(),
            stream: self.stream_info.clone(),
        }
    }

    /// Log and count output stream errors reported since the last call
    pub fn poll_errors(&self) -> usize {
        let Some(playback) = &self.playback else {
            return 0;
        };
        let mut count = 0;
        while let Some(err) = playback.check_errors() {
            tracing::warn!("Output stream error: {}", err);
            count += 1;
        }
        count
    }

    /// Stop output and network. Also done on drop.
    pub fn stop(&mut self) {
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
        self.receiver.stop();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::render::AudioRenderer;
    use crate::audio::stream::{ClampedStream, SharingMode};
    use crate::config::LatencyMode;
    use crate::error::{ConfigError, Error};

    fn stream() -> Box<dyn StreamControl> {
        Box::new(ClampedStream::new(
            StreamInfo {
                sharing_mode: SharingMode::Shared,
                performance_mode: LatencyMode::Normal,
                frames_per_burst: 96,
                buffer_capacity_in_frames: 4800,
                channels: 2,
                sample_rate: 48000,
            },
            480,
        ))
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.network.bind_address = "127.0.0.1".into();
        config.network.udp_port = 0;
        config
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let mut config = config();
        config.audio.mask_channel = 0;
        let result = Engine::detached(config, stream());
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::EmptyChannelMask { .. }))
        ));
    }

    #[test]
    fn test_detached_diagnostics() {
        let (engine, mut renderer) = Engine::detached(config(), stream()).unwrap();
        assert!(engine.local_addr().is_some());

        let mut out = vec![0i16; 960];
        renderer.render(&mut out, 2);

        let diagnostics = engine.diagnostics();
        assert_eq!(diagnostics.buffer.capacity, 15);
        assert_eq!(diagnostics.render_state, RenderState::Depleted);
        assert_eq!(diagnostics.underruns, 1);
        assert_eq!(diagnostics.callbacks, 1);
        // Low-latency tuning starts at one burst
        assert_eq!(diagnostics.audio_buffer_size, 96);
        assert_eq!(diagnostics.stream.frames_per_burst, 96);

        let json = serde_json::to_value(&diagnostics).unwrap();
        assert_eq!(json["render_state"], "depleted");
        assert_eq!(json["buffer"]["capacity"], 15);
    }
}

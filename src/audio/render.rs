//! Real-time render callback
//!
//! [`RenderEngine`] drains the packet buffer into platform output buffers.
//! It runs on the audio device's thread once per output buffer and must
//! return in time: it never blocks, allocates or logs. Everything it
//! reports goes through atomics in [`RenderStats`].

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::audio::buffer::SharedPacketBuffer;
use crate::audio::channel::ChannelMap;
use crate::audio::stream::StreamControl;
use crate::audio::tuner::{BufferHealth, LatencyTuner};
use crate::config::AppConfig;

/// Buffer health as seen by the last callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RenderState {
    #[default]
    None = 0,
    /// Buffer fuller than the target latency
    Overrun = 1,
    /// Ran dry part way through a callback
    Underrun = 2,
    /// No packet at all for a whole callback
    Depleted = 3,
}

impl RenderState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RenderState::Overrun,
            2 => RenderState::Underrun,
            3 => RenderState::Depleted,
            _ => RenderState::None,
        }
    }
}

/// Supplies output audio on demand
pub trait AudioRenderer: Send {
    /// Fill all of `output` (interleaved, `num_output_channel` channels)
    fn render(&mut self, output: &mut [i16], num_output_channel: usize);
}

/// Render-side counters, readable from any thread
#[derive(Debug, Default)]
pub struct RenderStats {
    underruns: AtomicU64,
    audio_buffer_size: AtomicU32,
    state: AtomicU8,
    callbacks: AtomicU64,
    frames_rendered: AtomicU64,
    frames_concealed: AtomicU64,
}

impl RenderStats {
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Output buffer size last applied, in frames
    pub fn audio_buffer_size(&self) -> u32 {
        self.audio_buffer_size.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RenderState {
        RenderState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    /// Frames taken from network packets
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    /// Frames filled by concealment
    pub fn frames_concealed(&self) -> u64 {
        self.frames_concealed.load(Ordering::Relaxed)
    }
}

/// Render engine settings derived from the config
#[derive(Debug, Clone, Copy)]
pub struct RenderSettings {
    pub channels: ChannelMap,
    /// Fill (packets) above which the buffer counts as overrun
    pub target_packets: usize,
    /// Callbacks for concealment to fade to silence
    pub fade_callbacks: u32,
}

impl RenderSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            channels: ChannelMap::new(config.audio.num_channel, config.audio.mask_channel),
            target_packets: config.target_packets(),
            fade_callbacks: config.audio.conceal_fade_callbacks,
        }
    }
}

/// Jitter buffer consumer and render state machine
pub struct RenderEngine {
    buffer: SharedPacketBuffer,
    channels: ChannelMap,
    target_packets: usize,
    tuner: Box<dyn LatencyTuner>,
    stream: Box<dyn StreamControl>,
    stats: Arc<RenderStats>,

    state: RenderState,
    /// Stream position of the packet `offset` points into
    cursor: Option<u64>,
    /// Sample offset into the head packet
    offset: usize,
    /// Last fully played packet, replayed while starved
    last_samples: Box<[i16]>,
    conceal_frame: usize,
    conceal_step: u32,
    fade_callbacks: u32,
    underruns: u64,
}

impl RenderEngine {
    pub fn new(
        buffer: SharedPacketBuffer,
        settings: RenderSettings,
        tuner: Box<dyn LatencyTuner>,
        stream: Box<dyn StreamControl>,
    ) -> Self {
        let stats = Arc::new(RenderStats::default());
        stats
            .audio_buffer_size
            .store(stream.buffer_size_in_frames(), Ordering::Relaxed);
        let last_samples = vec![0i16; buffer.packet_samples()].into_boxed_slice();

        Self {
            buffer,
            channels: settings.channels,
            target_packets: settings.target_packets,
            tuner,
            stream,
            stats,
            state: RenderState::None,
            cursor: None,
            offset: 0,
            last_samples,
            conceal_frame: 0,
            conceal_step: 0,
            fade_callbacks: settings.fade_callbacks.max(1),
            underruns: 0,
        }
    }

    /// Shared counters for diagnostics
    pub fn stats(&self) -> Arc<RenderStats> {
        self.stats.clone()
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// Copy packets into `output` until it is full or the buffer is empty.
    /// Returns frames written.
    fn drain(&mut self, output: &mut [i16], num_output_channel: usize) -> usize {
        let frames = output.len() / num_output_channel;
        let src_channels = self.channels.source_channels();
        let mut written = 0;

        while written < frames {
            let Some((position, packet)) = self.buffer.peek_read_position() else {
                break;
            };
            if self.cursor != Some(position) {
                // New packet, or the one we were in was dropped on overflow
                self.cursor = Some(position);
                self.offset = 0;
            }

            // A trailing partial frame is never played
            let whole = packet.len() / src_channels * src_channels;
            let first = self.offset / src_channels;
            let available = whole / src_channels - first;
            let n = available.min(frames - written);

            for (i, dst) in output[written * num_output_channel..]
                .chunks_exact_mut(num_output_channel)
                .take(n)
                .enumerate()
            {
                let base = (first + i) * src_channels;
                self.channels.map_frame(|ch| packet.sample(base + ch), dst);
            }
            written += n;
            self.offset += n * src_channels;

            if self.offset >= whole {
                packet.copy_to(&mut self.last_samples);
                self.buffer.advance_read_head();
                self.cursor = None;
                self.offset = 0;
            }
        }

        written
    }

    /// Fill `output` from the fallback packet at the current fade step
    fn conceal(&mut self, output: &mut [i16], num_output_channel: usize) {
        self.conceal_step = (self.conceal_step + 1).min(self.fade_callbacks);
        let gain = (self.fade_callbacks - self.conceal_step) as i32;
        let fade = self.fade_callbacks as i32;

        if gain == 0 {
            output.fill(0);
            return;
        }

        let src_channels = self.channels.source_channels();
        let fallback_frames = self.last_samples.len() / src_channels;
        if fallback_frames == 0 {
            output.fill(0);
            return;
        }

        for dst in output.chunks_exact_mut(num_output_channel) {
            let base = self.conceal_frame * src_channels;
            let last = &self.last_samples;
            self.channels.map_frame(|ch| last[base + ch], dst);
            for sample in dst.iter_mut() {
                *sample = (*sample as i32 * gain / fade) as i16;
            }
            self.conceal_frame = (self.conceal_frame + 1) % fallback_frames;
        }
    }

    fn update_state(&mut self, fill_at_start: usize, written: usize, frames: usize) {
        let next = if written == frames {
            if fill_at_start > self.target_packets {
                RenderState::Overrun
            } else {
                RenderState::None
            }
        } else if written > 0 {
            RenderState::Underrun
        } else {
            RenderState::Depleted
        };

        match next {
            RenderState::Underrun => self.underruns += 1,
            RenderState::Depleted if self.state != RenderState::Depleted => self.underruns += 1,
            _ => {}
        }

        self.state = next;
        self.stats.state.store(next as u8, Ordering::Relaxed);
        self.stats.underruns.store(self.underruns, Ordering::Relaxed);
    }

    fn tune(&mut self) {
        let health = BufferHealth {
            state: self.state,
            fill: self.buffer.size(),
            capacity: self.buffer.capacity(),
            underruns: self.underruns,
        };
        let current = self.stream.buffer_size_in_frames();
        if let Some(frames) = self.tuner.tune(&health, current) {
            let applied = self.stream.set_buffer_size_in_frames(frames);
            self.stats
                .audio_buffer_size
                .store(applied, Ordering::Relaxed);
        }
    }
}

impl AudioRenderer for RenderEngine {
    fn render(&mut self, output: &mut [i16], num_output_channel: usize) {
        if num_output_channel == 0 {
            output.fill(0);
            return;
        }
        let frames = output.len() / num_output_channel;
        // Trailing partial frame, if the platform ever hands one over
        output[frames * num_output_channel..].fill(0);
        if frames == 0 {
            return;
        }

        let fill_at_start = self.buffer.size();
        let written = self.drain(output, num_output_channel);

        if written > 0 {
            self.conceal_step = 0;
            self.conceal_frame = 0;
        }
        if written < frames {
            let rest = &mut output[written * num_output_channel..frames * num_output_channel];
            self.conceal(rest, num_output_channel);
        }

        self.update_state(fill_at_start, written, frames);
        self.stats.callbacks.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_rendered
            .fetch_add(written as u64, Ordering::Relaxed);
        self.stats
            .frames_concealed
            .fetch_add((frames - written) as u64, Ordering::Relaxed);

        self.tune();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{create_shared_buffer, PacketBuffer};
    use crate::audio::stream::{ClampedStream, SharingMode, StreamInfo};
    use crate::audio::tuner::{BurstTuner, FixedLatency};
    use crate::config::LatencyMode;

    const FRAMES: usize = 4;

    fn stream() -> Box<dyn StreamControl> {
        Box::new(ClampedStream::new(
            StreamInfo {
                sharing_mode: SharingMode::Shared,
                performance_mode: LatencyMode::LowLatency,
                frames_per_burst: 4,
                buffer_capacity_in_frames: 64,
                channels: 2,
                sample_rate: 48000,
            },
            16,
        ))
    }

    fn engine(buffer: SharedPacketBuffer, target_packets: usize) -> RenderEngine {
        RenderEngine::new(
            buffer,
            RenderSettings {
                channels: ChannelMap::new(2, 0b11),
                target_packets,
                fade_callbacks: 4,
            },
            Box::new(FixedLatency),
            stream(),
        )
    }

    /// Stereo packet of FRAMES frames, left = base + i, right = -(base + i)
    fn push(buffer: &PacketBuffer, base: i16) -> Vec<i16> {
        let samples: Vec<i16> = (0..FRAMES as i16)
            .flat_map(|i| [base + i, -(base + i)])
            .collect();
        buffer.acquire_write_tail().copy_from(&samples);
        buffer.commit_write_tail();
        samples
    }

    #[test]
    fn test_request_spans_packets() {
        let buffer = create_shared_buffer(8, FRAMES * 2);
        let mut expected = push(&buffer, 0);
        expected.extend(push(&buffer, 100));
        let mut engine = engine(buffer.clone(), 8);

        let mut out = vec![0i16; FRAMES * 2 * 2];
        engine.render(&mut out, 2);

        assert_eq!(out, expected);
        assert_eq!(engine.state(), RenderState::None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_small_requests_keep_offset() {
        let buffer = create_shared_buffer(8, FRAMES * 2);
        let expected = push(&buffer, 10);
        let mut engine = engine(buffer.clone(), 8);

        let mut first = vec![0i16; 3 * 2];
        let mut second = vec![0i16; 2];
        engine.render(&mut first, 2);
        assert_eq!(buffer.size(), 1);
        engine.render(&mut second, 2);

        assert_eq!([first, second].concat(), expected);
        assert!(buffer.is_empty());
        assert_eq!(engine.underruns(), 0);
    }

    #[test]
    fn test_overflow_drop_restarts_cursor() {
        let buffer = create_shared_buffer(2, FRAMES * 2);
        push(&buffer, 0);
        let next = push(&buffer, 100);
        let mut engine = engine(buffer.clone(), 8);

        // Half of the first packet, then overflow drops it
        let mut half = vec![0i16; FRAMES];
        engine.render(&mut half, 2);
        assert_eq!(half, vec![0, 0, 1, -1]);
        push(&buffer, 200);
        assert_eq!(buffer.dropped(), 1);

        let mut out = vec![0i16; FRAMES * 2];
        engine.render(&mut out, 2);
        assert_eq!(out, next);
        assert_eq!(engine.state(), RenderState::None);
        assert_eq!(buffer.size(), 1);
    }

    #[test]
    fn test_partial_trailing_frame_is_skipped() {
        // 8 samples of 3-channel audio: two frames plus two stray samples
        let buffer = create_shared_buffer(4, 8);
        buffer.acquire_write_tail().copy_from(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buffer.commit_write_tail();
        buffer.acquire_write_tail().copy_from(&[9, 10, 11, 12, 13, 14, 15, 16]);
        buffer.commit_write_tail();

        let mut engine = RenderEngine::new(
            buffer.clone(),
            RenderSettings {
                channels: ChannelMap::new(3, 0b111),
                target_packets: 4,
                fade_callbacks: 4,
            },
            Box::new(FixedLatency),
            stream(),
        );

        let mut out = vec![0i16; 4 * 3];
        engine.render(&mut out, 3);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 9, 10, 11, 12, 13, 14]);
        assert!(buffer.is_empty());
        assert_eq!(engine.state(), RenderState::None);
    }

    #[test]
    fn test_mono_output_downmixes() {
        let buffer = create_shared_buffer(4, FRAMES * 2);
        buffer
            .acquire_write_tail()
            .copy_from(&[100, 200, -100, -300, 7, 8, 0, 0]);
        buffer.commit_write_tail();
        let mut engine = engine(buffer, 4);

        let mut out = vec![0i16; FRAMES];
        engine.render(&mut out, 1);
        assert_eq!(out, vec![150, -200, 7, 0]);
    }

    #[test]
    fn test_depleted_conceals_and_fades() {
        let buffer = create_shared_buffer(4, FRAMES * 2);
        buffer.acquire_write_tail().copy_from(&[1000; FRAMES * 2]);
        buffer.commit_write_tail();
        let mut engine = engine(buffer.clone(), 4);

        let mut out = vec![0i16; FRAMES * 2];
        engine.render(&mut out, 2);
        assert_eq!(engine.state(), RenderState::None);

        let mut levels = Vec::new();
        for _ in 0..6 {
            let mut out = vec![i16::MIN; FRAMES * 2];
            engine.render(&mut out, 2);
            assert_eq!(engine.state(), RenderState::Depleted);
            assert!(out.iter().all(|&s| s == out[0]));
            levels.push(out[0]);
        }
        assert_eq!(levels, vec![750, 500, 250, 0, 0, 0]);
        // Entering Depleted counts once
        assert_eq!(engine.underruns(), 1);

        push(&buffer, 1);
        let mut out = vec![0i16; FRAMES * 2];
        engine.render(&mut out, 2);
        assert_eq!(engine.state(), RenderState::None);
    }

    #[test]
    fn test_depleted_before_any_packet_is_silent() {
        let buffer = create_shared_buffer(4, FRAMES * 2);
        let mut engine = engine(buffer, 4);
        let mut out = vec![123i16; FRAMES * 2];
        engine.render(&mut out, 2);
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(engine.state(), RenderState::Depleted);
    }

    #[test]
    fn test_underrun_mid_callback() {
        let buffer = create_shared_buffer(4, FRAMES * 2);
        let samples = push(&buffer, 40);
        let mut engine = engine(buffer, 4);

        let mut out = vec![0i16; FRAMES * 2 * 2];
        engine.render(&mut out, 2);

        assert_eq!(engine.state(), RenderState::Underrun);
        assert_eq!(engine.underruns(), 1);
        assert_eq!(&out[..FRAMES * 2], &samples[..]);
        // Tail replays the packet at 3/4 gain
        let faded: Vec<i16> = samples.iter().map(|&s| (s as i32 * 3 / 4) as i16).collect();
        assert_eq!(&out[FRAMES * 2..], &faded[..]);
    }

    #[test]
    fn test_overrun_above_target() {
        let buffer = create_shared_buffer(8, FRAMES * 2);
        for i in 0..4 {
            push(&buffer, i * 10);
        }
        let mut engine = engine(buffer, 3);

        let mut out = vec![0i16; FRAMES * 2];
        // 4 queued > 3, then 3 queued
        engine.render(&mut out, 2);
        assert_eq!(engine.state(), RenderState::Overrun);
        engine.render(&mut out, 2);
        assert_eq!(engine.state(), RenderState::None);
        assert_eq!(engine.stats().state(), RenderState::None);
    }

    #[test]
    fn test_tuner_recommendation_applied() {
        let buffer = create_shared_buffer(4, FRAMES * 2);
        let mut engine = RenderEngine::new(
            buffer,
            RenderSettings {
                channels: ChannelMap::new(2, 0b11),
                target_packets: 4,
                fade_callbacks: 4,
            },
            Box::new(BurstTuner::new(4, 64)),
            stream(),
        );
        let stats = engine.stats();
        assert_eq!(stats.audio_buffer_size(), 16);

        let mut out = vec![0i16; FRAMES * 2];
        // Depleted entry counts as an underrun; the first tune call resets
        // to one burst and sees that underrun as its baseline
        engine.render(&mut out, 2);
        assert_eq!(stats.audio_buffer_size(), 4);
        engine.render(&mut out, 2);
        assert_eq!(stats.audio_buffer_size(), 4);
        assert_eq!(stats.callbacks(), 2);
        assert_eq!(stats.frames_concealed(), (FRAMES * 2) as u64);
    }
}

//! cpal output stream driving the render engine
//!
//! The stream is built and kept alive on a dedicated thread (cpal streams
//! are not `Send` on every platform). cpal cannot resize a running stream,
//! so when the tuner changes the buffer size the thread drops the stream
//! and opens a new one with `BufferSize::Fixed`. The [`RenderEngine`]
//! outlives each stream; stream errors come back over a bounded channel.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig, SupportedBufferSize};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::SharedPacketBuffer;
use crate::audio::device::find_output_device;
use crate::audio::render::{AudioRenderer, RenderEngine, RenderSettings, RenderStats};
use crate::audio::stream::{ClampedStream, SharingMode, StreamInfo};
use crate::audio::tuner::tuner_for;
use crate::config::{AppConfig, LatencyMode};
use crate::error::AudioError;

/// Frames converted per render call
const SCRATCH_FRAMES: usize = 8192;

/// How often the output thread checks for a new buffer size
const RESIZE_POLL_INTERVAL: Duration = Duration::from_millis(100);

type SharedRenderer = Arc<Mutex<RenderEngine>>;

/// Running output stream
pub struct AudioPlayback {
    info: StreamInfo,
    render_stats: Arc<RenderStats>,
    /// Buffer size the device stream was opened with, 0 for the device default
    opened_frames: Arc<AtomicU32>,
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
}

impl AudioPlayback {
    /// Open the configured output device and start rendering from `buffer`
    pub fn start(config: &AppConfig, buffer: SharedPacketBuffer) -> Result<Self, AudioError> {
        let device = find_output_device(config.audio.output_device.as_deref())?;
        let supported = device.default_output_config()?;

        let channels = supported.channels();
        let sample_format = supported.sample_format();
        let sample_rate = config.audio.sample_rate;
        let mode = config.audio.latency_mode;
        let (frames_per_burst, capacity) = buffer_limits(supported.buffer_size(), sample_rate);

        match sample_format {
            SampleFormat::I16 | SampleFormat::F32 | SampleFormat::U16 => {}
            other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
        }

        let info = StreamInfo {
            sharing_mode: SharingMode::Shared,
            performance_mode: mode,
            frames_per_burst,
            buffer_capacity_in_frames: capacity,
            channels,
            sample_rate,
        };
        let initial_frames = initial_buffer_frames(&info);

        let renderer = RenderEngine::new(
            buffer,
            RenderSettings::from_config(config),
            tuner_for(mode, frames_per_burst, capacity),
            Box::new(ClampedStream::new(info.clone(), initial_frames)),
        );
        let render_stats = renderer.stats();
        let opened_frames = Arc::new(AtomicU32::new(0));

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let device_name = device.name.clone();

        let factory = StreamFactory {
            device: device.into_inner(),
            config: StreamConfig {
                channels,
                sample_rate: SampleRate(sample_rate),
                buffer_size: BufferSize::Default,
            },
            sample_format,
            renderer: Arc::new(Mutex::new(renderer)),
            error_tx,
        };
        let stats = render_stats.clone();
        let opened = opened_frames.clone();

        let handle = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                let (stream, frames) = match factory.open_preferred(initial_frames) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                opened.store(frames, Ordering::Relaxed);
                let _ = ready_tx.send(Ok(()));

                if mode.tunes() {
                    run_resizing(&factory, stream, frames, &stats, &opened, &stop_rx);
                } else {
                    // Stream stays alive until stop() drops the sender
                    let _ = stop_rx.recv();
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("output thread exited".to_string())));
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!(
            "Output started on {}: {}Hz, {} channels, {:?}, burst {} frames, buffer {} frames",
            device_name,
            sample_rate,
            channels,
            sample_format,
            frames_per_burst,
            opened_frames.load(Ordering::Relaxed)
        );

        Ok(Self {
            info,
            render_stats,
            opened_frames,
            stop_tx: Some(stop_tx),
            thread_handle: Some(handle),
            error_rx,
        })
    }

    /// Stop the stream
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn render_stats(&self) -> Arc<RenderStats> {
        self.render_stats.clone()
    }

    /// Buffer size in frames the device stream is running with; 0 when
    /// the device rejected a fixed size and runs with its default
    pub fn active_buffer_size(&self) -> u32 {
        self.opened_frames.load(Ordering::Relaxed)
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Buffer size the stream opens with: one burst for low latency, the full
/// capacity when power saving, half of it otherwise
fn initial_buffer_frames(info: &StreamInfo) -> u32 {
    match info.performance_mode {
        LatencyMode::LowLatency => info.frames_per_burst,
        LatencyMode::Normal => info.buffer_capacity_in_frames / 2,
        LatencyMode::PowerSaving => info.buffer_capacity_in_frames,
    }
}

/// Rebuild the stream whenever the applied size moves, until stopped
fn run_resizing(
    factory: &StreamFactory,
    stream: cpal::Stream,
    frames: u32,
    stats: &RenderStats,
    opened: &AtomicU32,
    stop_rx: &Receiver<()>,
) {
    let mut stream = Some(stream);
    let mut current = frames;
    let mut last_failed = None;

    loop {
        match stop_rx.recv_timeout(RESIZE_POLL_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }

        let Some(target) = resize_target(stats.audio_buffer_size(), current, last_failed) else {
            continue;
        };

        // The old stream must be gone before the device is opened again
        drop(stream.take());
        match factory.open(BufferSize::Fixed(target)) {
            Ok(next) => {
                tracing::debug!("Output buffer resized from {} to {} frames", current, target);
                stream = Some(next);
                current = target;
                last_failed = None;
            }
            Err(e) => {
                tracing::warn!("Output buffer of {} frames rejected: {}", target, e);
                last_failed = Some(target);
                match factory.open_preferred(current) {
                    Ok((next, frames)) => {
                        stream = Some(next);
                        current = frames;
                    }
                    Err(e) => {
                        let _ = factory.error_tx.try_send(e);
                        break;
                    }
                }
            }
        }
        opened.store(current, Ordering::Relaxed);
    }
}

/// Size to reopen the stream with, if any. `requested` is what the tuner
/// applied, `opened` what the stream runs with (0 for the device default).
/// A size the device already rejected is not retried until the request
/// moves on.
fn resize_target(requested: u32, opened: u32, last_failed: Option<u32>) -> Option<u32> {
    if requested == 0 || requested == opened || Some(requested) == last_failed {
        return None;
    }
    Some(requested)
}

/// Everything needed to (re)open the output stream on the same device
struct StreamFactory {
    device: cpal::Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    renderer: SharedRenderer,
    error_tx: Sender<AudioError>,
}

impl StreamFactory {
    /// Open with a fixed size, falling back to the device default. Returns
    /// the opened size, 0 for the default.
    fn open_preferred(&self, frames: u32) -> Result<(cpal::Stream, u32), AudioError> {
        if frames > 0 {
            match self.open(BufferSize::Fixed(frames)) {
                Ok(stream) => return Ok((stream, frames)),
                Err(e) => {
                    tracing::warn!("Fixed buffer of {} frames rejected, using device default: {}", frames, e);
                }
            }
        }
        self.open(BufferSize::Default).map(|stream| (stream, 0))
    }

    /// Build and start a stream
    fn open(&self, buffer_size: BufferSize) -> Result<cpal::Stream, AudioError> {
        let config = StreamConfig {
            buffer_size,
            ..self.config.clone()
        };
        let renderer = self.renderer.clone();
        let error_tx = self.error_tx.clone();
        let channels = config.channels as usize;

        let stream = match self.sample_format {
            SampleFormat::I16 => build_output::<i16>(&self.device, &config, renderer, channels, error_tx),
            SampleFormat::F32 => build_output::<f32>(&self.device, &config, renderer, channels, error_tx),
            SampleFormat::U16 => build_output::<u16>(&self.device, &config, renderer, channels, error_tx),
            other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
        }
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;
        Ok(stream)
    }
}

/// Burst and capacity in frames: 2ms and 100ms, within what the device allows
fn buffer_limits(supported: &SupportedBufferSize, sample_rate: u32) -> (u32, u32) {
    let burst = (sample_rate / 500).max(1);
    let capacity = (sample_rate / 10).max(burst);
    match *supported {
        SupportedBufferSize::Range { min, max } => {
            let max = max.max(min);
            let burst = burst.clamp(min, max);
            (burst, capacity.clamp(burst, max))
        }
        SupportedBufferSize::Unknown => (burst, capacity),
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    renderer: SharedRenderer,
    channels: usize,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<i16>,
{
    let mut scratch = vec![0i16; SCRATCH_FRAMES * channels.max(1)];

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // Only contended while a replaced stream is being torn down
            let Some(mut renderer) = renderer.try_lock() else {
                data.fill(T::from_sample_(0i16));
                return;
            };
            for chunk in data.chunks_mut(scratch.len()) {
                let rendered = &mut scratch[..chunk.len()];
                renderer.render(rendered, channels);
                for (out, &sample) in chunk.iter_mut().zip(rendered.iter()) {
                    *out = T::from_sample_(sample);
                }
            }
        },
        move |err| {
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_limits_unknown() {
        assert_eq!(buffer_limits(&SupportedBufferSize::Unknown, 48000), (96, 4800));
    }

    #[test]
    fn test_buffer_limits_clamped() {
        let range = SupportedBufferSize::Range { min: 128, max: 1024 };
        assert_eq!(buffer_limits(&range, 48000), (128, 1024));

        let range = SupportedBufferSize::Range { min: 16, max: 8192 };
        assert_eq!(buffer_limits(&range, 44100), (88, 4410));
    }

    fn info(mode: LatencyMode) -> StreamInfo {
        StreamInfo {
            sharing_mode: SharingMode::Shared,
            performance_mode: mode,
            frames_per_burst: 96,
            buffer_capacity_in_frames: 4800,
            channels: 2,
            sample_rate: 48000,
        }
    }

    #[test]
    fn test_initial_buffer_frames_per_mode() {
        assert_eq!(initial_buffer_frames(&info(LatencyMode::LowLatency)), 96);
        assert_eq!(initial_buffer_frames(&info(LatencyMode::Normal)), 2400);
        assert_eq!(initial_buffer_frames(&info(LatencyMode::PowerSaving)), 4800);
    }

    #[test]
    fn test_resize_follows_applied_size() {
        // Nothing applied yet, or already running at that size
        assert_eq!(resize_target(0, 96, None), None);
        assert_eq!(resize_target(96, 96, None), None);

        // Tuner grew the buffer after an underrun
        assert_eq!(resize_target(192, 96, None), Some(192));
        // Device default stream picks up the first fixed size
        assert_eq!(resize_target(96, 0, None), Some(96));
    }

    #[test]
    fn test_rejected_size_is_not_retried() {
        assert_eq!(resize_target(192, 96, Some(192)), None);
        // A later request is tried again
        assert_eq!(resize_target(288, 96, Some(192)), Some(288));
    }
}

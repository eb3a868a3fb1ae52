//! Output latency tuning
//!
//! A tuner sees the buffer health after every callback and may recommend
//! a new output buffer size. The render engine applies recommendations
//! best-effort through [`StreamControl`](crate::audio::stream::StreamControl).

use crate::audio::render::RenderState;
use crate::config::LatencyMode;

/// Buffer health reported after each callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHealth {
    pub state: RenderState,
    /// Packets queued after the callback
    pub fill: usize,
    pub capacity: usize,
    /// Total underruns so far
    pub underruns: u64,
}

/// Recommends output buffer sizes. Called on the real-time thread, so
/// implementations must not block or allocate.
pub trait LatencyTuner: Send {
    fn tune(&mut self, health: &BufferHealth, current_frames: u32) -> Option<u32>;
}

/// Grows by one burst per underrun, never shrinks
#[derive(Debug, Clone)]
pub struct BurstTuner {
    frames_per_burst: u32,
    max_frames: u32,
    seen_underruns: u64,
    started: bool,
}

impl BurstTuner {
    /// Drops to one burst on the first callback
    pub fn new(frames_per_burst: u32, max_frames: u32) -> Self {
        let frames_per_burst = frames_per_burst.max(1);
        Self {
            frames_per_burst,
            max_frames: max_frames.max(frames_per_burst),
            seen_underruns: 0,
            started: false,
        }
    }

    /// Keeps the opening size and only grows from there
    pub fn growing(frames_per_burst: u32, max_frames: u32) -> Self {
        Self {
            started: true,
            ..Self::new(frames_per_burst, max_frames)
        }
    }
}

impl LatencyTuner for BurstTuner {
    fn tune(&mut self, health: &BufferHealth, current_frames: u32) -> Option<u32> {
        if !self.started {
            self.started = true;
            self.seen_underruns = health.underruns;
            return (current_frames != self.frames_per_burst).then_some(self.frames_per_burst);
        }

        if health.underruns <= self.seen_underruns {
            return None;
        }
        self.seen_underruns = health.underruns;

        let next = current_frames
            .saturating_add(self.frames_per_burst)
            .min(self.max_frames);
        (next != current_frames).then_some(next)
    }
}

/// Leaves the buffer size alone
#[derive(Debug, Clone, Default)]
pub struct FixedLatency;

impl LatencyTuner for FixedLatency {
    fn tune(&mut self, _health: &BufferHealth, _current_frames: u32) -> Option<u32> {
        None
    }
}

/// Tuner matching a latency mode
pub fn tuner_for(mode: LatencyMode, frames_per_burst: u32, max_frames: u32) -> Box<dyn LatencyTuner> {
    match mode {
        LatencyMode::LowLatency => Box::new(BurstTuner::new(frames_per_burst, max_frames)),
        LatencyMode::Normal => Box::new(BurstTuner::growing(frames_per_burst, max_frames)),
        LatencyMode::PowerSaving => Box::new(FixedLatency),
    }
}

//! Output stream seam
//!
//! The render engine only needs to read and request the output buffer
//! size; everything else about the platform stream is read-only metadata
//! for diagnostics.

use serde::Serialize;

use crate::config::LatencyMode;

/// Whether the device is shared with other applications. cpal only
/// opens shared streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingMode {
    Shared,
}

/// Read-only description of the opened output stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub sharing_mode: SharingMode,
    pub performance_mode: LatencyMode,
    pub frames_per_burst: u32,
    pub buffer_capacity_in_frames: u32,
    pub channels: u16,
    pub sample_rate: u32,
}

/// Buffer sizing of a platform output stream
pub trait StreamControl: Send {
    /// Current buffer size in frames
    fn buffer_size_in_frames(&self) -> u32;

    /// Request a new buffer size; returns the size actually in effect
    fn set_buffer_size_in_frames(&mut self, frames: u32) -> u32;

    fn info(&self) -> &StreamInfo;
}

/// Stream control that clamps requests to `[frames_per_burst, capacity]`.
///
/// Used for backends that cannot resize a running stream: the request is
/// only recorded here. The cpal output thread watches the applied size and
/// reopens the device stream with it.
#[derive(Debug, Clone)]
pub struct ClampedStream {
    info: StreamInfo,
    current: u32,
}

impl ClampedStream {
    pub fn new(info: StreamInfo, initial_frames: u32) -> Self {
        let mut stream = Self { info, current: 0 };
        stream.current = stream.clamp(initial_frames);
        stream
    }

    fn clamp(&self, frames: u32) -> u32 {
        let min = self.info.frames_per_burst.max(1);
        let max = self.info.buffer_capacity_in_frames.max(min);
        frames.clamp(min, max)
    }
}

impl StreamControl for ClampedStream {
    fn buffer_size_in_frames(&self) -> u32 {
        self.current
    }

    fn set_buffer_size_in_frames(&mut self, frames: u32) -> u32 {
        self.current = self.clamp(frames);
        self.current
    }

    fn info(&self) -> &StreamInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StreamInfo {
        StreamInfo {
            sharing_mode: SharingMode::Shared,
            performance_mode: LatencyMode::LowLatency,
            frames_per_burst: 96,
            buffer_capacity_in_frames: 960,
            channels: 2,
            sample_rate: 48000,
        }
    }

    #[test]
    fn test_requests_are_clamped() {
        let mut stream = ClampedStream::new(info(), 10);
        assert_eq!(stream.buffer_size_in_frames(), 96);
        assert_eq!(stream.set_buffer_size_in_frames(480), 480);
        assert_eq!(stream.set_buffer_size_in_frames(10_000), 960);
        assert_eq!(stream.buffer_size_in_frames(), 960);
    }

    #[test]
    fn test_info_reports_shared_stream() {
        let json = serde_json::to_value(info()).unwrap();
        assert_eq!(json["sharing_mode"], "shared");
        assert_eq!(json["performance_mode"], "low_latency");
    }
}

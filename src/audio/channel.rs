//! Channel masking and up/down-mixing
//!
//! Active source channels are the mask bits below the packet's channel
//! count, in ascending order. With `a` active channels and `out` output
//! channels:
//!
//! - `out >= a`: output channel `i` takes active channel `i % a`, so equal
//!   counts pass through and mono is duplicated onto every output.
//! - `out < a`: output channel `i` is the truncating integer mean of the
//!   active channels `j` with `j % out == i`; a mono output is the mean of
//!   all active channels, `(L + R) / 2` for stereo.

use crate::constants::MAX_CHANNELS;

/// Mapping from packet channels to output channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    active: [u8; MAX_CHANNELS as usize],
    num_active: usize,
    num_channel: usize,
}

impl ChannelMap {
    /// Build from the packet channel count and channel mask.
    ///
    /// Channels beyond `MAX_CHANNELS` and mask bits beyond `num_channel` are
    /// ignored.
    pub fn new(num_channel: u16, mask_channel: u32) -> Self {
        let num_channel = (num_channel as usize).min(MAX_CHANNELS as usize);
        let mut active = [0u8; MAX_CHANNELS as usize];
        let mut num_active = 0;
        for ch in 0..num_channel {
            if mask_channel & (1 << ch) != 0 {
                active[num_active] = ch as u8;
                num_active += 1;
            }
        }
        Self {
            active,
            num_active,
            num_channel,
        }
    }

    /// Channels per source frame
    pub fn source_channels(&self) -> usize {
        self.num_channel
    }

    /// Channels selected by the mask
    pub fn active_channels(&self) -> usize {
        self.num_active
    }

    /// Fill one output frame. `sample` returns the sample of a source channel
    /// in the current source frame.
    #[inline]
    pub fn map_frame(&self, sample: impl Fn(usize) -> i16, out: &mut [i16]) {
        let a = self.num_active;
        let n_out = out.len();
        if a == 0 {
            out.fill(0);
            return;
        }

        if n_out >= a {
            for (i, o) in out.iter_mut().enumerate() {
                *o = sample(self.active[i % a] as usize);
            }
        } else {
            for (i, o) in out.iter_mut().enumerate() {
                let mut sum = 0i32;
                let mut count = 0i32;
                let mut j = i;
                while j < a {
                    sum += sample(self.active[j] as usize) as i32;
                    count += 1;
                    j += n_out;
                }
                *o = (sum / count) as i16;
            }
        }
    }

    /// Adapt whole interleaved buffers. Processes as many frames as both
    /// sides hold and returns that count.
    pub fn adapt(&self, src: &[i16], out: &mut [i16], num_output_channel: usize) -> usize {
        if self.num_channel == 0 || num_output_channel == 0 {
            return 0;
        }
        let frames = (src.len() / self.num_channel).min(out.len() / num_output_channel);
        for (frame, dst) in out
            .chunks_exact_mut(num_output_channel)
            .take(frames)
            .enumerate()
        {
            let base = frame * self.num_channel;
            self.map_frame(|ch| src[base + ch], dst);
        }
        frames
    }
}

//! Audio subsystem: jitter buffer, render engine and output

pub mod buffer;
pub mod channel;
pub mod device;
pub mod playback;
pub mod render;
pub mod stream;
pub mod tuner;

pub use buffer::{Packet, PacketBuffer, SharedPacketBuffer};
pub use channel::ChannelMap;
pub use device::{find_output_device, list_output_devices, AudioDevice};
pub use playback::AudioPlayback;
pub use render::{AudioRenderer, RenderEngine, RenderState};
pub use stream::{ClampedStream, StreamControl, StreamInfo};
pub use tuner::{BurstTuner, FixedLatency, LatencyTuner};

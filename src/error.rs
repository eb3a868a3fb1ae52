//! Error types for the receiver

use thiserror::Error;

/// Main error type for the receiver
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Audio output errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Receiver thread failed: {0}")]
    Thread(String),
}

/// Invalid construction parameters
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MTU must be a positive multiple of 2 bytes, got {0}")]
    InvalidMtu(usize),

    #[error("Channel count must be between 1 and {max}, got {got}")]
    InvalidChannelCount { got: u16, max: u16 },

    #[error("MTU of {mtu} bytes does not hold a whole number of {channels}-channel frames")]
    PartialFrame { mtu: usize, channels: u16 },

    #[error("Channel mask {mask:#x} selects no channel out of {channels}")]
    EmptyChannelMask { mask: u32, channels: u16 },

    #[error("Sample rate must be positive")]
    InvalidSampleRate,

    #[error("Maximum latency must be positive")]
    InvalidMaxLatency,

    #[error("Target latency {target_ms}ms exceeds maximum latency {max_ms}ms")]
    TargetAboveMax { target_ms: u32, max_ms: u32 },

    #[error("Idle timeout must be positive")]
    InvalidIdleTimeout,

    #[error("Concealment fade must span at least one callback")]
    InvalidFade,

    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Result type alias for the receiver
pub type Result<T> = std::result::Result<T, Error>;

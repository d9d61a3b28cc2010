//! Audio backend error types

use thiserror::Error;

/// Errors that can occur while opening the output device
#[derive(Error, Debug)]
pub enum AudioError {
    /// The host has no default output device
    #[error("No default audio output device")]
    NoDefaultDevice,

    /// Failed to query or pick a device configuration
    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    /// The device offers no f32 stereo output
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    /// The device can't run at the engine's sample rate
    #[error("Device does not support {engine}Hz (range {min}..={max}Hz)")]
    SampleRateMismatch { engine: u32, min: u32, max: u32 },

    /// Failed to build the output stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start the output stream
    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;

//! Effect unit error types

use thiserror::Error;

use super::EffectKind;

/// Errors that can occur while constructing effect units
///
/// These never reach the control API: the pool absorbs them and runs with
/// reduced capacity.
#[derive(Error, Debug)]
pub enum EffectError {
    /// Sample rate the unit can't run at
    #[error("Invalid sample rate for {kind} unit: {rate}Hz")]
    InvalidSampleRate { kind: EffectKind, rate: u32 },

    /// Delay buffer length that can't be allocated
    #[error("Invalid maximum delay time: {0}s")]
    InvalidMaxDelay(f32),

    /// Block size the unit can't pre-allocate for
    #[error("Invalid block size for {kind} unit: {frames} frames")]
    InvalidBlockSize { kind: EffectKind, frames: usize },

    /// Unit kind disabled or unavailable on this host
    #[error("{kind} units are unavailable: {reason}")]
    Unsupported { kind: EffectKind, reason: String },
}

/// Result type for effect unit construction
pub type EffectResult<T> = Result<T, EffectError>;

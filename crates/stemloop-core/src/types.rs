//! Common types for Stemloop
//!
//! This module contains the fundamental audio types used throughout the
//! looper core: stereo samples and buffers, channel identities and the
//! decoded stems the grid plays.

use std::ops::Index;

use serde::{Deserialize, Serialize};

/// Default sample rate used throughout Stemloop (48kHz)
/// The actual rate is taken from [`crate::config::LooperConfig`] at runtime.
pub const SAMPLE_RATE: u32 = 48000;

/// Audio sample type (32-bit float for processing)
pub type Sample = f32;

/// A single stereo sample (left and right channels)
///
/// Uses `#[repr(C)]` to ensure predictable memory layout: [left, right].
/// This enables zero-copy conversion between `&[StereoSample]` and `&[f32]`
/// (interleaved format) using bytemuck, which the pitch units rely on.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    /// Create a new stereo sample
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    /// Create a silent stereo sample
    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Create a mono sample (same value in both channels)
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Get the peak amplitude (max of abs(left), abs(right))
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

/// Block of stereo frames
///
/// The engine allocates these once at the largest block it will see and
/// renders into sub-slices afterwards.
#[derive(Debug, Clone, Default)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    pub fn from_vec(samples: Vec<StereoSample>) -> Self {
        Self { samples }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// Interleaved `[L, R, L, R, ...]` view without copying
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.samples)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StereoSample> {
        self.samples.iter()
    }

    /// Largest absolute value on either side
    pub fn peak(&self) -> Sample {
        self.samples.iter().map(|s| s.peak()).fold(0.0, Sample::max)
    }
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

/// Grid channel identifier (one per active grid cell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Category tag of a stem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StemKind {
    Drums,
    Bass,
    Melody,
    Vocals,
    Fx,
    #[default]
    Other,
}

/// Decoded, immutable stem audio
///
/// Provided by an external loader. The core never mutates a stem; it is
/// shared with the render thread through `basedrop::Shared`.
#[derive(Debug, Clone)]
pub struct Stem {
    /// Display name
    pub name: String,
    /// Category tag
    pub kind: StemKind,
    /// Native tempo of the material
    pub bpm: f64,
    /// Sample rate the audio was decoded at
    pub sample_rate: u32,
    /// Decoded audio (empty when decoding failed or hasn't happened yet)
    pub audio: StereoBuffer,
}

impl Stem {
    /// Create a new stem from decoded audio
    pub fn new(
        name: impl Into<String>,
        kind: StemKind,
        bpm: f64,
        sample_rate: u32,
        audio: StereoBuffer,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            bpm,
            sample_rate,
            audio,
        }
    }

    /// Whether the stem carries any decoded audio
    pub fn has_audio(&self) -> bool {
        !self.audio.is_empty()
    }

    /// Length in frames
    pub fn len_frames(&self) -> usize {
        self.audio.len()
    }
}

//! Per-channel parameters and playback state

use serde::{Deserialize, Serialize};

use crate::effect::EffectKind;
use crate::engine::{SharedStem, UnitRoute};
use crate::mapping::{
    cell_feedback_from_percent, delay_normalized_to_ms, filter_from_normalized,
    pitch_normalized_to_ratio, FilterSetting, CELL_FEEDBACK_MAX_PERCENT, PITCH_KNOB_RANGE,
};
use crate::pool::UnitHandle;

/// Shortest loop, as a fraction of the stem (1/64)
pub const MIN_LOOP_FRACTION: f32 = 1.0 / 64.0;

/// A channel parameter the grid can change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// Output level (0..1)
    Volume,
    /// Portion of the stem that loops (0..1)
    LoopFraction,
    /// Filter knob (-1 low-pass .. 0 bypass .. 1 high-pass)
    Filter,
    /// Delay time knob (0..1)
    DelayTime,
    /// Delay feedback in percent (0..90)
    DelayFeedback,
    /// Delay wet amount (0..1)
    DelayWet,
    /// Pitch knob (-100..100)
    Pitch,
}

impl ParameterKind {
    pub const ALL: [ParameterKind; 7] = [
        ParameterKind::Volume,
        ParameterKind::LoopFraction,
        ParameterKind::Filter,
        ParameterKind::DelayTime,
        ParameterKind::DelayFeedback,
        ParameterKind::DelayWet,
        ParameterKind::Pitch,
    ];

    /// Accepted value range
    pub fn range(&self) -> (f32, f32) {
        match self {
            ParameterKind::Volume => (0.0, 1.0),
            ParameterKind::LoopFraction => (MIN_LOOP_FRACTION, 1.0),
            ParameterKind::Filter => (-1.0, 1.0),
            ParameterKind::DelayTime => (0.0, 1.0),
            ParameterKind::DelayFeedback => (0.0, CELL_FEEDBACK_MAX_PERCENT),
            ParameterKind::DelayWet => (0.0, 1.0),
            ParameterKind::Pitch => (-PITCH_KNOB_RANGE, PITCH_KNOB_RANGE),
        }
    }
}

/// Control values of one grid cell, in knob units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelParams {
    pub volume: f32,
    pub loop_fraction: f32,
    pub filter: f32,
    pub delay_time: f32,
    pub delay_feedback: f32,
    pub delay_wet: f32,
    pub pitch: f32,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            loop_fraction: 1.0,
            filter: 0.0,
            delay_time: 0.5,
            delay_feedback: 0.0,
            delay_wet: 0.0,
            pitch: 0.0,
        }
    }
}

impl ChannelParams {
    pub fn get(&self, kind: ParameterKind) -> f32 {
        match kind {
            ParameterKind::Volume => self.volume,
            ParameterKind::LoopFraction => self.loop_fraction,
            ParameterKind::Filter => self.filter,
            ParameterKind::DelayTime => self.delay_time,
            ParameterKind::DelayFeedback => self.delay_feedback,
            ParameterKind::DelayWet => self.delay_wet,
            ParameterKind::Pitch => self.pitch,
        }
    }

    /// Store a value clamped to the parameter's range and return it
    ///
    /// Non-finite values are ignored.
    pub fn set(&mut self, kind: ParameterKind, value: f32) -> f32 {
        if !value.is_finite() {
            return self.get(kind);
        }
        let (min, max) = kind.range();
        let value = value.clamp(min, max);
        let field = match kind {
            ParameterKind::Volume => &mut self.volume,
            ParameterKind::LoopFraction => &mut self.loop_fraction,
            ParameterKind::Filter => &mut self.filter,
            ParameterKind::DelayTime => &mut self.delay_time,
            ParameterKind::DelayFeedback => &mut self.delay_feedback,
            ParameterKind::DelayWet => &mut self.delay_wet,
            ParameterKind::Pitch => &mut self.pitch,
        };
        *field = value;
        value
    }

    /// Copy with every value clamped to its range
    pub fn clamped(mut self) -> Self {
        for kind in ParameterKind::ALL {
            let value = self.get(kind);
            self.set(kind, if value.is_finite() { value } else { 0.0 });
        }
        self
    }

    /// Whether the current values need a pooled unit of `kind`
    pub fn needs(&self, kind: EffectKind) -> bool {
        match kind {
            EffectKind::Delay => self.delay_wet > 0.0,
            EffectKind::Filter => self.filter != 0.0,
            EffectKind::Pitch => self.pitch != 0.0,
        }
    }

    pub fn delay_seconds(&self) -> f32 {
        delay_normalized_to_ms(self.delay_time) / 1000.0
    }

    pub fn feedback(&self) -> f32 {
        cell_feedback_from_percent(self.delay_feedback)
    }

    pub fn filter_setting(&self) -> FilterSetting {
        filter_from_normalized(self.filter)
    }

    pub fn pitch_ratio(&self) -> f32 {
        pitch_normalized_to_ratio(self.pitch)
    }
}

/// Lifecycle of a channel's playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Registered but silent
    Stopped,
    /// Start scheduled at an engine frame
    Starting { at: u64 },
    Playing,
    /// Stop scheduled at an engine frame
    Stopping { at: u64 },
}

/// What an external loader hands over for a grid cell
#[derive(Clone)]
pub struct ChannelSpec {
    pub stem: SharedStem,
    pub params: ChannelParams,
}

/// Control-side record of a registered channel
pub(crate) struct Channel {
    pub stem: SharedStem,
    pub params: ChannelParams,
    pub state: PlaybackState,
    /// Engine voice slot
    pub voice: usize,
    /// A `StartVoice` was sent and no stop followed yet
    pub voice_live: bool,
    /// Frame the voice's last fade-out ends; it may not be reused before
    pub silent_at: u64,
    pub delay: Option<UnitHandle>,
    pub filter: Option<UnitHandle>,
    pub pitch: Option<UnitHandle>,
}

impl Channel {
    pub fn new(stem: SharedStem, params: ChannelParams, voice: usize) -> Self {
        Self {
            stem,
            params,
            state: PlaybackState::Stopped,
            voice,
            voice_live: false,
            silent_at: 0,
            delay: None,
            filter: None,
            pitch: None,
        }
    }

    pub fn unit(&self, kind: EffectKind) -> Option<&UnitHandle> {
        match kind {
            EffectKind::Delay => self.delay.as_ref(),
            EffectKind::Filter => self.filter.as_ref(),
            EffectKind::Pitch => self.pitch.as_ref(),
        }
    }

    pub fn unit_slot(&mut self, kind: EffectKind) -> &mut Option<UnitHandle> {
        match kind {
            EffectKind::Delay => &mut self.delay,
            EffectKind::Filter => &mut self.filter,
            EffectKind::Pitch => &mut self.pitch,
        }
    }

    pub fn route(&self) -> UnitRoute {
        UnitRoute {
            filter: self.filter.as_ref().map(UnitHandle::unit_ref),
            pitch: self.pitch.as_ref().map(UnitHandle::unit_ref),
            delay: self.delay.as_ref().map(UnitHandle::unit_ref),
        }
    }

    /// Loop length in stem frames for the current loop fraction
    pub fn loop_frames(&self) -> usize {
        let len = self.stem.len_frames() as f64;
        ((len * self.params.loop_fraction as f64).round() as usize).max(1)
    }

    /// Delay send level the voice should use
    pub fn send_level(&self) -> f32 {
        if self.delay.is_some() {
            self.params.delay_wet
        } else {
            0.0
        }
    }
}

/// Program a freshly assigned unit with a channel's values
pub(crate) fn configure_unit(handle: &UnitHandle, params: &ChannelParams) {
    if let Some(delay) = handle.params.as_delay() {
        delay.delay_time.set_now(params.delay_seconds());
        delay.feedback.set_now(params.feedback());
    }
    if let Some(filter) = handle.params.as_filter() {
        filter.apply(params.filter_setting());
    }
    if let Some(pitch) = handle.params.as_pitch() {
        pitch.ratio.set_now(params.pitch_ratio());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StemCollector;
    use crate::mapping::FilterType;
    use crate::types::{Stem, StemKind, StereoBuffer};

    #[test]
    fn test_set_clamps() {
        let mut params = ChannelParams::default();
        assert_eq!(params.set(ParameterKind::DelayFeedback, 150.0), 90.0);
        assert_eq!(params.set(ParameterKind::Pitch, -500.0), -100.0);
        assert_eq!(params.set(ParameterKind::Volume, f32::NAN), 1.0);
        assert!((params.feedback() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_unit_requirements() {
        let mut params = ChannelParams::default();
        for kind in EffectKind::ALL {
            assert!(!params.needs(kind));
        }
        params.delay_wet = 0.3;
        params.filter = -0.2;
        params.pitch = 10.0;
        for kind in EffectKind::ALL {
            assert!(params.needs(kind));
        }
        assert_eq!(params.filter_setting().filter_type, FilterType::LowPass);
        assert!(params.pitch_ratio() > 1.0);
    }

    #[test]
    fn test_clamped_copy() {
        let params = ChannelParams {
            loop_fraction: 3.0,
            filter: f32::INFINITY,
            ..ChannelParams::default()
        }
        .clamped();
        assert_eq!(params.loop_fraction, 1.0);
        assert_eq!(params.filter, 0.0);
    }

    #[test]
    fn test_loop_fraction_has_a_floor() {
        let mut params = ChannelParams::default();
        assert_eq!(params.set(ParameterKind::LoopFraction, 0.0), MIN_LOOP_FRACTION);
        assert_eq!(params.loop_fraction, MIN_LOOP_FRACTION);

        let collector = StemCollector::spawn().unwrap();
        let stem = collector.share(Stem::new(
            "bar",
            StemKind::Drums,
            120.0,
            48_000,
            StereoBuffer::silence(96_000),
        ));
        let channel = Channel::new(stem, params, 0);
        assert_eq!(channel.loop_frames(), 1_500);
    }

    #[test]
    fn test_params_from_yaml() {
        let params: ChannelParams = serde_yaml::from_str("volume: 0.5\ndelay_wet: 0.25\n").unwrap();
        assert_eq!(params.volume, 0.5);
        assert_eq!(params.delay_wet, 0.25);
        assert_eq!(params.loop_fraction, 1.0);
    }
}

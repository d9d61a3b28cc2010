//! Engine, pool and timing settings

use serde::{Deserialize, Serialize};

use crate::clock::{BEATS_PER_BAR, DEFAULT_BPM, MAX_BPM, MIN_BPM};
use crate::effect::DEFAULT_MAX_DELAY_SECONDS;
use crate::engine::COMMAND_QUEUE_CAPACITY;
use crate::types::SAMPLE_RATE;

/// Looper settings
///
/// Every field has a default, so a partial YAML file only overrides what it
/// names:
///
/// ```yaml
/// sample_rate: 44100
/// pool_capacity: 4
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LooperConfig {
    /// Engine sample rate in Hz
    pub sample_rate: u32,
    /// Frames rendered per engine block
    pub block_size: usize,
    /// Units per effect kind
    pub pool_capacity: usize,
    /// Longest delay a unit can hold
    pub max_delay_seconds: f32,
    /// Fade-in / fade-out length around starts, stops and restarts
    pub fade_ms: f32,
    /// Tempo until a channel or the caller sets one
    pub default_bpm: f64,
    /// Fixed at 4; other values are coerced
    pub beats_per_bar: u32,
    /// How far ahead of its frame an engine command is sent
    pub schedule_lookahead_ms: f32,
    /// Voice slots (simultaneously registered channels)
    pub max_channels: usize,
    /// Capacity of the control → engine command queue
    pub command_queue_capacity: usize,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            block_size: 128,
            pool_capacity: 8,
            max_delay_seconds: DEFAULT_MAX_DELAY_SECONDS,
            fade_ms: 5.0,
            default_bpm: DEFAULT_BPM,
            beats_per_bar: BEATS_PER_BAR,
            schedule_lookahead_ms: 25.0,
            max_channels: 64,
            command_queue_capacity: COMMAND_QUEUE_CAPACITY,
        }
    }
}

impl LooperConfig {
    /// Copy with out-of-range values replaced, logging each correction
    pub fn validated(&self) -> Self {
        let defaults = Self::default();
        let mut config = self.clone();

        if config.sample_rate == 0 {
            log::warn!("sample_rate 0 is invalid, using {}", defaults.sample_rate);
            config.sample_rate = defaults.sample_rate;
        }
        if config.block_size == 0 {
            log::warn!("block_size 0 is invalid, using {}", defaults.block_size);
            config.block_size = defaults.block_size;
        }
        if !(config.max_delay_seconds.is_finite() && config.max_delay_seconds > 0.0) {
            log::warn!(
                "max_delay_seconds {} is invalid, using {}",
                config.max_delay_seconds,
                defaults.max_delay_seconds
            );
            config.max_delay_seconds = defaults.max_delay_seconds;
        }
        if !(config.fade_ms.is_finite() && config.fade_ms >= 0.0) {
            log::warn!("fade_ms {} is invalid, using {}", config.fade_ms, defaults.fade_ms);
            config.fade_ms = defaults.fade_ms;
        }
        if !config.default_bpm.is_finite() {
            config.default_bpm = defaults.default_bpm;
        }
        config.default_bpm = config.default_bpm.clamp(MIN_BPM, MAX_BPM);
        if config.beats_per_bar != BEATS_PER_BAR {
            log::warn!(
                "beats_per_bar is fixed at {}, ignoring {}",
                BEATS_PER_BAR,
                config.beats_per_bar
            );
            config.beats_per_bar = BEATS_PER_BAR;
        }
        if !(config.schedule_lookahead_ms.is_finite() && config.schedule_lookahead_ms >= 0.0) {
            config.schedule_lookahead_ms = defaults.schedule_lookahead_ms;
        }
        if config.max_channels == 0 {
            log::warn!("max_channels 0 is invalid, using {}", defaults.max_channels);
            config.max_channels = defaults.max_channels;
        }
        // Each channel can need a handful of commands in one tick
        config.command_queue_capacity = config
            .command_queue_capacity
            .max(config.max_channels * 4);

        config
    }

    pub fn fade_frames(&self) -> u64 {
        ms_to_frames(self.fade_ms, self.sample_rate)
    }

    pub fn lookahead_frames(&self) -> u64 {
        ms_to_frames(self.schedule_lookahead_ms, self.sample_rate)
    }
}

fn ms_to_frames(ms: f32, sample_rate: u32) -> u64 {
    (ms.max(0.0) as f64 / 1000.0 * sample_rate as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LooperConfig::default();
        assert_eq!(config.pool_capacity, 8);
        assert_eq!(config.beats_per_bar, 4);
        assert_eq!(config.fade_frames(), 240);
        assert_eq!(config.lookahead_frames(), 1200);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: LooperConfig = serde_yaml::from_str("sample_rate: 44100\nfade_ms: 10\n").unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.fade_frames(), 441);
        assert_eq!(config.block_size, 128);
    }

    #[test]
    fn test_validated_coerces() {
        let config = LooperConfig {
            sample_rate: 0,
            beats_per_bar: 3,
            default_bpm: 1000.0,
            max_delay_seconds: -1.0,
            ..LooperConfig::default()
        }
        .validated();
        assert_eq!(config.sample_rate, SAMPLE_RATE);
        assert_eq!(config.beats_per_bar, 4);
        assert_eq!(config.default_bpm, MAX_BPM);
        assert_eq!(config.max_delay_seconds, DEFAULT_MAX_DELAY_SECONDS);
    }
}

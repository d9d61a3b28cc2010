//! Control value mapping
//!
//! Pure, deterministic conversions between the normalized values the grid
//! controls and presets speak (0..1, -1..1, -100..100, percentages) and the
//! physical values the DSP units consume (ms, Hz, ratios). Both directions are
//! provided so that a control can be positioned from a stored physical value
//! and land on exactly the same curve.

/// Shortest delay time reachable from the delay knob (ms)
pub const DELAY_MIN_MS: f32 = 0.1;
/// Longest delay time reachable from the delay knob (ms)
pub const DELAY_MAX_MS: f32 = 2000.0;
const DELAY_SPAN_MS: f32 = 1999.9;

/// Lowest cutoff of either filter sweep (Hz)
pub const FILTER_MIN_HZ: f32 = 20.0;
/// Highest cutoff of either filter sweep (Hz)
pub const FILTER_MAX_HZ: f32 = 8000.0;
/// Fixed resonance used by the filter knob
pub const FILTER_Q: f32 = 3.0;
/// Curve exponent of the low-pass sweep
const LOWPASS_CURVE: f32 = 3.5;

/// Lowest pitch ratio (two octaves down)
pub const PITCH_MIN_RATIO: f32 = 0.25;
/// Highest pitch ratio (two octaves up)
pub const PITCH_MAX_RATIO: f32 = 4.0;
/// Pitch knob extent on either side of center
pub const PITCH_KNOB_RANGE: f32 = 100.0;

/// Feedback ceiling exposed on a grid cell (percent)
pub const CELL_FEEDBACK_MAX_PERCENT: f32 = 90.0;

/// Filter response selected by the filter knob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
    /// Flat response, used as the neutral state of a filter unit
    #[default]
    AllPass,
    LowPass,
    HighPass,
}

impl FilterType {
    /// Stable numeric tag for lock-free storage
    pub fn as_u8(self) -> u8 {
        match self {
            FilterType::AllPass => 0,
            FilterType::LowPass => 1,
            FilterType::HighPass => 2,
        }
    }

    /// Inverse of [`FilterType::as_u8`]; unknown tags read as all-pass
    pub fn from_u8(tag: u8) -> Self {
        match tag {
            1 => FilterType::LowPass,
            2 => FilterType::HighPass,
            _ => FilterType::AllPass,
        }
    }
}

/// Physical filter settings derived from a filter knob position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSetting {
    pub filter_type: FilterType,
    /// Cutoff frequency in Hz (meaningless for all-pass)
    pub frequency: f32,
    /// Resonance (Q)
    pub q: f32,
}

impl FilterSetting {
    /// The neutral (bypass) setting
    pub fn bypass() -> Self {
        Self {
            filter_type: FilterType::AllPass,
            frequency: FILTER_MAX_HZ,
            q: FILTER_Q,
        }
    }
}

/// Map a delay knob position (0..1) to milliseconds
///
/// `ms = 0.1 + n³ × 1999.9`, giving fine resolution at short times.
pub fn delay_normalized_to_ms(normalized: f32) -> f32 {
    let n = normalized.clamp(0.0, 1.0);
    DELAY_MIN_MS + n * n * n * DELAY_SPAN_MS
}

/// Map milliseconds back to a delay knob position (0..1)
pub fn delay_ms_to_normalized(ms: f32) -> f32 {
    let ms = ms.clamp(DELAY_MIN_MS, DELAY_MAX_MS);
    ((ms - DELAY_MIN_MS) / DELAY_SPAN_MS).cbrt()
}

/// Map a filter knob position (-1..1) to a filter setting
///
/// Negative positions select a low-pass sweeping down from 8 kHz, positive
/// positions a high-pass sweeping up from 20 Hz, zero bypasses.
pub fn filter_from_normalized(normalized: f32) -> FilterSetting {
    let n = normalized.clamp(-1.0, 1.0);
    if n > 0.0 {
        FilterSetting {
            filter_type: FilterType::HighPass,
            frequency: FILTER_MIN_HZ * (FILTER_MAX_HZ / FILTER_MIN_HZ).powf(n),
            q: FILTER_Q,
        }
    } else if n < 0.0 {
        FilterSetting {
            filter_type: FilterType::LowPass,
            frequency: FILTER_MAX_HZ * (FILTER_MIN_HZ / FILTER_MAX_HZ).powf(n.abs().powf(LOWPASS_CURVE)),
            q: FILTER_Q,
        }
    } else {
        FilterSetting::bypass()
    }
}

/// Map a filter type and cutoff back to a filter knob position (-1..1)
pub fn filter_to_normalized(filter_type: FilterType, frequency: f32) -> f32 {
    let f = frequency.clamp(FILTER_MIN_HZ, FILTER_MAX_HZ);
    match filter_type {
        FilterType::AllPass => 0.0,
        FilterType::HighPass => (f / FILTER_MIN_HZ).ln() / (FILTER_MAX_HZ / FILTER_MIN_HZ).ln(),
        FilterType::LowPass => {
            let curved = (f / FILTER_MAX_HZ).ln() / (FILTER_MIN_HZ / FILTER_MAX_HZ).ln();
            -curved.max(0.0).powf(1.0 / LOWPASS_CURVE)
        }
    }
}

/// Map a pitch knob position (-100..100) to a playback ratio (0.25..4)
///
/// Two linear segments meet at the center, so `0` is exactly unity.
pub fn pitch_normalized_to_ratio(normalized: f32) -> f32 {
    let n = normalized.clamp(-PITCH_KNOB_RANGE, PITCH_KNOB_RANGE) / PITCH_KNOB_RANGE;
    if n < 0.0 {
        1.0 + n * (1.0 - PITCH_MIN_RATIO)
    } else {
        1.0 + n * (PITCH_MAX_RATIO - 1.0)
    }
}

/// Map a pitch ratio back to a knob position (-100..100)
pub fn pitch_ratio_to_normalized(ratio: f32) -> f32 {
    let r = ratio.clamp(PITCH_MIN_RATIO, PITCH_MAX_RATIO);
    let n = if r < 1.0 {
        (r - 1.0) / (1.0 - PITCH_MIN_RATIO)
    } else {
        (r - 1.0) / (PITCH_MAX_RATIO - 1.0)
    };
    n * PITCH_KNOB_RANGE
}

/// Map a cell feedback percentage to a feedback coefficient
///
/// The grid exposes 0–90 %; the delay line additionally clamps to 0.95.
pub fn cell_feedback_from_percent(percent: f32) -> f32 {
    percent.clamp(0.0, CELL_FEEDBACK_MAX_PERCENT) / 100.0
}

/// Inverse of [`cell_feedback_from_percent`]
pub fn cell_feedback_to_percent(feedback: f32) -> f32 {
    (feedback * 100.0).clamp(0.0, CELL_FEEDBACK_MAX_PERCENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_endpoints() {
        assert!((delay_normalized_to_ms(0.0) - 0.1).abs() < 1e-6);
        assert!((delay_normalized_to_ms(1.0) - 2000.0).abs() < 1e-3);
        assert!((delay_normalized_to_ms(0.5) - (0.1 + 0.125 * 1999.9)).abs() < 1e-3);
        // Out of range input is clamped
        assert!((delay_normalized_to_ms(3.0) - 2000.0).abs() < 1e-3);
    }

    #[test]
    fn test_delay_round_trip() {
        for i in 0..=100 {
            let n = i as f32 / 100.0;
            let ms = delay_normalized_to_ms(n);
            let back = delay_ms_to_normalized(ms);
            assert!((back - n).abs() < 1e-3, "n={} back={}", n, back);
            assert!((delay_normalized_to_ms(back) - ms).abs() < 0.05);
        }
    }

    #[test]
    fn test_filter_regions() {
        assert_eq!(filter_from_normalized(0.0).filter_type, FilterType::AllPass);

        let hp = filter_from_normalized(1.0);
        assert_eq!(hp.filter_type, FilterType::HighPass);
        assert!((hp.frequency - 8000.0).abs() < 0.5);
        assert_eq!(hp.q, 3.0);

        let hp_min = filter_from_normalized(0.001);
        assert!((hp_min.frequency - 20.0).abs() < 0.5);

        let lp = filter_from_normalized(-1.0);
        assert_eq!(lp.filter_type, FilterType::LowPass);
        assert!((lp.frequency - 20.0).abs() < 0.01);

        // The low-pass curve stays near the top for small knob movements
        let lp_small = filter_from_normalized(-0.2);
        assert!(lp_small.frequency > 7800.0);
    }

    #[test]
    fn test_filter_round_trip() {
        for i in 1..=20 {
            let n = i as f32 / 20.0;
            for pos in [n, -n] {
                let setting = filter_from_normalized(pos);
                let back = filter_to_normalized(setting.filter_type, setting.frequency);
                assert!((back - pos).abs() < 1e-3, "pos={} back={}", pos, back);
            }
        }
    }

    #[test]
    fn test_pitch_breakpoint() {
        assert_eq!(pitch_normalized_to_ratio(0.0), 1.0);
        assert!((pitch_normalized_to_ratio(-100.0) - 0.25).abs() < 1e-6);
        assert!((pitch_normalized_to_ratio(100.0) - 4.0).abs() < 1e-6);
        assert!((pitch_normalized_to_ratio(-50.0) - 0.625).abs() < 1e-6);
        assert!((pitch_normalized_to_ratio(50.0) - 2.5).abs() < 1e-6);
        assert_eq!(pitch_ratio_to_normalized(1.0), 0.0);
        assert!((pitch_ratio_to_normalized(2.5) - 50.0).abs() < 1e-4);
        assert!((pitch_ratio_to_normalized(0.625) + 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_cell_feedback_ceiling() {
        assert_eq!(cell_feedback_from_percent(50.0), 0.5);
        assert_eq!(cell_feedback_from_percent(120.0), 0.9);
        assert_eq!(cell_feedback_from_percent(-5.0), 0.0);
        assert_eq!(cell_feedback_to_percent(0.95), 90.0);
    }
}

//! Pooled filter unit - low-pass / high-pass / all-pass

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::automation::{AutomationLane, LaneReader};
use crate::mapping::{FilterSetting, FilterType};
use crate::types::StereoSample;

/// Two-pole (12dB/octave) state-variable filter
struct SvfFilter {
    // State per channel
    ic1eq_l: f32,
    ic2eq_l: f32,
    ic1eq_r: f32,
    ic2eq_r: f32,
    // Coefficients
    k: f32,
    a1: f32,
    a2: f32,
    a3: f32,
    sample_rate: f32,
}

impl SvfFilter {
    fn new(sample_rate: u32) -> Self {
        let mut f = Self {
            ic1eq_l: 0.0,
            ic2eq_l: 0.0,
            ic1eq_r: 0.0,
            ic2eq_r: 0.0,
            k: 0.0,
            a1: 0.0,
            a2: 0.0,
            a3: 0.0,
            sample_rate: sample_rate as f32,
        };
        f.set_params(1000.0, 0.707);
        f
    }

    fn set_params(&mut self, cutoff: f32, q: f32) {
        let nyquist_guard = self.sample_rate * 0.49;
        let cutoff = cutoff.clamp(20.0, nyquist_guard.min(20000.0));
        let q = q.clamp(0.1, 20.0);

        let g = (std::f32::consts::PI * cutoff / self.sample_rate).tan();
        self.k = 1.0 / q;
        self.a1 = 1.0 / (1.0 + g * (g + self.k));
        self.a2 = g * self.a1;
        self.a3 = g * self.a2;
    }

    /// Process one sample of both channels and return the selected response
    #[inline]
    fn process(&mut self, input: StereoSample, response: FilterType) -> StereoSample {
        // Left channel
        let v3_l = input.left - self.ic2eq_l;
        let v1_l = self.a1 * self.ic1eq_l + self.a2 * v3_l;
        let v2_l = self.ic2eq_l + self.a2 * self.ic1eq_l + self.a3 * v3_l;
        self.ic1eq_l = 2.0 * v1_l - self.ic1eq_l;
        self.ic2eq_l = 2.0 * v2_l - self.ic2eq_l;

        // Right channel
        let v3_r = input.right - self.ic2eq_r;
        let v1_r = self.a1 * self.ic1eq_r + self.a2 * v3_r;
        let v2_r = self.ic2eq_r + self.a2 * self.ic1eq_r + self.a3 * v3_r;
        self.ic1eq_r = 2.0 * v1_r - self.ic1eq_r;
        self.ic2eq_r = 2.0 * v2_r - self.ic2eq_r;

        match response {
            FilterType::LowPass => StereoSample::new(v2_l, v2_r),
            FilterType::HighPass => StereoSample::new(
                input.left - self.k * v1_l - v2_l,
                input.right - self.k * v1_r - v2_r,
            ),
            FilterType::AllPass => StereoSample::new(
                input.left - 2.0 * self.k * v1_l,
                input.right - 2.0 * self.k * v1_r,
            ),
        }
    }

    fn reset(&mut self) {
        self.ic1eq_l = 0.0;
        self.ic2eq_l = 0.0;
        self.ic1eq_r = 0.0;
        self.ic2eq_r = 0.0;
    }
}

/// Automatable parameters of a filter unit
#[derive(Debug)]
pub struct FilterParams {
    filter_type: AtomicU8,
    /// Cutoff frequency in Hz
    pub cutoff: Arc<AutomationLane>,
    /// Resonance (Q)
    pub resonance: Arc<AutomationLane>,
    generation: AtomicU32,
}

impl FilterParams {
    pub fn new() -> Self {
        let neutral = FilterSetting::bypass();
        Self {
            filter_type: AtomicU8::new(neutral.filter_type.as_u8()),
            cutoff: AutomationLane::shared(neutral.frequency, 20.0, 20000.0),
            resonance: AutomationLane::shared(neutral.q, 0.1, 20.0),
            generation: AtomicU32::new(0),
        }
    }

    pub fn filter_type(&self) -> FilterType {
        FilterType::from_u8(self.filter_type.load(Ordering::Relaxed))
    }

    pub fn set_filter_type(&self, filter_type: FilterType) {
        self.filter_type.store(filter_type.as_u8(), Ordering::Relaxed);
    }

    /// Apply a complete setting immediately
    pub fn apply(&self, setting: FilterSetting) {
        self.set_filter_type(setting.filter_type);
        self.cutoff.set_now(setting.frequency);
        self.resonance.set_now(setting.q);
    }

    /// Return to the neutral all-pass state
    pub fn reset_to_neutral(&self) {
        self.apply(FilterSetting::bypass());
    }

    pub fn is_neutral(&self) -> bool {
        self.filter_type() == FilterType::AllPass
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}

impl Default for FilterParams {
    fn default() -> Self {
        Self::new()
    }
}

/// Render half of a filter unit
///
/// Cutoff and resonance are evaluated once per block.
pub struct FilterUnit {
    params: Arc<FilterParams>,
    filter: SvfFilter,
    cutoff: LaneReader,
    resonance: LaneReader,
    seen_generation: u32,
}

impl FilterUnit {
    pub fn new(sample_rate: u32) -> Self {
        let params = Arc::new(FilterParams::new());
        Self {
            filter: SvfFilter::new(sample_rate),
            cutoff: LaneReader::new(params.cutoff.clone()),
            resonance: LaneReader::new(params.resonance.clone()),
            seen_generation: params.generation(),
            params,
        }
    }

    pub fn params(&self) -> &Arc<FilterParams> {
        &self.params
    }

    #[inline]
    pub fn sync_generation(&mut self) {
        let generation = self.params.generation();
        if generation != self.seen_generation {
            self.seen_generation = generation;
            self.filter.reset();
        }
    }

    /// Filter `block` in place, block starting at engine frame `start_frame`
    pub fn process(&mut self, block: &mut [StereoSample], start_frame: u64) {
        let cutoff = self.cutoff.refresh().value_at(start_frame);
        let q = self.resonance.refresh().value_at(start_frame);
        let response = self.params.filter_type();

        self.filter.set_params(cutoff, q);
        for sample in block.iter_mut() {
            *sample = self.filter.process(*sample, response);
        }
    }

    pub fn reset(&mut self) {
        self.filter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::filter_from_normalized;
    use crate::types::SAMPLE_RATE;

    fn nyquist_block(len: usize) -> Vec<StereoSample> {
        (0..len)
            .map(|i| StereoSample::mono(if i % 2 == 0 { 1.0 } else { -1.0 }))
            .collect()
    }

    fn mean_abs(block: &[StereoSample]) -> f32 {
        block.iter().map(|s| s.left.abs()).sum::<f32>() / block.len() as f32
    }

    #[test]
    fn test_neutral_is_all_pass() {
        let unit = FilterUnit::new(SAMPLE_RATE);
        assert!(unit.params().is_neutral());
        assert_eq!(unit.params().filter_type(), FilterType::AllPass);
    }

    #[test]
    fn test_lowpass_attenuates_highs() {
        let mut unit = FilterUnit::new(SAMPLE_RATE);
        unit.params().apply(filter_from_normalized(-1.0));

        let mut block = nyquist_block(256);
        unit.process(&mut block, 0);
        assert!(mean_abs(&block[128..]) < 0.05, "LP should attenuate high frequencies");
    }

    #[test]
    fn test_highpass_removes_dc() {
        let mut unit = FilterUnit::new(SAMPLE_RATE);
        unit.params().apply(filter_from_normalized(1.0));

        let mut block = vec![StereoSample::mono(1.0); 4096];
        unit.process(&mut block, 0);
        assert!(block[4095].left.abs() < 0.01);
    }

    #[test]
    fn test_all_pass_keeps_level() {
        let mut unit = FilterUnit::new(SAMPLE_RATE);
        let mut block = vec![StereoSample::mono(1.0); 8192];
        unit.process(&mut block, 0);
        // DC passes an all-pass with unity gain once settled
        assert!((block[8191].left - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_reset_to_neutral() {
        let unit = FilterUnit::new(SAMPLE_RATE);
        unit.params().apply(filter_from_normalized(0.5));
        assert!(!unit.params().is_neutral());
        unit.params().reset_to_neutral();
        assert!(unit.params().is_neutral());
    }
}

//! Pooled feedback delay unit
//!
//! The render half wraps a [`DelayLine`] and evaluates its two automation
//! lanes (delay time, feedback) for every sample, so ramps and modulation are
//! rendered without zipper noise. Output is purely wet; the owner mixes it
//! with the dry signal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::delay_line::{DelayLine, MAX_FEEDBACK};
use crate::automation::{AutomationLane, LaneReader};
use crate::types::StereoSample;

/// Automatable parameters of a delay unit
#[derive(Debug)]
pub struct DelayParams {
    /// Delay time in seconds
    pub delay_time: Arc<AutomationLane>,
    /// Feedback coefficient (0..0.95)
    pub feedback: Arc<AutomationLane>,
    generation: AtomicU32,
}

impl DelayParams {
    pub fn new(max_delay_seconds: f32) -> Self {
        Self {
            delay_time: AutomationLane::shared(0.0, 0.0, max_delay_seconds),
            feedback: AutomationLane::shared(0.0, 0.0, MAX_FEEDBACK),
            generation: AtomicU32::new(0),
        }
    }

    /// Return every parameter to its neutral value (delay 0, feedback 0)
    pub fn reset_to_neutral(&self) {
        self.delay_time.set_now(0.0);
        self.feedback.set_now(0.0);
    }

    /// Whether the parameters currently sit at their neutral values
    pub fn is_neutral(&self) -> bool {
        self.delay_time.target() == 0.0 && self.feedback.target() == 0.0
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}

/// Render half of a delay unit
pub struct DelayUnit {
    params: Arc<DelayParams>,
    line: DelayLine,
    delay_time: LaneReader,
    feedback: LaneReader,
    seen_generation: u32,
}

impl DelayUnit {
    pub fn new(sample_rate: u32, max_delay_seconds: f32) -> Self {
        let params = Arc::new(DelayParams::new(max_delay_seconds));
        Self {
            line: DelayLine::new(sample_rate, max_delay_seconds),
            delay_time: LaneReader::new(params.delay_time.clone()),
            feedback: LaneReader::new(params.feedback.clone()),
            seen_generation: params.generation(),
            params,
        }
    }

    /// Shared parameter handle
    pub fn params(&self) -> &Arc<DelayParams> {
        &self.params
    }

    /// Clear the delay buffers if the unit changed hands since the last block
    #[inline]
    pub fn sync_generation(&mut self) {
        let generation = self.params.generation();
        if generation != self.seen_generation {
            self.seen_generation = generation;
            self.line.reset();
        }
    }

    /// Replace `block` with the wet signal, block starting at engine frame `start_frame`
    pub fn process(&mut self, block: &mut [StereoSample], start_frame: u64) {
        let delay = *self.delay_time.refresh();
        let feedback = *self.feedback.refresh();
        let end_frame = start_frame + block.len() as u64;

        if delay.is_settled_at(start_frame) && feedback.is_settled_at(start_frame) {
            let delay_seconds = delay.value_at(end_frame);
            self.line.set_feedback(feedback.value_at(end_frame));
            self.line.process_block(block, delay_seconds);
        } else {
            self.line.process_block_with(
                block,
                |i| delay.value_at(start_frame + i as u64),
                |i| feedback.value_at(start_frame + i as u64),
            );
        }
    }

    /// Clear the delay buffers
    pub fn reset(&mut self) {
        self.line.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SAMPLE_RATE;

    #[test]
    fn test_neutral_defaults() {
        let unit = DelayUnit::new(SAMPLE_RATE, 2.0);
        assert!(unit.params().is_neutral());
    }

    #[test]
    fn test_lane_drives_delay_time() {
        let mut unit = DelayUnit::new(SAMPLE_RATE, 2.0);
        unit.params().delay_time.set_now(0.0625);

        let mut block = vec![StereoSample::silence(); 4096];
        block[0] = StereoSample::mono(1.0);
        unit.process(&mut block, 0);

        assert!((block[3000].left - 1.0).abs() < 1e-4);
        assert!(block[2999].left.abs() < 1e-4);
    }

    #[test]
    fn test_generation_change_clears_buffers() {
        let mut unit = DelayUnit::new(SAMPLE_RATE, 1.0);
        unit.params().delay_time.set_now(0.01);

        let mut block = vec![StereoSample::mono(1.0); 256];
        unit.process(&mut block, 0);

        unit.params().bump_generation();
        unit.sync_generation();

        let mut block = vec![StereoSample::silence(); 1024];
        unit.process(&mut block, 256);
        assert!(block.iter().all(|s| s.peak() == 0.0));
    }

    #[test]
    fn test_feedback_lane_is_capped() {
        let unit = DelayUnit::new(SAMPLE_RATE, 1.0);
        unit.params().feedback.set_now(2.0);
        assert_eq!(unit.params().feedback.target(), MAX_FEEDBACK);
    }
}

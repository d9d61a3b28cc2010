//! Pooled pitch-shift unit via signalsmith-stretch
//!
//! The transposer itself is opaque: the unit exposes a single ratio parameter
//! (0.25..4) and hands the conversion to signalsmith-stretch, which processes
//! at 1:1 time ratio so only pitch changes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use signalsmith_stretch::Stretch;

use crate::automation::{AutomationLane, LaneReader};
use crate::mapping::{PITCH_MAX_RATIO, PITCH_MIN_RATIO};
use crate::types::{StereoBuffer, StereoSample};

/// Number of channels (stereo)
const CHANNELS: u32 = 2;

/// Automatable parameters of a pitch unit
#[derive(Debug)]
pub struct PitchParams {
    /// Transpose ratio (1.0 = unchanged)
    pub ratio: Arc<AutomationLane>,
    generation: AtomicU32,
}

impl PitchParams {
    pub fn new() -> Self {
        Self {
            ratio: AutomationLane::shared(1.0, PITCH_MIN_RATIO, PITCH_MAX_RATIO),
            generation: AtomicU32::new(0),
        }
    }

    pub fn reset_to_neutral(&self) {
        self.ratio.set_now(1.0);
    }

    pub fn is_neutral(&self) -> bool {
        self.ratio.target() == 1.0
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}

impl Default for PitchParams {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a transpose ratio to semitones
pub fn ratio_to_semitones(ratio: f32) -> f32 {
    12.0 * ratio.clamp(PITCH_MIN_RATIO, PITCH_MAX_RATIO).log2()
}

/// Render half of a pitch unit
pub struct PitchUnit {
    params: Arc<PitchParams>,
    stretcher: Stretch,
    ratio: LaneReader,
    /// Ratio currently programmed into the stretcher
    applied_ratio: f32,
    /// Pre-allocated copy of the input block (the stretcher can't run in place)
    input: StereoBuffer,
    seen_generation: u32,
}

impl PitchUnit {
    /// Create a pitch unit able to process blocks of up to `max_block` frames
    pub fn new(sample_rate: u32, max_block: usize) -> Self {
        let params = Arc::new(PitchParams::new());
        Self {
            stretcher: Stretch::preset_default(CHANNELS, sample_rate),
            ratio: LaneReader::new(params.ratio.clone()),
            applied_ratio: 1.0,
            input: StereoBuffer::silence(max_block),
            seen_generation: params.generation(),
            params,
        }
    }

    pub fn params(&self) -> &Arc<PitchParams> {
        &self.params
    }

    /// Current ratio programmed into the transposer
    pub fn applied_ratio(&self) -> f32 {
        self.applied_ratio
    }

    /// Total processing latency in samples
    pub fn latency_samples(&self) -> usize {
        self.stretcher.input_latency() + self.stretcher.output_latency()
    }

    #[inline]
    pub fn sync_generation(&mut self) {
        let generation = self.params.generation();
        if generation != self.seen_generation {
            self.seen_generation = generation;
            self.reset();
        }
    }

    /// Transpose `block` in place, block starting at engine frame `start_frame`
    pub fn process(&mut self, block: &mut [StereoSample], start_frame: u64) {
        let ratio = self.ratio.refresh().value_at(start_frame);
        if ratio != self.applied_ratio {
            self.applied_ratio = ratio;
            self.stretcher
                .set_transpose_factor_semitones(ratio_to_semitones(ratio), None);
        }

        let len = block.len().min(self.input.len());
        let block = &mut block[..len];
        self.input.as_mut_slice()[..len].copy_from_slice(block);

        let input = &self.input.as_interleaved()[..len * 2];
        let output: &mut [f32] = bytemuck::cast_slice_mut(block);
        output.fill(0.0);
        self.stretcher.process(input, output);
    }

    pub fn reset(&mut self) {
        self.stretcher.reset();
        self.applied_ratio = 1.0;
        self.stretcher.set_transpose_factor_semitones(0.0, None);
    }
}

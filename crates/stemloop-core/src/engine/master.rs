//! Master bus: the mix-level filter, pitch and delay chain
//!
//! Always present and never pooled. The control half ([`MasterBus`]) writes
//! automation; the render half ([`MasterChain`]) runs on the audio thread:
//!
//! ```text
//! mix ──► filter ──► pitch (only when ratio ≠ 1) ──► dry + wet × delay ──► volume
//! ```

use std::sync::Arc;

use crate::automation::{AutomationLane, LaneReader};
use crate::effect::{DelayParams, DelayUnit, FilterParams, FilterUnit, PitchParams, PitchUnit};
use crate::mapping::{
    cell_feedback_from_percent, delay_normalized_to_ms, filter_from_normalized,
    pitch_normalized_to_ratio, FilterType,
};
use crate::types::{StereoBuffer, StereoSample};

/// Master delay time before anything sets it (normalized knob position)
const DEFAULT_DELAY_KNOB: f32 = 0.5;
/// Highest master volume
pub const MAX_MASTER_VOLUME: f32 = 1.0;

/// Create the two halves of the master bus
pub fn master_bus(
    sample_rate: u32,
    max_delay_seconds: f32,
    max_block: usize,
    ramp_frames: u64,
) -> (MasterBus, MasterChain) {
    let chain = MasterChain::new(sample_rate, max_delay_seconds, max_block);
    let bus = MasterBus {
        filter: chain.filter.params().clone(),
        pitch: chain.pitch.params().clone(),
        delay: chain.delay.params().clone(),
        wet: chain.wet.lane().clone(),
        volume: chain.volume.lane().clone(),
        ramp_frames,
    };
    bus.delay
        .delay_time
        .set_now(delay_normalized_to_ms(DEFAULT_DELAY_KNOB) / 1000.0);
    (bus, chain)
}

/// Control half of the master bus
#[derive(Debug)]
pub struct MasterBus {
    filter: Arc<FilterParams>,
    pitch: Arc<PitchParams>,
    delay: Arc<DelayParams>,
    wet: Arc<AutomationLane>,
    volume: Arc<AutomationLane>,
    ramp_frames: u64,
}

impl MasterBus {
    /// Filter knob (-1 = low-pass, 0 = bypass, 1 = high-pass)
    pub fn set_filter(&self, normalized: f32) {
        self.filter.apply(filter_from_normalized(normalized));
    }

    /// Delay time knob (0..1, cubic curve to 0.1..2000 ms)
    pub fn set_delay_time(&self, normalized: f32, now: u64) {
        let seconds = delay_normalized_to_ms(normalized) / 1000.0;
        self.delay
            .delay_time
            .ramp_to(seconds, now, now + self.ramp_frames);
    }

    /// Delay feedback in percent (0..90)
    pub fn set_delay_feedback(&self, percent: f32, now: u64) {
        self.delay.feedback.ramp_to(
            cell_feedback_from_percent(percent),
            now,
            now + self.ramp_frames,
        );
    }

    /// Delay wet amount (0..1)
    pub fn set_delay_wet(&self, wet: f32, now: u64) {
        self.wet.ramp_to(wet, now, now + self.ramp_frames);
    }

    /// Pitch knob (-100..100, 0 = unchanged)
    pub fn set_pitch(&self, normalized: f32) {
        self.pitch.ratio.set_now(pitch_normalized_to_ratio(normalized));
    }

    /// Master volume (0..1)
    pub fn set_volume(&self, volume: f32, now: u64) {
        self.volume.ramp_to(volume, now, now + self.ramp_frames);
    }

    pub fn filter_type(&self) -> FilterType {
        self.filter.filter_type()
    }

    pub fn pitch_ratio(&self) -> f32 {
        self.pitch.ratio.target()
    }

    pub fn delay_time_seconds(&self) -> f32 {
        self.delay.delay_time.target()
    }

    pub fn delay_feedback(&self) -> f32 {
        self.delay.feedback.target()
    }

    pub fn delay_wet(&self) -> f32 {
        self.wet.target()
    }

    pub fn volume(&self) -> f32 {
        self.volume.target()
    }
}

/// Render half of the master bus
pub struct MasterChain {
    filter: FilterUnit,
    pitch: PitchUnit,
    delay: DelayUnit,
    wet: LaneReader,
    volume: LaneReader,
    pitch_ratio: LaneReader,
    pitch_engaged: bool,
    echo: StereoBuffer,
}

impl MasterChain {
    fn new(sample_rate: u32, max_delay_seconds: f32, max_block: usize) -> Self {
        let pitch = PitchUnit::new(sample_rate, max_block);
        let pitch_ratio = LaneReader::new(pitch.params().ratio.clone());
        Self {
            filter: FilterUnit::new(sample_rate),
            pitch,
            delay: DelayUnit::new(sample_rate, max_delay_seconds),
            wet: LaneReader::new(AutomationLane::shared(0.0, 0.0, 1.0)),
            volume: LaneReader::new(AutomationLane::shared(1.0, 0.0, MAX_MASTER_VOLUME)),
            pitch_ratio,
            pitch_engaged: false,
            echo: StereoBuffer::silence(max_block),
        }
    }

    /// Process the summed mix in place
    pub fn process(&mut self, block: &mut [StereoSample], start_frame: u64) {
        if self.filter.params().filter_type() != FilterType::AllPass {
            self.filter.process(block, start_frame);
        }

        let ratio = self.pitch_ratio.refresh().value_at(start_frame);
        if ratio != 1.0 {
            if !self.pitch_engaged {
                self.pitch.reset();
                self.pitch_engaged = true;
            }
            self.pitch.process(block, start_frame);
        } else {
            self.pitch_engaged = false;
        }

        // The delay keeps running at zero wet so raising the wet fades in a
        // live echo rather than a stale buffer
        let len = block.len().min(self.echo.len());
        let echo = &mut self.echo.as_mut_slice()[..len];
        echo.copy_from_slice(&block[..len]);
        self.delay.process(echo, start_frame);

        let wet = *self.wet.refresh();
        let volume = *self.volume.refresh();
        for (i, (sample, echo)) in block.iter_mut().zip(echo.iter()).enumerate() {
            let frame = start_frame + i as u64;
            *sample = (*sample + *echo * wet.value_at(frame)) * volume.value_at(frame);
        }
    }
}

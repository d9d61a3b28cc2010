//! Effect units - kinds, tagged unit handles and construction
//!
//! Every pooled unit exists in two halves:
//! - [`UnitParams`]: the automatable parameters, shared (`Arc`) between the
//!   control domain that writes them and the render domain that reads them
//! - [`EffectUnit`]: the DSP state, owned exclusively by the render domain
//!
//! Both are tagged unions over the three unit kinds, resolved by pattern
//! matching. A variant only carries the parameters its kind exposes.

mod error;
pub mod native;

use std::sync::Arc;

use crate::types::StereoSample;

pub use error::{EffectError, EffectResult};
pub use native::{
    DelayLine, DelayParams, DelayUnit, FilterParams, FilterUnit, PitchParams, PitchUnit,
    DEFAULT_MAX_DELAY_SECONDS, MAX_FEEDBACK, MIN_DELAY_SECONDS,
};

/// The three kinds of pooled effect unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Delay,
    Filter,
    Pitch,
}

impl EffectKind {
    /// All kinds, in pool order
    pub const ALL: [EffectKind; 3] = [EffectKind::Delay, EffectKind::Filter, EffectKind::Pitch];

    pub fn name(&self) -> &'static str {
        match self {
            EffectKind::Delay => "Delay",
            EffectKind::Filter => "Filter",
            EffectKind::Pitch => "Pitch",
        }
    }
}

impl std::fmt::Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared parameter half of a unit
#[derive(Debug, Clone)]
pub enum UnitParams {
    Delay(Arc<DelayParams>),
    Filter(Arc<FilterParams>),
    Pitch(Arc<PitchParams>),
}

impl UnitParams {
    pub fn kind(&self) -> EffectKind {
        match self {
            UnitParams::Delay(_) => EffectKind::Delay,
            UnitParams::Filter(_) => EffectKind::Filter,
            UnitParams::Pitch(_) => EffectKind::Pitch,
        }
    }

    /// Ownership generation, bumped every time the unit is released
    pub fn generation(&self) -> u32 {
        match self {
            UnitParams::Delay(p) => p.generation(),
            UnitParams::Filter(p) => p.generation(),
            UnitParams::Pitch(p) => p.generation(),
        }
    }

    /// Reset every parameter to its neutral (bypass) default
    pub fn reset_to_neutral(&self) {
        match self {
            UnitParams::Delay(p) => p.reset_to_neutral(),
            UnitParams::Filter(p) => p.reset_to_neutral(),
            UnitParams::Pitch(p) => p.reset_to_neutral(),
        }
    }

    pub fn is_neutral(&self) -> bool {
        match self {
            UnitParams::Delay(p) => p.is_neutral(),
            UnitParams::Filter(p) => p.is_neutral(),
            UnitParams::Pitch(p) => p.is_neutral(),
        }
    }

    /// Disconnect every route holding the current generation
    pub(crate) fn bump_generation(&self) -> u32 {
        match self {
            UnitParams::Delay(p) => p.bump_generation(),
            UnitParams::Filter(p) => p.bump_generation(),
            UnitParams::Pitch(p) => p.bump_generation(),
        }
    }

    pub fn as_delay(&self) -> Option<&Arc<DelayParams>> {
        match self {
            UnitParams::Delay(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_filter(&self) -> Option<&Arc<FilterParams>> {
        match self {
            UnitParams::Filter(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_pitch(&self) -> Option<&Arc<PitchParams>> {
        match self {
            UnitParams::Pitch(p) => Some(p),
            _ => None,
        }
    }
}

/// Render half of a unit
pub enum EffectUnit {
    Delay(DelayUnit),
    Filter(FilterUnit),
    Pitch(PitchUnit),
}

impl EffectUnit {
    pub fn kind(&self) -> EffectKind {
        match self {
            EffectUnit::Delay(_) => EffectKind::Delay,
            EffectUnit::Filter(_) => EffectKind::Filter,
            EffectUnit::Pitch(_) => EffectKind::Pitch,
        }
    }

    /// Clone out the shared parameter half
    pub fn params(&self) -> UnitParams {
        match self {
            EffectUnit::Delay(u) => UnitParams::Delay(u.params().clone()),
            EffectUnit::Filter(u) => UnitParams::Filter(u.params().clone()),
            EffectUnit::Pitch(u) => UnitParams::Pitch(u.params().clone()),
        }
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        match self {
            EffectUnit::Delay(u) => u.params().generation(),
            EffectUnit::Filter(u) => u.params().generation(),
            EffectUnit::Pitch(u) => u.params().generation(),
        }
    }

    /// Clear DSP state left over from a previous owner
    #[inline]
    pub fn sync_generation(&mut self) {
        match self {
            EffectUnit::Delay(u) => u.sync_generation(),
            EffectUnit::Filter(u) => u.sync_generation(),
            EffectUnit::Pitch(u) => u.sync_generation(),
        }
    }

    /// Process `block` in place
    ///
    /// Filter and pitch units replace the block with the processed signal,
    /// the delay unit replaces it with the wet echo only.
    pub fn process(&mut self, block: &mut [StereoSample], start_frame: u64) {
        match self {
            EffectUnit::Delay(u) => u.process(block, start_frame),
            EffectUnit::Filter(u) => u.process(block, start_frame),
            EffectUnit::Pitch(u) => u.process(block, start_frame),
        }
    }

    pub fn reset(&mut self) {
        match self {
            EffectUnit::Delay(u) => u.reset(),
            EffectUnit::Filter(u) => u.reset(),
            EffectUnit::Pitch(u) => u.reset(),
        }
    }
}

/// Constructs the units a pool is filled with
///
/// Construction may fail per unit (unsupported runtime, bad settings); the
/// pool then runs with fewer units of that kind.
pub trait UnitFactory {
    fn build(&mut self, kind: EffectKind, index: usize) -> EffectResult<EffectUnit>;
}

/// Factory for the native Rust units
#[derive(Debug, Clone)]
pub struct NativeUnitFactory {
    pub sample_rate: u32,
    pub max_delay_seconds: f32,
    pub max_block: usize,
}

impl NativeUnitFactory {
    pub fn new(sample_rate: u32, max_delay_seconds: f32, max_block: usize) -> Self {
        Self {
            sample_rate,
            max_delay_seconds,
            max_block,
        }
    }
}

impl UnitFactory for NativeUnitFactory {
    fn build(&mut self, kind: EffectKind, _index: usize) -> EffectResult<EffectUnit> {
        if self.sample_rate == 0 {
            return Err(EffectError::InvalidSampleRate {
                kind,
                rate: self.sample_rate,
            });
        }
        match kind {
            EffectKind::Delay => {
                if !(self.max_delay_seconds.is_finite() && self.max_delay_seconds > 0.0) {
                    return Err(EffectError::InvalidMaxDelay(self.max_delay_seconds));
                }
                Ok(EffectUnit::Delay(DelayUnit::new(
                    self.sample_rate,
                    self.max_delay_seconds,
                )))
            }
            EffectKind::Filter => Ok(EffectUnit::Filter(FilterUnit::new(self.sample_rate))),
            EffectKind::Pitch => {
                if self.max_block == 0 {
                    return Err(EffectError::InvalidBlockSize {
                        kind,
                        frames: self.max_block,
                    });
                }
                Ok(EffectUnit::Pitch(PitchUnit::new(self.sample_rate, self.max_block)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SAMPLE_RATE;

    #[test]
    fn test_native_factory_builds_every_kind() {
        let mut factory = NativeUnitFactory::new(SAMPLE_RATE, 2.0, 512);
        for (i, kind) in EffectKind::ALL.iter().enumerate() {
            let unit = factory.build(*kind, i).unwrap();
            assert_eq!(unit.kind(), *kind);
            assert_eq!(unit.params().kind(), *kind);
            assert!(unit.params().is_neutral());
        }
    }

    #[test]
    fn test_native_factory_rejects_bad_settings() {
        let mut factory = NativeUnitFactory::new(SAMPLE_RATE, 0.0, 512);
        assert!(matches!(
            factory.build(EffectKind::Delay, 0),
            Err(EffectError::InvalidMaxDelay(_))
        ));
        // Other kinds don't care about the delay length
        assert!(factory.build(EffectKind::Filter, 0).is_ok());

        let mut factory = NativeUnitFactory::new(0, 2.0, 512);
        assert!(factory.build(EffectKind::Filter, 0).is_err());
    }

    #[test]
    fn test_generation_bump() {
        let params = UnitParams::Filter(Arc::new(FilterParams::new()));
        let before = params.generation();
        assert_eq!(params.bump_generation(), before + 1);
        assert_eq!(params.generation(), before + 1);
    }
}

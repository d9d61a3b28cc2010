//! Native Rust effect units
//!
//! These are the three unit kinds the effect pools hold. Each unit is split
//! into a shared parameter half (written by the control domain) and a render
//! half owned by the audio thread.

mod delay;
mod delay_line;
mod filter;
mod pitch;

pub use delay::{DelayParams, DelayUnit};
pub use delay_line::{DelayLine, DEFAULT_MAX_DELAY_SECONDS, MAX_FEEDBACK, MIN_DELAY_SECONDS};
pub use filter::{FilterParams, FilterUnit};
pub use pitch::{ratio_to_semitones, PitchParams, PitchUnit};

//! Stemloop Core - bar-synchronized multi-stem looper
//!
//! Control domain: [`scheduler::PlaybackScheduler`] with its [`pool::EffectPool`]
//! and [`clock::MusicalClock`]. Render domain: [`engine::LoopEngine`]. The two
//! meet only through the engine command queue and [`automation`] lanes.

pub mod audio;
pub mod automation;
pub mod clock;
pub mod config;
pub mod effect;
pub mod engine;
mod looper;
pub mod mapping;
pub mod pool;
pub mod scheduler;
pub mod types;

pub use looper::{build_looper, build_looper_with};
pub use types::*;

//! Real-time render engine
//!
//! - [`LoopEngine`]: renders voices through pooled units and the master chain
//! - [`EngineCommand`]: voice lifecycle commands over a lock-free queue
//! - [`Voice`] / [`VoiceLanes`]: looping stem playback with automated gain,
//!   rate and delay send
//! - [`MasterBus`] / [`MasterChain`]: the always-present mix-level effects
//! - [`StemCollector`]: deferred deallocation of stem audio

mod command;
mod engine;
pub mod gc;
mod master;
mod voice;

pub use command::{command_channel, CommandSender, EngineCommand, COMMAND_QUEUE_CAPACITY};
pub use engine::LoopEngine;
pub use gc::{SharedStem, StemCollector};
pub use master::{master_bus, MasterBus, MasterChain, MAX_MASTER_VOLUME};
pub use voice::{UnitRoute, Voice, VoiceLanes, MAX_RATE, MAX_VOICE_GAIN, MIN_RATE};

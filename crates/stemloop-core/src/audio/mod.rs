//! Live audio output through CPAL
//!
//! The engine moves onto the device's callback thread and is driven from
//! there; the scheduler stays on the control thread and reaches it only
//! through the command queue and automation lanes.
//!
//! ```ignore
//! use stemloop_core::{audio::start_audio_output, build_looper, config::LooperConfig};
//!
//! let config = LooperConfig::default();
//! let (mut scheduler, engine) = build_looper(&config);
//! let _output = start_audio_output(&config, engine)?;
//! loop {
//!     scheduler.tick();
//!     std::thread::sleep(std::time::Duration::from_millis(5));
//! }
//! ```

mod cpal_backend;
mod error;

pub use cpal_backend::{start_audio_output, AudioOutputHandle, MAX_CALLBACK_FRAMES};
pub use error::{AudioError, AudioResult};

//! Looper configuration
//!
//! - [`LooperConfig`]: engine, pool and timing settings
//! - [`load_config`] / [`save_config`]: YAML persistence for any serde type
//! - [`default_config_path`]: per-user location of config files
//!
//! ```ignore
//! use stemloop_core::config::{default_config_path, load_config, LooperConfig};
//!
//! let config: LooperConfig = load_config(&default_config_path("looper.yaml"));
//! ```

mod io;
mod looper;
mod paths;

pub use io::{load_config, parse_config_file, save_config};
pub use looper::LooperConfig;
pub use paths::{config_dir, default_config_path};

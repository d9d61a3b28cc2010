//! Where configuration files live

use std::path::PathBuf;

/// Per-user config directory: `<config dir>/stemloop`
///
/// Falls back to the working directory when the platform has no config dir.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stemloop")
}

/// Path of a named config file inside [`config_dir`]
pub fn default_config_path(filename: &str) -> PathBuf {
    config_dir().join(filename)
}

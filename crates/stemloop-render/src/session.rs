//! Session files: which stems to load and what the grid does with them
//!
//! ```yaml
//! bpm: 124
//! bars: 8
//! stems:
//!   - name: drums
//!     path: drums.wav
//!     kind: drums
//!     bpm: 124
//! cells:
//!   - channel: 0
//!     stem: drums
//!     params: { volume: 0.8, delay_wet: 0.3 }
//!     stop_bar: 6
//!     changes:
//!       - { bar: 2, parameter: loop_fraction, value: 0.5 }
//! master:
//!   filter: -0.3
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::Deserialize;

use stemloop_core::config::LooperConfig;
use stemloop_core::scheduler::{ChannelParams, ParameterKind};
use stemloop_core::{ChannelId, StemKind};

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    /// Overrides the user's looper config
    #[serde(default)]
    pub looper: Option<LooperConfig>,
    /// Explicit master tempo; otherwise the first started stem's tempo
    #[serde(default)]
    pub bpm: Option<f64>,
    #[serde(default = "default_bars")]
    pub bars: u32,
    /// Extra seconds rendered after the last bar (delay tails)
    #[serde(default)]
    pub tail_seconds: f64,
    pub stems: Vec<StemEntry>,
    #[serde(default)]
    pub cells: Vec<CellEntry>,
    #[serde(default)]
    pub master: MasterSettings,
}

fn default_bars() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct StemEntry {
    pub name: String,
    /// WAV file, relative to the session file
    pub path: PathBuf,
    #[serde(default)]
    pub kind: StemKind,
    pub bpm: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CellEntry {
    pub channel: ChannelId,
    /// Name of an entry in `stems`
    pub stem: String,
    #[serde(default)]
    pub params: ChannelParams,
    /// Bar the cell starts sounding on
    #[serde(default)]
    pub start_bar: u64,
    /// Bar the cell is silent from
    #[serde(default)]
    pub stop_bar: Option<u64>,
    #[serde(default)]
    pub changes: Vec<ParameterChange>,
}

/// A parameter move made during `bar`
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ParameterChange {
    pub bar: u64,
    pub parameter: ParameterKind,
    pub value: f32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MasterSettings {
    pub filter: f32,
    pub delay_time: f32,
    pub delay_feedback: f32,
    pub delay_wet: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            filter: 0.0,
            delay_time: 0.5,
            delay_feedback: 0.0,
            delay_wet: 0.0,
            pitch: 0.0,
            volume: 1.0,
        }
    }
}

impl Session {
    /// Reject sessions that reference missing stems or reuse channels
    pub fn validate(&self) -> Result<()> {
        let names: HashSet<&str> = self.stems.iter().map(|s| s.name.as_str()).collect();
        if names.len() != self.stems.len() {
            bail!("Stem names must be unique");
        }

        let mut channels = HashSet::new();
        for cell in &self.cells {
            if !names.contains(cell.stem.as_str()) {
                bail!("Cell {} uses unknown stem '{}'", cell.channel, cell.stem);
            }
            if !channels.insert(cell.channel) {
                bail!("Channel {} appears in more than one cell", cell.channel);
            }
            if let Some(stop) = cell.stop_bar {
                if stop <= cell.start_bar {
                    bail!("Cell {} stops before it starts", cell.channel);
                }
            }
        }
        if self.bars == 0 {
            bail!("Nothing to render: bars is 0");
        }
        Ok(())
    }
}

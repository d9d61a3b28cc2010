//! Drive a session through the scheduler and engine
//!
//! [`Performance`] owns the control side of a loaded session. Offline, the
//! caller renders the engine block by block between calls to
//! [`Performance::advance`]; live, the engine runs on the device thread and
//! `advance` is called on a short timer.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use stemloop_core::audio::start_audio_output;
use stemloop_core::build_looper;
use stemloop_core::clock::AudioClock;
use stemloop_core::config::{default_config_path, load_config, LooperConfig};
use stemloop_core::engine::{LoopEngine, SharedStem, StemCollector};
use stemloop_core::scheduler::PlaybackScheduler;
use stemloop_core::{StereoBuffer, StereoSample};

use crate::session::{CellEntry, Session};
use crate::wav::read_stem;

/// How often live playback runs the scheduler (well inside its lookahead)
const LIVE_TICK: Duration = Duration::from_millis(5);

/// Rendered mix
pub struct Rendered {
    pub frames: Vec<StereoSample>,
    pub sample_rate: u32,
}

/// Where a cell is in its scripted life
struct CellProgress {
    cell: CellEntry,
    added: bool,
    removed: bool,
    changes_done: usize,
}

/// A loaded session with its transport running
pub struct Performance {
    scheduler: PlaybackScheduler,
    config: LooperConfig,
    stems: HashMap<String, SharedStem>,
    cells: Vec<CellProgress>,
    total_frames: u64,
    // Dropped last so every stem reference is gone before it stops
    _collector: StemCollector,
}

impl Performance {
    /// Load stems, build the looper and start the transport
    ///
    /// Stem paths are resolved against `base_dir`.
    pub fn load(session: &Session, base_dir: &Path) -> Result<(Performance, LoopEngine)> {
        session.validate()?;

        let config = match &session.looper {
            Some(config) => config.validated(),
            None => load_config::<LooperConfig>(&default_config_path("looper.yaml")).validated(),
        };
        let collector = StemCollector::spawn().context("Failed to start the stem collector")?;

        let mut stems = HashMap::new();
        for entry in &session.stems {
            let stem = read_stem(&base_dir.join(&entry.path), &entry.name, entry.kind, entry.bpm)?;
            stems.insert(entry.name.clone(), collector.share(stem));
        }

        let (scheduler, engine) = build_looper(&config);
        let mut performance = Performance {
            scheduler,
            config,
            stems,
            cells: session
                .cells
                .iter()
                .map(|cell| CellProgress {
                    cell: cell.clone(),
                    added: false,
                    removed: false,
                    changes_done: 0,
                })
                .collect(),
            total_frames: 0,
            _collector: collector,
        };

        if let Some(bpm) = session.bpm {
            performance.scheduler.set_master_bpm(bpm);
        }
        performance.apply_master(session);

        // Bar-0 cells start together with the transport
        for index in 0..performance.cells.len() {
            if performance.cells[index].cell.start_bar == 0 {
                performance.add_cell(index);
            }
        }
        performance.scheduler.start();

        let seconds = session.bars as f64 * performance.scheduler.bar_duration()
            + session.tail_seconds.max(0.0);
        performance.total_frames = performance.scheduler.clock().seconds_to_frames(seconds);
        log::info!(
            "Session: {} bars at {:.2} BPM ({} frames)",
            session.bars,
            performance.scheduler.master_bpm(),
            performance.total_frames
        );

        Ok((performance, engine))
    }

    pub fn config(&self) -> &LooperConfig {
        &self.config
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Frames the engine has rendered so far
    pub fn now(&self) -> u64 {
        self.scheduler.clock().now_frames()
    }

    pub fn is_finished(&self) -> bool {
        self.now() >= self.total_frames
    }

    /// Apply the cell script for the current bar and run due scheduler work
    pub fn advance(&mut self) {
        let bar = self.scheduler.get_musical_position().bar;
        for index in 0..self.cells.len() {
            self.advance_cell(index, bar);
        }
        self.scheduler.tick();
    }

    fn apply_master(&mut self, session: &Session) {
        let master = &session.master;
        let scheduler = &mut self.scheduler;
        scheduler.set_master_filter(master.filter);
        scheduler.set_master_delay_time(master.delay_time);
        scheduler.set_master_delay_feedback(master.delay_feedback);
        scheduler.set_master_delay_wet(master.delay_wet);
        scheduler.set_master_pitch(master.pitch);
        scheduler.set_master_volume(master.volume);
    }

    fn add_cell(&mut self, index: usize) {
        let progress = &mut self.cells[index];
        if let Some(stem) = self.stems.get(&progress.cell.stem) {
            self.scheduler
                .add_channel(progress.cell.channel, stem.clone(), progress.cell.params);
        }
        progress.added = true;
    }

    /// Add, remove and change a cell one bar ahead so it lands on its bar
    fn advance_cell(&mut self, index: usize, bar: u64) {
        let (added, start_bar) = {
            let progress = &self.cells[index];
            (progress.added, progress.cell.start_bar)
        };
        if !added && bar + 1 >= start_bar {
            self.add_cell(index);
        }

        let progress = &mut self.cells[index];
        let cell = &progress.cell;
        if progress.added && !progress.removed && cell.stop_bar.is_some_and(|stop| bar + 1 >= stop) {
            self.scheduler.remove_channel(cell.channel);
            progress.removed = true;
        }
        while let Some(change) = progress.cell.changes.get(progress.changes_done) {
            if progress.removed || change.bar > bar {
                break;
            }
            self.scheduler
                .set_channel_parameter(progress.cell.channel, change.parameter, change.value);
            progress.changes_done += 1;
        }
    }
}

/// Render `session` offline, resolving stem paths against `base_dir`
pub fn render_session(session: &Session, base_dir: &Path) -> Result<Rendered> {
    let (mut performance, mut engine) = Performance::load(session, base_dir)?;
    let block_size = performance.config().block_size;
    let total = performance.total_frames();

    let mut block = StereoBuffer::silence(block_size);
    let mut frames = Vec::with_capacity(total as usize);
    while !performance.is_finished() {
        performance.advance();

        let len = block_size.min((total - performance.now()) as usize);
        let slice = &mut block.as_mut_slice()[..len];
        engine.process_slice(slice);
        frames.extend_from_slice(slice);
    }

    let peak = frames.iter().map(StereoSample::peak).fold(0.0_f32, f32::max);
    log::info!("Rendered {} frames, peak {:.3}", frames.len(), peak);

    Ok(Rendered {
        frames,
        sample_rate: performance.config().sample_rate,
    })
}

/// Play `session` on the default output device until its last bar is done
pub fn play_session(session: &Session, base_dir: &Path) -> Result<()> {
    let (mut performance, engine) = Performance::load(session, base_dir)?;
    let output = start_audio_output(performance.config(), engine)
        .context("Failed to start audio output")?;
    log::info!(
        "Playing on '{}' ({} channels at {}Hz)",
        output.device_name(),
        output.channels(),
        output.sample_rate()
    );

    while !performance.is_finished() {
        performance.advance();
        std::thread::sleep(LIVE_TICK);
    }
    log::info!("Session finished after {} frames", performance.now());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav::write_wav;

    fn session_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let tone: Vec<StereoSample> = (0..96_000)
            .map(|i| StereoSample::mono(((i as f32) * 0.05).sin() * 0.5))
            .collect();
        write_wav(&dir.path().join("tone.wav"), &tone, 48_000).unwrap();
        dir
    }

    #[test]
    fn test_render_length_follows_bars() {
        let dir = session_dir();
        let session: Session = serde_yaml::from_str(
            r#"
looper: { block_size: 256 }
bpm: 120
bars: 2
stems:
  - { name: tone, path: tone.wav, bpm: 120 }
cells:
  - { channel: 0, stem: tone }
"#,
        )
        .unwrap();

        let rendered = render_session(&session, dir.path()).unwrap();
        assert_eq!(rendered.sample_rate, 48_000);
        assert_eq!(rendered.frames.len(), 4 * 48_000);
        assert!(rendered.frames[1_000].peak() > 0.0);
    }

    #[test]
    fn test_late_cell_waits_for_its_bar() {
        let dir = session_dir();
        let session: Session = serde_yaml::from_str(
            r#"
looper: {}
bpm: 120
bars: 3
stems:
  - { name: tone, path: tone.wav, bpm: 120 }
cells:
  - { channel: 1, stem: tone, start_bar: 2, stop_bar: 3 }
"#,
        )
        .unwrap();

        let rendered = render_session(&session, dir.path()).unwrap();
        // Bar 2 starts at 4 s
        assert!(rendered.frames[..192_000].iter().all(|s| s.peak() == 0.0));
        assert!(rendered.frames[192_000 + 1_000..].iter().any(|s| s.peak() > 0.1));
    }

    #[test]
    fn test_performance_starts_bar_zero_cells() {
        let dir = session_dir();
        let session: Session = serde_yaml::from_str(
            r#"
looper: {}
bpm: 100
bars: 1
stems:
  - { name: tone, path: tone.wav, bpm: 120 }
cells:
  - { channel: 0, stem: tone }
  - { channel: 1, stem: tone, start_bar: 1 }
"#,
        )
        .unwrap();

        let (performance, _engine) = Performance::load(&session, dir.path()).unwrap();
        // 1 bar at 100 BPM = 2.4 s
        assert_eq!(performance.total_frames(), 115_200);
        assert!(!performance.is_finished());
        assert_eq!(performance.scheduler.channel_ids().len(), 1);
    }
}

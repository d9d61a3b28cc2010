//! Audio clock and musical (bar/beat) timing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lowest accepted master tempo
pub const MIN_BPM: f64 = 20.0;
/// Highest accepted master tempo
pub const MAX_BPM: f64 = 300.0;
/// Tempo used until a channel or the caller sets one
pub const DEFAULT_BPM: f64 = 120.0;
/// Beats per bar (fixed)
pub const BEATS_PER_BAR: u32 = 4;

/// Host audio clock, measured in rendered frames
pub trait AudioClock {
    fn sample_rate(&self) -> u32;

    /// Frames rendered so far
    fn now_frames(&self) -> u64;

    /// Current time in seconds
    fn now(&self) -> f64 {
        self.now_frames() as f64 / self.sample_rate() as f64
    }

    fn seconds_to_frames(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate() as f64).round() as u64
    }
}

/// Frame counter shared between the engine (which advances it) and the
/// control domain (which reads it)
#[derive(Debug, Clone)]
pub struct FrameClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl FrameClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    /// Move the clock forward after a block was rendered
    #[inline]
    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Release);
    }
}

impl AudioClock for FrameClock {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    fn now_frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }
}

/// Position on the bar/beat grid
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MusicalPosition {
    /// Bars since the transport started (0-based)
    pub bar: u64,
    /// Beat within the bar (0-based)
    pub beat: u32,
    /// Fraction through the current bar (0..1)
    pub fraction: f64,
}

/// Tempo and transport state
#[derive(Debug, Clone)]
pub struct MusicalClock {
    bpm: f64,
    /// Set once the tempo was chosen explicitly or adopted from a channel
    bpm_locked: bool,
    transport_start: f64,
    running: bool,
}

impl MusicalClock {
    pub fn new(bpm: f64) -> Self {
        Self {
            bpm: clamp_bpm(bpm),
            bpm_locked: false,
            transport_start: 0.0,
            running: false,
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Set the tempo explicitly; channels no longer override it
    pub fn set_bpm(&mut self, bpm: f64) {
        if !bpm.is_finite() {
            log::warn!("Ignoring non-finite BPM {}", bpm);
            return;
        }
        self.bpm = clamp_bpm(bpm);
        self.bpm_locked = true;
    }

    /// Adopt a channel's tempo unless one was already chosen
    ///
    /// Returns whether the tempo changed.
    pub fn adopt_bpm(&mut self, bpm: f64) -> bool {
        if self.bpm_locked || !bpm.is_finite() || bpm <= 0.0 {
            return false;
        }
        self.bpm = clamp_bpm(bpm);
        self.bpm_locked = true;
        true
    }

    pub fn beats_per_bar(&self) -> u32 {
        BEATS_PER_BAR
    }

    pub fn beat_duration(&self) -> f64 {
        60.0 / self.bpm
    }

    pub fn bar_duration(&self) -> f64 {
        (60.0 / self.bpm) * BEATS_PER_BAR as f64
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn transport_start(&self) -> f64 {
        self.transport_start
    }

    /// Start the transport with the grid anchored at `now`
    pub fn start(&mut self, now: f64) {
        self.transport_start = now;
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Next bar boundary strictly after `now` (or `now` itself when stopped)
    pub fn next_bar_time(&self, now: f64) -> f64 {
        if !self.running {
            return now;
        }
        let bar = self.bar_duration();
        let elapsed = (now - self.transport_start).max(0.0);
        now + (bar - elapsed % bar)
    }

    /// Next beat boundary strictly after `now` (or `now` itself when stopped)
    pub fn next_beat_time(&self, now: f64) -> f64 {
        if !self.running {
            return now;
        }
        let beat = self.beat_duration();
        let elapsed = (now - self.transport_start).max(0.0);
        self.transport_start + ((elapsed / beat).floor() + 1.0) * beat
    }

    pub fn position_at(&self, now: f64) -> MusicalPosition {
        if !self.running {
            return MusicalPosition::default();
        }
        let bar_len = self.bar_duration();
        let elapsed = (now - self.transport_start).max(0.0);
        let bar = (elapsed / bar_len).floor();
        let within = elapsed - bar * bar_len;
        let beat = ((within / self.beat_duration()).floor() as u32).min(BEATS_PER_BAR - 1);

        MusicalPosition {
            bar: bar as u64,
            beat,
            fraction: (within / bar_len).clamp(0.0, 1.0),
        }
    }
}

impl Default for MusicalClock {
    fn default() -> Self {
        Self::new(DEFAULT_BPM)
    }
}

fn clamp_bpm(bpm: f64) -> f64 {
    bpm.clamp(MIN_BPM, MAX_BPM)
}

//! Looping stem voice
//!
//! A voice reads its stem at a fractional position that advances by the
//! playback rate every frame and wraps at the loop end. It is silent before
//! its start frame and after its stop frame. Gain, rate and delay send come
//! from automation lanes owned by the voice slot, so they outlive any single
//! channel that plays on the slot.

use std::sync::Arc;

use super::gc::SharedStem;
use crate::automation::{AutomationLane, LaneReader};
use crate::pool::UnitRef;
use crate::types::StereoSample;

/// Highest gain a voice lane accepts
pub const MAX_VOICE_GAIN: f32 = 2.0;
/// Playback rate bounds (master tempo / stem tempo)
pub const MIN_RATE: f32 = 0.125;
pub const MAX_RATE: f32 = 8.0;

/// Pooled units a voice is routed through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitRoute {
    pub filter: Option<UnitRef>,
    pub pitch: Option<UnitRef>,
    pub delay: Option<UnitRef>,
}

/// Automation lanes of one voice slot, shared with the control domain
#[derive(Debug, Clone)]
pub struct VoiceLanes {
    /// Output gain (volume with fades)
    pub gain: Arc<AutomationLane>,
    /// Playback rate
    pub rate: Arc<AutomationLane>,
    /// Amount of delay wet signal added to the dry signal
    pub send: Arc<AutomationLane>,
}

impl VoiceLanes {
    pub fn new() -> Self {
        Self {
            gain: AutomationLane::shared(0.0, 0.0, MAX_VOICE_GAIN),
            rate: AutomationLane::shared(1.0, MIN_RATE, MAX_RATE),
            send: AutomationLane::shared(0.0, 0.0, 1.0),
        }
    }
}

impl Default for VoiceLanes {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRestart {
    loop_frames: usize,
    at_frame: u64,
}

/// Render-side voice state
pub struct Voice {
    stem: Option<SharedStem>,
    /// Read position within the loop, in stem frames
    position: f64,
    loop_frames: usize,
    start_frame: u64,
    stop_frame: Option<u64>,
    pending_restart: Option<PendingRestart>,
    route: UnitRoute,
    gain: LaneReader,
    rate: LaneReader,
    send: LaneReader,
}

impl Voice {
    pub fn new(lanes: &VoiceLanes) -> Self {
        Self {
            stem: None,
            position: 0.0,
            loop_frames: 1,
            start_frame: 0,
            stop_frame: None,
            pending_restart: None,
            route: UnitRoute::default(),
            gain: LaneReader::new(lanes.gain.clone()),
            rate: LaneReader::new(lanes.rate.clone()),
            send: LaneReader::new(lanes.send.clone()),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.stem.is_some()
    }

    pub fn route(&self) -> UnitRoute {
        self.route
    }

    pub fn loop_frames(&self) -> usize {
        self.loop_frames
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Start a stem, replacing whatever played before
    pub fn start(&mut self, stem: SharedStem, loop_frames: usize, start_frame: u64, route: UnitRoute) {
        self.loop_frames = clamp_loop(loop_frames, stem.len_frames());
        self.stem = Some(stem);
        self.position = 0.0;
        self.start_frame = start_frame;
        self.stop_frame = None;
        self.pending_restart = None;
        self.route = route;
    }

    pub fn stop_at(&mut self, frame: u64) {
        if self.is_active() {
            self.stop_frame = Some(frame);
        }
    }

    pub fn cancel_stop(&mut self) {
        self.stop_frame = None;
    }

    /// Restart from the loop start at `frame`; the latest request wins
    pub fn restart_at(&mut self, loop_frames: usize, frame: u64) {
        if self.is_active() {
            self.pending_restart = Some(PendingRestart {
                loop_frames,
                at_frame: frame,
            });
        }
    }

    /// Swap routed units and restart from the loop start at `frame`
    pub fn reroute(&mut self, route: UnitRoute, frame: u64) {
        self.route = route;
        self.restart_at(self.loop_frames, frame);
    }

    /// Release the stem once the stop frame has passed
    ///
    /// Returns `true` if the voice became idle.
    pub fn finish_block(&mut self, block_end: u64) -> bool {
        match self.stop_frame {
            Some(stop) if stop <= block_end && self.stem.is_some() => {
                // Last reference is freed by the collector thread
                self.stem = None;
                self.stop_frame = None;
                self.pending_restart = None;
                self.route = UnitRoute::default();
                true
            }
            _ => false,
        }
    }

    /// Render the raw looped stem for the block starting at `block_start`
    pub fn render_source(&mut self, out: &mut [StereoSample], block_start: u64) {
        let Some(stem) = self.stem.as_ref() else {
            out.fill(StereoSample::silence());
            return;
        };
        let audio = stem.audio.as_slice();
        let rate = self.rate.refresh().value_at(block_start) as f64;

        for (i, sample) in out.iter_mut().enumerate() {
            let frame = block_start + i as u64;
            if frame < self.start_frame || self.stop_frame.is_some_and(|stop| frame >= stop) {
                *sample = StereoSample::silence();
                continue;
            }
            if let Some(restart) = self.pending_restart {
                if frame >= restart.at_frame {
                    self.position = 0.0;
                    self.loop_frames = clamp_loop(restart.loop_frames, audio.len());
                    self.pending_restart = None;
                }
            }

            *sample = read_looped(audio, self.loop_frames, self.position);
            self.position += rate;
            if self.position >= self.loop_frames as f64 {
                self.position %= self.loop_frames as f64;
            }
        }
    }

    /// Gain lane snapshot for this block
    #[inline]
    pub fn gain(&mut self) -> &crate::automation::LaneSnapshot {
        self.gain.refresh()
    }

    /// Delay send lane snapshot for this block
    #[inline]
    pub fn send(&mut self) -> &crate::automation::LaneSnapshot {
        self.send.refresh()
    }
}

fn clamp_loop(loop_frames: usize, stem_frames: usize) -> usize {
    loop_frames.clamp(1, stem_frames.max(1))
}

/// Linear interpolation between neighbouring frames, wrapping inside the loop
#[inline]
fn read_looped(audio: &[StereoSample], loop_frames: usize, position: f64) -> StereoSample {
    if audio.is_empty() {
        return StereoSample::silence();
    }
    let index = position as usize;
    let frac = (position - index as f64) as f32;
    let a = audio[index.min(audio.len() - 1)];
    let next = if index + 1 >= loop_frames { 0 } else { index + 1 };
    let b = audio[next.min(audio.len() - 1)];
    a * (1.0 - frac) + b * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gc::StemCollector;
    use crate::types::{Stem, StemKind, StereoBuffer};

    fn ramp_stem(collector: &StemCollector, frames: usize) -> SharedStem {
        let samples = (0..frames).map(|i| StereoSample::mono(i as f32)).collect();
        collector.share(Stem::new(
            "ramp",
            StemKind::Other,
            120.0,
            48_000,
            StereoBuffer::from_vec(samples),
        ))
    }

    #[test]
    fn test_silent_before_start() {
        let collector = StemCollector::spawn().unwrap();
        let lanes = VoiceLanes::new();
        let mut voice = Voice::new(&lanes);
        voice.start(ramp_stem(&collector, 100), 100, 10, UnitRoute::default());

        let mut out = vec![StereoSample::mono(9.0); 16];
        voice.render_source(&mut out, 0);
        assert!(out[..10].iter().all(|s| s.left == 0.0));
        assert_eq!(out[10].left, 0.0);
        assert_eq!(out[11].left, 1.0);
    }

    #[test]
    fn test_loop_wraps() {
        let collector = StemCollector::spawn().unwrap();
        let lanes = VoiceLanes::new();
        let mut voice = Voice::new(&lanes);
        voice.start(ramp_stem(&collector, 100), 4, 0, UnitRoute::default());

        let mut out = vec![StereoSample::silence(); 10];
        voice.render_source(&mut out, 0);
        let values: Vec<f32> = out.iter().map(|s| s.left).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 3.0, 0.0, 1.0]);
    }

    #[test]
    fn test_rate_lane_speeds_up_playback() {
        let collector = StemCollector::spawn().unwrap();
        let lanes = VoiceLanes::new();
        lanes.rate.set_now(1.5);
        let mut voice = Voice::new(&lanes);
        voice.start(ramp_stem(&collector, 100), 100, 0, UnitRoute::default());

        let mut out = vec![StereoSample::silence(); 3];
        voice.render_source(&mut out, 0);
        assert_eq!(out[1].left, 1.5);
        assert_eq!(out[2].left, 3.0);
    }

    #[test]
    fn test_restart_latest_wins() {
        let collector = StemCollector::spawn().unwrap();
        let lanes = VoiceLanes::new();
        let mut voice = Voice::new(&lanes);
        voice.start(ramp_stem(&collector, 100), 100, 0, UnitRoute::default());
        voice.restart_at(50, 5);
        voice.restart_at(2, 6);

        let mut out = vec![StereoSample::silence(); 10];
        voice.render_source(&mut out, 0);
        // Frame 5 continues the old loop; the second request replaced the first
        assert_eq!(out[5].left, 5.0);
        assert_eq!(out[6].left, 0.0);
        assert_eq!(out[7].left, 1.0);
        assert_eq!(out[8].left, 0.0);
        assert_eq!(voice.loop_frames(), 2);
    }

    #[test]
    fn test_stop_frees_voice() {
        let collector = StemCollector::spawn().unwrap();
        let lanes = VoiceLanes::new();
        let mut voice = Voice::new(&lanes);
        voice.start(ramp_stem(&collector, 100), 100, 0, UnitRoute::default());
        voice.stop_at(4);

        let mut out = vec![StereoSample::silence(); 8];
        voice.render_source(&mut out, 0);
        assert_eq!(out[3].left, 3.0);
        assert!(out[4..].iter().all(|s| s.left == 0.0));
        assert!(voice.finish_block(8));
        assert!(!voice.is_active());
    }

    #[test]
    fn test_cancel_stop_keeps_playing() {
        let collector = StemCollector::spawn().unwrap();
        let lanes = VoiceLanes::new();
        let mut voice = Voice::new(&lanes);
        voice.start(ramp_stem(&collector, 100), 100, 0, UnitRoute::default());
        voice.stop_at(4);
        voice.cancel_stop();
        assert!(!voice.finish_block(8));
        assert!(voice.is_active());
    }
}

//! Lock-free automation lanes
//!
//! The control domain communicates with the render domain exclusively by
//! writing time-stamped values into automation lanes. A lane holds two linear
//! segments (the previous and the current one) stamped in absolute engine
//! frames, guarded by a sequence counter:
//!
//! ```text
//!   Control thread (single writer)        Audio thread (reader)
//!   ─────────────────────────────         ──────────────────────
//!   seq += 1  (odd: write in progress)    s1 = seq
//!   store segment fields                  load segment fields
//!   seq += 1  (even: stable)              s2 = seq
//!                                         s1 == s2 && even ? use : keep cached
//! ```
//!
//! The reader never spins and never blocks: a torn read simply reuses the last
//! consistent snapshot, which is at most one block old.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// One linear automation segment in engine frames
///
/// Before `start` the segment reads `from`, after `end` it reads `to`, and in
/// between it interpolates linearly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    pub from: f32,
    pub to: f32,
}

impl Segment {
    /// A constant segment
    pub fn constant(value: f32) -> Self {
        Self {
            start: 0,
            end: 0,
            from: value,
            to: value,
        }
    }

    /// Evaluate the segment at a frame
    #[inline]
    pub fn value_at(&self, frame: u64) -> f32 {
        if frame <= self.start {
            if frame == self.start && self.end <= self.start {
                return self.to;
            }
            return self.from;
        }
        if frame >= self.end {
            return self.to;
        }
        let t = (frame - self.start) as f64 / (self.end - self.start) as f64;
        self.from + (self.to - self.from) * t as f32
    }
}

/// Consistent copy of a lane's two segments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaneSnapshot {
    pub previous: Segment,
    pub current: Segment,
}

impl LaneSnapshot {
    fn constant(value: f32) -> Self {
        Self {
            previous: Segment::constant(value),
            current: Segment::constant(value),
        }
    }

    /// Value in effect at a frame
    #[inline]
    pub fn value_at(&self, frame: u64) -> f32 {
        if frame >= self.current.start {
            self.current.value_at(frame)
        } else {
            self.previous.value_at(frame)
        }
    }

    /// Whether the value is constant from `frame` onwards
    #[inline]
    pub fn is_settled_at(&self, frame: u64) -> bool {
        frame >= self.current.end && frame >= self.current.start
    }
}

#[derive(Default)]
struct AtomicSegment {
    start: AtomicU64,
    end: AtomicU64,
    from: AtomicU32,
    to: AtomicU32,
}

impl AtomicSegment {
    fn store(&self, segment: Segment) {
        self.start.store(segment.start, Ordering::Relaxed);
        self.end.store(segment.end, Ordering::Relaxed);
        self.from.store(segment.from.to_bits(), Ordering::Relaxed);
        self.to.store(segment.to.to_bits(), Ordering::Relaxed);
    }

    fn load(&self) -> Segment {
        Segment {
            start: self.start.load(Ordering::Relaxed),
            end: self.end.load(Ordering::Relaxed),
            from: f32::from_bits(self.from.load(Ordering::Relaxed)),
            to: f32::from_bits(self.to.load(Ordering::Relaxed)),
        }
    }
}

/// A single automatable parameter shared between control and render domains
///
/// Only one thread may write (the control domain). Any number of threads may
/// read through [`LaneReader`] or [`AutomationLane::try_snapshot`].
pub struct AutomationLane {
    seq: AtomicU64,
    previous: AtomicSegment,
    current: AtomicSegment,
    min: f32,
    max: f32,
}

impl AutomationLane {
    /// Create a lane holding a constant value, clamped to `[min, max]` on every write
    pub fn new(value: f32, min: f32, max: f32) -> Self {
        let lane = Self {
            seq: AtomicU64::new(0),
            previous: AtomicSegment::default(),
            current: AtomicSegment::default(),
            min,
            max,
        };
        let value = value.clamp(min, max);
        lane.previous.store(Segment::constant(value));
        lane.current.store(Segment::constant(value));
        lane
    }

    /// Create a shared lane
    pub fn shared(value: f32, min: f32, max: f32) -> Arc<Self> {
        Arc::new(Self::new(value, min, max))
    }

    /// Try to read a consistent snapshot (returns `None` on a torn read)
    #[inline]
    pub fn try_snapshot(&self) -> Option<LaneSnapshot> {
        let s1 = self.seq.load(Ordering::Acquire);
        if s1 & 1 == 1 {
            return None;
        }
        let previous = self.previous.load();
        let current = self.current.load();
        fence(Ordering::Acquire);
        let s2 = self.seq.load(Ordering::Relaxed);
        (s1 == s2).then_some(LaneSnapshot { previous, current })
    }

    /// Value in effect at `frame`, as seen by the writer
    ///
    /// Only meaningful on the writer thread, where reads are never torn.
    pub fn value_at(&self, frame: u64) -> f32 {
        self.snapshot_for_writer().value_at(frame)
    }

    /// Value the lane settles at once all automation has run
    pub fn target(&self) -> f32 {
        self.snapshot_for_writer().current.to
    }

    /// Jump to `value` at `frame`, holding the previous automation until then
    pub fn set_value_at(&self, value: f32, frame: u64) {
        let value = value.clamp(self.min, self.max);
        self.push_segment(|_| Segment {
            start: frame,
            end: frame,
            from: value,
            to: value,
        });
    }

    /// Ramp linearly from the value in effect at `start` to `value` at `end`
    pub fn ramp_to(&self, value: f32, start: u64, end: u64) {
        let value = value.clamp(self.min, self.max);
        self.push_segment(|snapshot| Segment {
            start,
            end: end.max(start),
            from: snapshot.value_at(start),
            to: value,
        });
    }

    /// Ramp from an explicit starting value
    pub fn ramp_between(&self, from: f32, to: f32, start: u64, end: u64) {
        let from = from.clamp(self.min, self.max);
        let to = to.clamp(self.min, self.max);
        self.push_segment(|_| Segment {
            start,
            end: end.max(start),
            from,
            to,
        });
    }

    /// Replace all automation with a constant value, effective immediately
    pub fn set_now(&self, value: f32) {
        let value = value.clamp(self.min, self.max);
        self.write(LaneSnapshot::constant(value));
    }

    fn snapshot_for_writer(&self) -> LaneSnapshot {
        LaneSnapshot {
            previous: self.previous.load(),
            current: self.current.load(),
        }
    }

    fn push_segment(&self, build: impl FnOnce(&LaneSnapshot) -> Segment) {
        let snapshot = self.snapshot_for_writer();
        let segment = build(&snapshot);
        self.write(LaneSnapshot {
            previous: snapshot.current,
            current: segment,
        });
    }

    fn write(&self, snapshot: LaneSnapshot) {
        let s = self.seq.load(Ordering::Relaxed);
        self.seq.store(s.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.previous.store(snapshot.previous);
        self.current.store(snapshot.current);
        self.seq.store(s.wrapping_add(2), Ordering::Release);
    }
}

impl std::fmt::Debug for AutomationLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationLane")
            .field("current", &self.current.load())
            .finish()
    }
}

/// Render-side view of a lane with a cached fallback snapshot
pub struct LaneReader {
    lane: Arc<AutomationLane>,
    cached: LaneSnapshot,
}

impl LaneReader {
    pub fn new(lane: Arc<AutomationLane>) -> Self {
        let cached = lane
            .try_snapshot()
            .unwrap_or_else(|| LaneSnapshot::constant(0.0));
        Self { lane, cached }
    }

    /// Refresh the cached snapshot (call once per block)
    #[inline]
    pub fn refresh(&mut self) -> &LaneSnapshot {
        if let Some(snapshot) = self.lane.try_snapshot() {
            self.cached = snapshot;
        }
        &self.cached
    }

    /// Last consistent snapshot
    #[inline]
    pub fn snapshot(&self) -> &LaneSnapshot {
        &self.cached
    }

    /// The lane this reader follows
    pub fn lane(&self) -> &Arc<AutomationLane> {
        &self.lane
    }
}

//! Deferred control actions keyed by channel and slot
//!
//! A min-heap of `(due frame, sequence)` entries drained by the scheduler's
//! `tick`. Each `(channel, slot)` key has at most one live entry: scheduling
//! again supersedes the pending entry, which is then dropped when it surfaces.
//!
//! Dispatch entries become due a lookahead before their effective frame so
//! the engine receives the command in time to apply it sample-accurately.
//! Finalize entries become due at the effective frame itself.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::types::ChannelId;

/// What a channel entry controls; one live entry per slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Start / stop lifecycle
    Transport,
    /// Loop-fraction restart
    Loop,
    /// Quantized volume change
    Volume,
}

pub type TimelineKey = (ChannelId, Slot);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Dispatch,
    Finalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartVoice,
    MarkPlaying,
    StopVoice,
    FinishStop,
    /// Start a stopped channel once its voice has faded out
    StartAfterFade,
    RestartLoop,
    ApplyVolume,
}

/// An entry popped from the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueAction {
    pub key: TimelineKey,
    pub effective: u64,
    pub action: Action,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    seq: u64,
    effective: u64,
    action: Action,
}

#[derive(Debug)]
struct Entry {
    due: u64,
    seq: u64,
    key: TimelineKey,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
pub struct Timeline {
    heap: BinaryHeap<Entry>,
    live: HashMap<TimelineKey, Pending>,
    next_seq: u64,
    lookahead: u64,
}

impl Timeline {
    /// `lookahead` in frames, applied to dispatch entries
    pub fn new(lookahead: u64) -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_seq: 0,
            lookahead,
        }
    }

    pub fn lookahead(&self) -> u64 {
        self.lookahead
    }

    /// Schedule `action` for `key`, superseding any pending entry
    pub fn schedule(&mut self, key: TimelineKey, effective: u64, phase: Phase, action: Action) {
        let due = match phase {
            Phase::Dispatch => effective.saturating_sub(self.lookahead),
            Phase::Finalize => effective,
        };
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(old) = self.live.insert(
            key,
            Pending {
                seq,
                effective,
                action,
            },
        ) {
            log::trace!("{:?} superseded {:?} at {}", key, old.action, old.effective);
        }
        self.heap.push(Entry { due, seq, key });
    }

    /// Drop the pending entry for `key`
    pub fn cancel(&mut self, key: TimelineKey) -> bool {
        self.live.remove(&key).is_some()
    }

    /// Drop every pending entry of a channel
    pub fn cancel_channel(&mut self, channel: ChannelId) {
        self.live.retain(|(id, _), _| *id != channel);
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    /// Effective frame and action pending for `key`
    pub fn pending(&self, key: TimelineKey) -> Option<(u64, Action)> {
        self.live.get(&key).map(|p| (p.effective, p.action))
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Pop the next entry due at or before `now`
    pub fn pop_due(&mut self, now: u64) -> Option<DueAction> {
        while let Some(top) = self.heap.peek() {
            if top.due > now {
                break;
            }
            let entry = self.heap.pop()?;
            match self.live.get(&entry.key) {
                Some(pending) if pending.seq == entry.seq => {
                    let pending = *pending;
                    self.live.remove(&entry.key);
                    return Some(DueAction {
                        key: entry.key,
                        effective: pending.effective,
                        action: pending.action,
                    });
                }
                // Superseded or cancelled
                _ => continue,
            }
        }
        None
    }
}

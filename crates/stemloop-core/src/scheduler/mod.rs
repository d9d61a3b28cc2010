//! Playback scheduler - channel lifecycle on the musical grid
//!
//! Runs in the control domain. Owns the musical clock, the effect pool and
//! every channel's state, and talks to the render engine through the command
//! queue and automation lanes only.
//!
//! Channel lifecycle:
//!
//! ```text
//! Stopped ──add──► Starting{at} ──tick──► Playing ──remove──► Stopping{at} ──tick──► (gone)
//!    ▲                                       │
//!    └───────────────── stop() ──────────────┘
//! ```
//!
//! While the transport runs, starts and stops land on the next bar, volume and
//! loop-length changes on the next beat. With the transport stopped they
//! apply immediately. Filter, delay and pitch values are always immediate.
//!
//! Deferred work sits in a [`Timeline`] and is executed by [`tick`], which the
//! host calls regularly (at least once per lookahead window).
//!
//! [`tick`]: PlaybackScheduler::tick

mod channel;
mod timeline;

pub use channel::{ChannelParams, ChannelSpec, ParameterKind, PlaybackState, MIN_LOOP_FRACTION};
pub use timeline::{Action, DueAction, Phase, Slot, Timeline, TimelineKey};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::clock::{AudioClock, FrameClock, MusicalClock, MusicalPosition};
use crate::config::LooperConfig;
use crate::effect::EffectKind;
use crate::engine::{CommandSender, EngineCommand, MasterBus, SharedStem, VoiceLanes};
use crate::pool::{EffectPool, UnitHandle};
use crate::types::{ChannelId, Stem};

use channel::{configure_unit, Channel};

/// Control-domain owner of every channel's playback
pub struct PlaybackScheduler<C: AudioClock = FrameClock> {
    clock: C,
    musical: MusicalClock,
    pool: EffectPool,
    master: MasterBus,
    commands: CommandSender,
    /// Automation lanes per engine voice slot
    lanes: Vec<VoiceLanes>,
    free_voices: BTreeSet<usize>,
    channels: BTreeMap<ChannelId, Channel>,
    timeline: Timeline,
    fade_frames: u64,
}

impl<C: AudioClock> PlaybackScheduler<C> {
    /// Create a scheduler driving one engine
    ///
    /// `lanes` must be the same voice lanes the engine was built with.
    pub fn new(
        clock: C,
        config: &LooperConfig,
        pool: EffectPool,
        master: MasterBus,
        commands: CommandSender,
        lanes: Vec<VoiceLanes>,
    ) -> Self {
        let config = config.validated();
        if clock.sample_rate() != config.sample_rate {
            log::warn!(
                "Clock runs at {} Hz but config says {} Hz",
                clock.sample_rate(),
                config.sample_rate
            );
        }
        Self {
            musical: MusicalClock::new(config.default_bpm),
            free_voices: (0..lanes.len()).collect(),
            channels: BTreeMap::new(),
            timeline: Timeline::new(config.lookahead_frames()),
            fade_frames: config.fade_frames(),
            clock,
            pool,
            master,
            commands,
            lanes,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Channels
    // ─────────────────────────────────────────────────────────────

    /// Register a channel and start it (on the next bar while running)
    ///
    /// A channel that is fading out resumes instead. Returns whether the
    /// channel is now starting or playing because of this call.
    pub fn add_channel(&mut self, id: ChannelId, stem: SharedStem, params: ChannelParams) -> bool {
        if !stem.has_audio() {
            log::warn!("add_channel {}: stem '{}' has no audio", id, stem.name);
            return false;
        }
        let params = params.clamped();
        let now = self.now();

        if let Some(state) = self.state_of(id) {
            match state {
                PlaybackState::Starting { .. } | PlaybackState::Playing => {
                    log::debug!("add_channel {}: already {:?}", id, state);
                    return false;
                }
                PlaybackState::Stopping { at } if at > now => {
                    self.resume(id, stem, params, now);
                    return true;
                }
                PlaybackState::Stopping { .. } => self.finish_removal(id),
                PlaybackState::Stopped => {
                    if let Some(channel) = self.channels.get_mut(&id) {
                        channel.stem = stem;
                    }
                    self.apply_params(id, params);
                    self.start_when_silent(id, now);
                    return true;
                }
            }
        }

        let Some(voice) = self.free_voices.pop_first() else {
            log::warn!("add_channel {}: all {} voices in use", id, self.lanes.len());
            return false;
        };
        if self.musical.adopt_bpm(stem.bpm) {
            log::info!("Master tempo follows '{}': {:.2} BPM", stem.name, self.musical.bpm());
            self.refresh_rates();
        }

        log::debug!("Channel {} gets voice {} ('{}')", id, voice, stem.name);
        self.channels.insert(id, Channel::new(stem, params, voice));
        self.reconcile_units(id, now);
        self.begin_start(id, now);
        true
    }

    /// Stop a channel (on the next bar while running) and unregister it
    ///
    /// Removing an unknown or already-stopping channel does nothing. A
    /// stopped channel whose voice is still fading out keeps its voice and
    /// units until the fade ends.
    pub fn remove_channel(&mut self, id: ChannelId) {
        let now = self.now();
        let Some(channel) = self.channels.get(&id) else {
            log::warn!("remove_channel {}: not registered", id);
            return;
        };
        let (state, voice, live, silent_at) = (
            channel.state,
            channel.voice,
            channel.voice_live,
            channel.silent_at,
        );

        match state {
            PlaybackState::Stopping { at } => {
                log::debug!("remove_channel {}: already stopping at {}", id, at);
            }
            PlaybackState::Stopped if silent_at > now => {
                self.set_state(id, PlaybackState::Stopping { at: silent_at });
                self.timeline.schedule(
                    (id, Slot::Transport),
                    silent_at,
                    Phase::Finalize,
                    Action::FinishStop,
                );
            }
            PlaybackState::Stopped => self.finish_removal(id),
            PlaybackState::Starting { .. } => {
                if live {
                    self.commands.send(EngineCommand::StopVoice {
                        voice,
                        at_frame: now,
                    });
                }
                self.finish_removal(id);
            }
            PlaybackState::Playing => {
                self.timeline.cancel((id, Slot::Loop));
                self.timeline.cancel((id, Slot::Volume));

                if self.musical.is_running() {
                    let at = self.next_bar_frame(now);
                    self.set_state(id, PlaybackState::Stopping { at });
                    self.timeline.schedule(
                        (id, Slot::Transport),
                        at,
                        Phase::Dispatch,
                        Action::StopVoice,
                    );
                } else {
                    let at = now + self.fade_frames;
                    self.set_state(id, PlaybackState::Stopping { at });
                    self.dispatch_stop(id, at, now);
                }
            }
        }
    }

    /// Change one parameter of a channel
    ///
    /// Values are clamped to their range. Changes that attach or detach a
    /// pooled unit restart the channel's source from the loop start.
    pub fn set_channel_parameter(&mut self, id: ChannelId, kind: ParameterKind, value: f32) {
        let now = self.now();
        let Some(channel) = self.channels.get_mut(&id) else {
            log::warn!("set_channel_parameter {}: unknown channel", id);
            return;
        };
        if !channel.stem.has_audio() {
            log::warn!("set_channel_parameter {}: stem has no audio", id);
            return;
        }

        let previous = channel.params.get(kind);
        if channel.params.set(kind, value) == previous {
            return;
        }

        match kind {
            ParameterKind::Volume => self.apply_volume(id, now),
            ParameterKind::LoopFraction => self.apply_loop_fraction(id, now),
            ParameterKind::DelayTime | ParameterKind::DelayFeedback => {
                self.apply_delay_settings(id, now)
            }
            ParameterKind::Filter | ParameterKind::DelayWet | ParameterKind::Pitch => {
                if !self.reconcile_units(id, now) {
                    self.apply_continuous(id, kind, now);
                }
            }
        }
    }

    /// Make the registered set match `active`
    ///
    /// Channels missing from `active` are removed; new ones are added from
    /// `all`; channels that keep playing take the parameters from `all`.
    pub fn update_active_channels(
        &mut self,
        active: &[ChannelId],
        all: &HashMap<ChannelId, ChannelSpec>,
    ) {
        let wanted: BTreeSet<ChannelId> = active.iter().copied().collect();

        let stale: Vec<ChannelId> = self
            .channels
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for id in stale {
            self.remove_channel(id);
        }

        for id in wanted {
            let Some(spec) = all.get(&id) else {
                log::warn!("update_active_channels: no stem for {}", id);
                continue;
            };
            match self.state_of(id) {
                Some(PlaybackState::Starting { .. }) | Some(PlaybackState::Playing) => {
                    self.apply_params(id, spec.params.clamped());
                }
                _ => {
                    self.add_channel(id, spec.stem.clone(), spec.params);
                }
            }
        }
    }

    /// Release every pooled unit, detaching them from all channels
    ///
    /// Returns the channels that held at least one unit. Playing channels
    /// among them restart without effects. Channels that are fading out lose
    /// their units too: the dry fade continues, effect tails end at once.
    pub fn release_all_units(&mut self) -> Vec<ChannelId> {
        let now = self.now();
        let affected = self.pool.release_all();
        for id in &affected {
            if let Some(channel) = self.channels.get_mut(id) {
                channel.delay = None;
                channel.filter = None;
                channel.pitch = None;
            }
            self.reroute_live(*id, now);
        }
        log::info!("Released all units ({} channels affected)", affected.len());
        affected
    }

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────

    /// Start the transport with bar 0 at the current time
    ///
    /// Every registered channel (re)starts at the transport start.
    pub fn start(&mut self) {
        if self.musical.is_running() {
            log::debug!("start: transport already running");
            return;
        }
        let now = self.now();
        self.musical.start(self.clock.now());
        log::info!(
            "Transport started at frame {} ({:.2} BPM)",
            now,
            self.musical.bpm()
        );

        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            let Some(channel) = self.channels.get(&id) else {
                continue;
            };
            match (channel.state, channel.voice_live) {
                (PlaybackState::Playing, true) => self.restart_voice(id, now),
                (PlaybackState::Stopped, _) | (PlaybackState::Playing, false) => {
                    self.set_state(id, PlaybackState::Playing);
                    self.dispatch_start(id, now);
                }
                _ => {}
            }
        }
    }

    /// Fade out every voice, cancel all pending work and stop the transport
    ///
    /// Channels stay registered and `Stopped`; ones that were being removed
    /// finish their removal once the fade is over.
    pub fn stop(&mut self) {
        let now = self.now();
        let at = now + self.fade_frames;
        self.musical.stop();
        self.timeline.clear();

        for (id, channel) in self.channels.iter_mut() {
            if channel.voice_live {
                self.lanes[channel.voice].gain.ramp_to(0.0, now, at);
                channel.silent_at = at;
            }
            if let PlaybackState::Stopping { .. } = channel.state {
                channel.state = PlaybackState::Stopping { at };
                self.timeline
                    .schedule((*id, Slot::Transport), at, Phase::Finalize, Action::FinishStop);
            } else {
                channel.state = PlaybackState::Stopped;
                channel.voice_live = false;
            }
        }
        self.commands.send(EngineCommand::StopAll { at_frame: at });
        log::info!("Transport stopped at frame {}", now);
    }

    /// Set the master tempo explicitly
    ///
    /// Bar and beat lengths change immediately; already scheduled events
    /// keep their frames.
    pub fn set_master_bpm(&mut self, bpm: f64) {
        self.musical.set_bpm(bpm);
        self.refresh_rates();
        log::info!("Master tempo set to {:.2} BPM", self.musical.bpm());
    }

    /// Position on the bar/beat grid (zeros while stopped)
    pub fn get_musical_position(&self) -> MusicalPosition {
        self.musical.position_at(self.clock.now())
    }

    /// Execute deferred work that is due
    ///
    /// Returns the number of entries executed.
    pub fn tick(&mut self) -> usize {
        let now = self.now();
        let mut fired = 0;
        while let Some(due) = self.timeline.pop_due(now) {
            self.fire(due, now);
            fired += 1;
        }
        fired
    }

    // ─────────────────────────────────────────────────────────────
    // Master bus
    // ─────────────────────────────────────────────────────────────

    pub fn set_master_filter(&mut self, normalized: f32) {
        self.master.set_filter(normalized);
    }

    pub fn set_master_delay_time(&mut self, normalized: f32) {
        self.master.set_delay_time(normalized, self.now());
    }

    pub fn set_master_delay_feedback(&mut self, percent: f32) {
        self.master.set_delay_feedback(percent, self.now());
    }

    pub fn set_master_delay_wet(&mut self, wet: f32) {
        self.master.set_delay_wet(wet, self.now());
    }

    pub fn set_master_pitch(&mut self, normalized: f32) {
        self.master.set_pitch(normalized);
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.master.set_volume(volume, self.now());
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn is_running(&self) -> bool {
        self.musical.is_running()
    }

    pub fn master_bpm(&self) -> f64 {
        self.musical.bpm()
    }

    pub fn bar_duration(&self) -> f64 {
        self.musical.bar_duration()
    }

    pub fn beat_duration(&self) -> f64 {
        self.musical.beat_duration()
    }

    pub fn channel_state(&self, id: ChannelId) -> Option<PlaybackState> {
        self.state_of(id)
    }

    pub fn channel_params(&self, id: ChannelId) -> Option<ChannelParams> {
        self.channels.get(&id).map(|c| c.params)
    }

    /// Unit of `kind` currently held by a channel
    pub fn channel_unit(&self, id: ChannelId, kind: EffectKind) -> Option<&UnitHandle> {
        self.channels.get(&id).and_then(|c| c.unit(kind))
    }

    /// Registered channels in id order
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }

    pub fn pool(&self) -> &EffectPool {
        &self.pool
    }

    pub fn available_count(&self, kind: EffectKind) -> usize {
        self.pool.available_count(kind)
    }

    pub fn master(&self) -> &MasterBus {
        &self.master
    }

    /// Voice slots not held by any channel
    pub fn free_voices(&self) -> usize {
        self.free_voices.len()
    }

    /// Deferred entries not yet executed
    pub fn pending_events(&self) -> usize {
        self.timeline.len()
    }

    // ─────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────

    fn now(&self) -> u64 {
        self.clock.now_frames()
    }

    fn frames_to_seconds(&self, frames: u64) -> f64 {
        frames as f64 / self.clock.sample_rate() as f64
    }

    fn next_bar_frame(&self, now: u64) -> u64 {
        let at = self.musical.next_bar_time(self.frames_to_seconds(now));
        self.clock.seconds_to_frames(at).max(now)
    }

    fn next_beat_frame(&self, now: u64) -> u64 {
        let at = self.musical.next_beat_time(self.frames_to_seconds(now));
        self.clock.seconds_to_frames(at).max(now)
    }

    fn state_of(&self, id: ChannelId) -> Option<PlaybackState> {
        self.channels.get(&id).map(|c| c.state)
    }

    fn set_state(&mut self, id: ChannelId, state: PlaybackState) {
        if let Some(channel) = self.channels.get_mut(&id) {
            log::trace!("Channel {}: {:?} -> {:?}", id, channel.state, state);
            channel.state = state;
        }
    }

    /// Start a stopped channel, waiting for its voice's fade-out first
    fn start_when_silent(&mut self, id: ChannelId, now: u64) {
        let Some(silent_at) = self.channels.get(&id).map(|c| c.silent_at) else {
            return;
        };
        if silent_at > now {
            self.timeline.schedule(
                (id, Slot::Transport),
                silent_at,
                Phase::Finalize,
                Action::StartAfterFade,
            );
        } else {
            self.begin_start(id, now);
        }
    }

    fn begin_start(&mut self, id: ChannelId, now: u64) {
        if self.musical.is_running() {
            let at = self.next_bar_frame(now);
            self.set_state(id, PlaybackState::Starting { at });
            self.timeline
                .schedule((id, Slot::Transport), at, Phase::Dispatch, Action::StartVoice);
        } else {
            self.set_state(id, PlaybackState::Playing);
            self.dispatch_start(id, now);
        }
    }

    /// Send the voice start and fade the gain in from `at`
    fn dispatch_start(&mut self, id: ChannelId, at: u64) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let lanes = &self.lanes[channel.voice];
        lanes.rate.set_now(playback_rate(
            self.musical.bpm(),
            &channel.stem,
            self.clock.sample_rate(),
        ));
        lanes.send.set_now(channel.send_level());
        lanes
            .gain
            .ramp_between(0.0, channel.params.volume, at, at + self.fade_frames);

        channel.voice_live = self.commands.send(EngineCommand::StartVoice {
            voice: channel.voice,
            stem: channel.stem.clone(),
            loop_frames: channel.loop_frames(),
            start_frame: at,
            route: channel.route(),
        });
    }

    /// Fade out so the gain reaches zero exactly at `at`, then stop there
    fn dispatch_stop(&mut self, id: ChannelId, at: u64, now: u64) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.silent_at = at;
        let fade_start = at.saturating_sub(self.fade_frames).max(now);
        self.lanes[channel.voice].gain.ramp_to(0.0, fade_start, at);
        self.commands.send(EngineCommand::StopVoice {
            voice: channel.voice,
            at_frame: at,
        });
        self.timeline
            .schedule((id, Slot::Transport), at, Phase::Finalize, Action::FinishStop);
    }

    /// Drop a channel: units back to the pool, voice slot freed
    fn finish_removal(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        self.timeline.cancel_channel(id);
        let released = self.pool.release_channel(id);
        self.free_voices.insert(channel.voice);
        log::debug!(
            "Channel {} removed (voice {}, {} units released)",
            id,
            channel.voice,
            released
        );
    }

    /// Bring a fading-out channel back to `Playing`
    fn resume(&mut self, id: ChannelId, stem: SharedStem, params: ChannelParams, now: u64) {
        self.timeline.cancel((id, Slot::Transport));
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.stem = stem;
        if !channel.voice_live {
            // Silenced by `stop()` before the removal: start over afterwards
            channel.state = PlaybackState::Stopped;
            self.apply_params(id, params);
            self.reconcile_units(id, now);
            self.start_when_silent(id, now);
            return;
        }
        channel.state = PlaybackState::Playing;
        self.commands.send(EngineCommand::CancelStop {
            voice: channel.voice,
        });
        self.lanes[channel.voice]
            .gain
            .ramp_to(channel.params.volume, now, now + self.fade_frames);
        log::debug!("Channel {} resumed before its stop", id);

        self.apply_params(id, params);
        self.reconcile_units(id, now);
    }

    /// Apply every parameter that differs from the channel's current values
    fn apply_params(&mut self, id: ChannelId, params: ChannelParams) {
        let Some(current) = self.channels.get(&id).map(|c| c.params) else {
            return;
        };
        for kind in ParameterKind::ALL {
            if current.get(kind) != params.get(kind) {
                self.set_channel_parameter(id, kind, params.get(kind));
            }
        }
    }

    /// Assign or release pooled units to match the channel's parameters
    ///
    /// Returns whether the channel's unit route changed.
    fn reconcile_units(&mut self, id: ChannelId, now: u64) -> bool {
        let Some(channel) = self.channels.get_mut(&id) else {
            return false;
        };
        if let PlaybackState::Stopping { .. } = channel.state {
            return false;
        }

        let mut changed = false;
        for kind in EffectKind::ALL {
            let needed = channel.params.needs(kind);
            let held = channel.unit(kind).is_some();
            if needed && !held {
                // Exhaustion is logged by the pool; the channel plays without it
                if let Some(handle) = self.pool.assign(kind, id) {
                    configure_unit(&handle, &channel.params);
                    log::debug!("Channel {} took {} unit {}", id, kind, handle.index);
                    *channel.unit_slot(kind) = Some(handle);
                    changed = true;
                }
            } else if !needed && held {
                self.pool.release(kind, id);
                *channel.unit_slot(kind) = None;
                log::debug!("Channel {} released its {} unit", id, kind);
                changed = true;
            }
        }

        if changed {
            self.reroute_live(id, now);
        }
        changed
    }

    /// Restart a sounding voice through the channel's current units
    fn reroute_live(&mut self, id: ChannelId, now: u64) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        if !channel.voice_live {
            return;
        }
        let at = match channel.state {
            PlaybackState::Starting { at } => at.max(now),
            PlaybackState::Playing => now,
            _ => return,
        };

        let lanes = &self.lanes[channel.voice];
        lanes.send.set_now(channel.send_level());
        lanes
            .gain
            .ramp_between(0.0, channel.params.volume, at, at + self.fade_frames);
        self.commands.send(EngineCommand::Reroute {
            voice: channel.voice,
            route: channel.route(),
            at_frame: at,
        });
    }

    /// Restart from the loop start at `at` with the current loop length
    fn restart_voice(&mut self, id: ChannelId, at: u64) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        self.lanes[channel.voice]
            .gain
            .ramp_between(0.0, channel.params.volume, at, at + self.fade_frames);
        self.commands.send(EngineCommand::RestartVoice {
            voice: channel.voice,
            loop_frames: channel.loop_frames(),
            at_frame: at,
        });
    }

    fn apply_volume(&mut self, id: ChannelId, now: u64) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        let (voice, volume) = (channel.voice, channel.params.volume);

        match (channel.state, channel.voice_live) {
            (PlaybackState::Playing, _) if self.musical.is_running() => {
                let at = self.next_beat_frame(now);
                self.timeline
                    .schedule((id, Slot::Volume), at, Phase::Dispatch, Action::ApplyVolume);
            }
            (PlaybackState::Playing, _) => {
                self.lanes[voice]
                    .gain
                    .ramp_to(volume, now, now + self.fade_frames);
            }
            // Keep clear of the fade-in
            (PlaybackState::Starting { at }, true) => {
                let at = self.next_beat_frame(now).max(at + self.fade_frames);
                self.timeline
                    .schedule((id, Slot::Volume), at, Phase::Dispatch, Action::ApplyVolume);
            }
            // Picked up by the next start
            _ => {}
        }
    }

    fn apply_loop_fraction(&mut self, id: ChannelId, now: u64) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        match (channel.state, channel.voice_live) {
            (PlaybackState::Playing, _) if self.musical.is_running() => {
                let at = self.next_beat_frame(now);
                self.timeline
                    .schedule((id, Slot::Loop), at, Phase::Dispatch, Action::RestartLoop);
            }
            (PlaybackState::Playing, true) => self.restart_voice(id, now),
            (PlaybackState::Starting { at }, true) => {
                self.commands.send(EngineCommand::RestartVoice {
                    voice: channel.voice,
                    loop_frames: channel.loop_frames(),
                    at_frame: at,
                });
            }
            _ => {}
        }
    }

    fn apply_delay_settings(&mut self, id: ChannelId, now: u64) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        if let Some(delay) = channel.delay.as_ref().and_then(|h| h.params.as_delay()) {
            let end = now + self.fade_frames;
            delay
                .delay_time
                .ramp_to(channel.params.delay_seconds(), now, end);
            delay.feedback.ramp_to(channel.params.feedback(), now, end);
        }
    }

    /// Filter, wet and pitch changes on a unit the channel already holds
    fn apply_continuous(&mut self, id: ChannelId, kind: ParameterKind, now: u64) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        match kind {
            ParameterKind::Filter => {
                if let Some(filter) = channel.filter.as_ref().and_then(|h| h.params.as_filter()) {
                    filter.apply(channel.params.filter_setting());
                }
            }
            ParameterKind::DelayWet => {
                if channel.delay.is_some() {
                    self.lanes[channel.voice].send.ramp_to(
                        channel.params.delay_wet,
                        now,
                        now + self.fade_frames,
                    );
                }
            }
            ParameterKind::Pitch => {
                if let Some(pitch) = channel.pitch.as_ref().and_then(|h| h.params.as_pitch()) {
                    pitch.ratio.set_now(channel.params.pitch_ratio());
                }
            }
            _ => {}
        }
    }

    /// Push playback rates after a tempo change
    fn refresh_rates(&self) {
        let bpm = self.musical.bpm();
        let sample_rate = self.clock.sample_rate();
        for channel in self.channels.values() {
            self.lanes[channel.voice]
                .rate
                .set_now(playback_rate(bpm, &channel.stem, sample_rate));
        }
    }

    fn fire(&mut self, due: DueAction, now: u64) {
        let (id, _) = due.key;
        let Some(state) = self.state_of(id) else {
            return;
        };

        match (due.action, state) {
            (Action::StartVoice, PlaybackState::Starting { at }) => {
                self.dispatch_start(id, at);
                self.timeline
                    .schedule((id, Slot::Transport), at, Phase::Finalize, Action::MarkPlaying);
            }
            (Action::MarkPlaying, PlaybackState::Starting { .. }) => {
                self.set_state(id, PlaybackState::Playing);
            }
            (Action::StopVoice, PlaybackState::Stopping { at }) => {
                self.dispatch_stop(id, at, now);
            }
            (Action::FinishStop, PlaybackState::Stopping { .. }) => self.finish_removal(id),
            (Action::StartAfterFade, PlaybackState::Stopped) => self.begin_start(id, now),
            (Action::RestartLoop, PlaybackState::Playing) => {
                self.restart_voice(id, due.effective);
            }
            (Action::ApplyVolume, PlaybackState::Playing | PlaybackState::Starting { .. }) => {
                if let Some(channel) = self.channels.get(&id) {
                    self.lanes[channel.voice].gain.ramp_to(
                        channel.params.volume,
                        due.effective,
                        due.effective + self.fade_frames,
                    );
                }
            }
            (action, state) => {
                log::debug!("Dropping {:?} for {} in state {:?}", action, id, state);
            }
        }
    }
}

/// Engine playback rate for a stem: tempo match times sample-rate conversion
fn playback_rate(master_bpm: f64, stem: &Stem, engine_rate: u32) -> f32 {
    let tempo = if stem.bpm.is_finite() && stem.bpm > 0.0 {
        master_bpm / stem.bpm
    } else {
        1.0
    };
    let resample = if stem.sample_rate > 0 && engine_rate > 0 {
        stem.sample_rate as f64 / engine_rate as f64
    } else {
        1.0
    };
    (tempo * resample) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::NativeUnitFactory;
    use crate::engine::{command_channel, master_bus, StemCollector};
    use crate::types::{StemKind, StereoBuffer, StereoSample, SAMPLE_RATE};

    struct Rig {
        scheduler: PlaybackScheduler,
        clock: FrameClock,
        rx: rtrb::Consumer<EngineCommand>,
        collector: StemCollector,
    }

    fn rig() -> Rig {
        let config = LooperConfig {
            pool_capacity: 2,
            max_channels: 4,
            ..LooperConfig::default()
        };
        let clock = FrameClock::new(SAMPLE_RATE);
        let mut factory = NativeUnitFactory::new(SAMPLE_RATE, 1.0, config.block_size);
        let (pool, _rack) = EffectPool::build(config.pool_capacity, &mut factory);
        let (master, _chain) = master_bus(SAMPLE_RATE, 1.0, config.block_size, config.fade_frames());
        let (tx, rx) = command_channel(64);
        let lanes = (0..config.max_channels).map(|_| VoiceLanes::new()).collect();

        Rig {
            scheduler: PlaybackScheduler::new(clock.clone(), &config, pool, master, tx, lanes),
            clock,
            rx,
            collector: StemCollector::spawn().unwrap(),
        }
    }

    impl Rig {
        fn stem(&self, bpm: f64) -> SharedStem {
            self.collector.share(Stem::new(
                "loop",
                StemKind::Drums,
                bpm,
                SAMPLE_RATE,
                StereoBuffer::from_vec(vec![StereoSample::mono(0.5); 96_000]),
            ))
        }

        fn commands(&mut self) -> Vec<EngineCommand> {
            std::iter::from_fn(|| self.rx.pop().ok()).collect()
        }

        /// Move the clock to `frame` and run due work
        fn advance_to(&mut self, frame: u64) {
            let now = self.clock.now_frames();
            self.clock.advance(frame.saturating_sub(now));
            self.scheduler.tick();
        }
    }

    #[test]
    fn test_add_while_stopped_starts_now() {
        let mut rig = rig();
        rig.clock.advance(1000);
        let stem = rig.stem(120.0);
        assert!(rig.scheduler.add_channel(ChannelId(1), stem, ChannelParams::default()));

        assert_eq!(rig.scheduler.channel_state(ChannelId(1)), Some(PlaybackState::Playing));
        let commands = rig.commands();
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            commands[0],
            EngineCommand::StartVoice { voice: 0, start_frame: 1000, loop_frames: 96_000, .. }
        ));
    }

    #[test]
    fn test_first_channel_sets_tempo() {
        let mut rig = rig();
        let slow = rig.stem(100.0);
        let fast = rig.stem(140.0);
        rig.scheduler.add_channel(ChannelId(1), slow, ChannelParams::default());
        rig.scheduler.add_channel(ChannelId(2), fast, ChannelParams::default());
        assert_eq!(rig.scheduler.master_bpm(), 100.0);
        assert!((rig.scheduler.bar_duration() - 2.4).abs() < 1e-12);
    }

    #[test]
    fn test_explicit_tempo_wins() {
        let mut rig = rig();
        rig.scheduler.set_master_bpm(90.0);
        let stem = rig.stem(128.0);
        rig.scheduler.add_channel(ChannelId(1), stem, ChannelParams::default());
        assert_eq!(rig.scheduler.master_bpm(), 90.0);
    }

    #[test]
    fn test_add_while_running_waits_for_bar() {
        let mut rig = rig();
        rig.scheduler.start();
        rig.clock.advance(62_400);

        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(3), stem, ChannelParams::default());
        assert_eq!(
            rig.scheduler.channel_state(ChannelId(3)),
            Some(PlaybackState::Starting { at: 96_000 })
        );
        assert!(rig.commands().is_empty());

        // 25 ms lookahead = 1200 frames
        rig.advance_to(96_000 - 1201);
        assert!(rig.commands().is_empty());
        rig.advance_to(96_000 - 1200);
        let commands = rig.commands();
        assert!(matches!(
            commands.as_slice(),
            [EngineCommand::StartVoice { start_frame: 96_000, .. }]
        ));
        assert!(matches!(
            rig.scheduler.channel_state(ChannelId(3)),
            Some(PlaybackState::Starting { .. })
        ));

        rig.advance_to(96_000);
        assert_eq!(rig.scheduler.channel_state(ChannelId(3)), Some(PlaybackState::Playing));
    }

    #[test]
    fn test_remove_before_start_cancels_it() {
        let mut rig = rig();
        rig.scheduler.start();
        rig.clock.advance(10_000);
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(1), stem, ChannelParams::default());
        rig.scheduler.remove_channel(ChannelId(1));

        assert_eq!(rig.scheduler.channel_state(ChannelId(1)), None);
        assert_eq!(rig.scheduler.free_voices(), 4);
        rig.advance_to(200_000);
        assert!(rig.commands().is_empty());
    }

    #[test]
    fn test_remove_twice_schedules_one_stop() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(1), stem, ChannelParams::default());
        rig.scheduler.start();
        rig.commands();

        rig.clock.advance(30_000);
        rig.scheduler.remove_channel(ChannelId(1));
        rig.scheduler.remove_channel(ChannelId(1));
        assert_eq!(
            rig.scheduler.channel_state(ChannelId(1)),
            Some(PlaybackState::Stopping { at: 96_000 })
        );
        assert_eq!(rig.scheduler.pending_events(), 1);

        rig.advance_to(96_000 - 1200);
        let commands = rig.commands();
        assert!(matches!(
            commands.as_slice(),
            [EngineCommand::StopVoice { voice: 0, at_frame: 96_000 }]
        ));
        rig.advance_to(96_000);
        assert_eq!(rig.scheduler.channel_state(ChannelId(1)), None);
        assert!(rig.commands().is_empty());
    }

    #[test]
    fn test_remove_unknown_channel_is_ignored() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(1), stem, ChannelParams::default());
        rig.commands();

        rig.scheduler.remove_channel(ChannelId(6));
        assert_eq!(rig.scheduler.channel_ids(), vec![ChannelId(1)]);
        assert_eq!(rig.scheduler.pending_events(), 0);
        assert!(rig.commands().is_empty());
    }

    #[test]
    fn test_readd_while_stopping_resumes() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(1), stem.clone(), ChannelParams::default());
        rig.scheduler.start();
        rig.scheduler.remove_channel(ChannelId(1));
        rig.commands();

        assert!(rig.scheduler.add_channel(ChannelId(1), stem, ChannelParams::default()));
        assert_eq!(rig.scheduler.channel_state(ChannelId(1)), Some(PlaybackState::Playing));
        assert!(matches!(
            rig.commands().as_slice(),
            [EngineCommand::CancelStop { voice: 0 }]
        ));
        rig.advance_to(200_000);
        assert_eq!(rig.scheduler.channel_state(ChannelId(1)), Some(PlaybackState::Playing));
    }

    #[test]
    fn test_delay_wet_attaches_and_detaches_unit() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(1), stem, ChannelParams::default());
        rig.commands();
        assert_eq!(rig.scheduler.available_count(EffectKind::Delay), 2);

        rig.scheduler
            .set_channel_parameter(ChannelId(1), ParameterKind::DelayWet, 0.4);
        assert_eq!(rig.scheduler.available_count(EffectKind::Delay), 1);
        assert!(rig.scheduler.channel_unit(ChannelId(1), EffectKind::Delay).is_some());
        match rig.commands().as_slice() {
            [EngineCommand::Reroute { route, .. }] => assert!(route.delay.is_some()),
            other => panic!("unexpected {:?}", other),
        }

        // Wet change on a held unit is a plain ramp
        rig.scheduler
            .set_channel_parameter(ChannelId(1), ParameterKind::DelayWet, 0.6);
        assert!(rig.commands().is_empty());

        rig.scheduler
            .set_channel_parameter(ChannelId(1), ParameterKind::DelayWet, 0.0);
        assert_eq!(rig.scheduler.available_count(EffectKind::Delay), 2);
        match rig.commands().as_slice() {
            [EngineCommand::Reroute { route, .. }] => assert!(route.delay.is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pool_exhaustion_degrades() {
        let mut rig = rig();
        let params = ChannelParams {
            filter: 0.5,
            ..ChannelParams::default()
        };
        for id in 0..3 {
            let stem = rig.stem(120.0);
            assert!(rig.scheduler.add_channel(ChannelId(id), stem, params));
        }
        assert_eq!(rig.scheduler.available_count(EffectKind::Filter), 0);
        assert!(rig.scheduler.channel_unit(ChannelId(2), EffectKind::Filter).is_none());
        assert_eq!(rig.scheduler.channel_state(ChannelId(2)), Some(PlaybackState::Playing));

        rig.scheduler.remove_channel(ChannelId(0));
        rig.advance_to(10_000);
        assert_eq!(rig.scheduler.available_count(EffectKind::Filter), 1);
    }

    #[test]
    fn test_loop_fraction_latest_wins() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(1), stem, ChannelParams::default());
        rig.scheduler.start();
        rig.commands();

        rig.clock.advance(1000);
        rig.scheduler
            .set_channel_parameter(ChannelId(1), ParameterKind::LoopFraction, 0.5);
        rig.scheduler
            .set_channel_parameter(ChannelId(1), ParameterKind::LoopFraction, 0.25);
        assert_eq!(rig.scheduler.pending_events(), 1);

        // Next beat at 0.5 s
        rig.advance_to(24_000);
        assert!(matches!(
            rig.commands().as_slice(),
            [EngineCommand::RestartVoice { loop_frames: 24_000, at_frame: 24_000, .. }]
        ));
    }

    #[test]
    fn test_volume_quantized_to_beat() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(1), stem, ChannelParams::default());
        rig.scheduler.start();
        rig.clock.advance(30_000);
        rig.scheduler
            .set_channel_parameter(ChannelId(1), ParameterKind::Volume, 0.25);
        rig.advance_to(48_000);

        let gain = &rig.scheduler.lanes[0].gain;
        assert!((gain.value_at(47_999) - 1.0).abs() < 1e-6);
        assert!((gain.value_at(48_000 + 240) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_stop_keeps_channels_registered() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(1), stem.clone(), ChannelParams::default());
        rig.scheduler.start();
        rig.clock.advance(5_000);
        rig.scheduler.add_channel(ChannelId(2), stem, ChannelParams::default());
        rig.commands();

        rig.scheduler.stop();
        assert!(!rig.scheduler.is_running());
        assert_eq!(rig.scheduler.pending_events(), 0);
        assert_eq!(rig.scheduler.channel_state(ChannelId(1)), Some(PlaybackState::Stopped));
        assert_eq!(rig.scheduler.channel_state(ChannelId(2)), Some(PlaybackState::Stopped));
        assert!(matches!(
            rig.commands().as_slice(),
            [EngineCommand::StopAll { at_frame: 5_240 }]
        ));
        assert_eq!(rig.scheduler.get_musical_position(), MusicalPosition::default());
    }

    #[test]
    fn test_stem_without_audio_is_ignored() {
        let mut rig = rig();
        let empty = rig.collector.share(Stem::new(
            "empty",
            StemKind::Fx,
            120.0,
            SAMPLE_RATE,
            StereoBuffer::silence(0),
        ));
        assert!(!rig.scheduler.add_channel(ChannelId(1), empty, ChannelParams::default()));
        assert!(rig.scheduler.channel_ids().is_empty());
    }

    #[test]
    fn test_update_active_channels() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        let mut all = HashMap::new();
        for id in 0..3 {
            all.insert(
                ChannelId(id),
                ChannelSpec {
                    stem: stem.clone(),
                    params: ChannelParams::default(),
                },
            );
        }

        rig.scheduler
            .update_active_channels(&[ChannelId(0), ChannelId(1)], &all);
        assert_eq!(rig.scheduler.channel_ids(), vec![ChannelId(0), ChannelId(1)]);

        if let Some(spec) = all.get_mut(&ChannelId(1)) {
            spec.params.pitch = 20.0;
        }
        rig.scheduler
            .update_active_channels(&[ChannelId(1), ChannelId(2)], &all);
        assert!(matches!(
            rig.scheduler.channel_state(ChannelId(0)),
            Some(PlaybackState::Stopping { .. })
        ));
        assert!(rig.scheduler.channel_unit(ChannelId(1), EffectKind::Pitch).is_some());
        assert_eq!(rig.scheduler.channel_state(ChannelId(2)), Some(PlaybackState::Playing));
    }

    #[test]
    fn test_release_all_units_reports_holders() {
        let mut rig = rig();
        for id in [2, 5] {
            let stem = rig.stem(120.0);
            let params = ChannelParams {
                delay_wet: 0.5,
                ..ChannelParams::default()
            };
            rig.scheduler.add_channel(ChannelId(id), stem, params);
        }
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(9), stem, ChannelParams::default());

        let mut affected = rig.scheduler.release_all_units();
        affected.sort();
        assert_eq!(affected, vec![ChannelId(2), ChannelId(5)]);
        assert_eq!(rig.scheduler.available_count(EffectKind::Delay), 2);
        assert!(rig.scheduler.channel_unit(ChannelId(2), EffectKind::Delay).is_none());
    }

    #[test]
    fn test_release_all_units_includes_stopping_channels() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        let params = ChannelParams {
            delay_wet: 0.5,
            ..ChannelParams::default()
        };
        rig.scheduler.add_channel(ChannelId(1), stem, params);
        rig.scheduler.start();
        rig.clock.advance(10_000);
        rig.scheduler.remove_channel(ChannelId(1));
        rig.commands();

        assert_eq!(rig.scheduler.release_all_units(), vec![ChannelId(1)]);
        assert_eq!(rig.scheduler.available_count(EffectKind::Delay), 2);
        assert_eq!(
            rig.scheduler.channel_state(ChannelId(1)),
            Some(PlaybackState::Stopping { at: 96_000 })
        );
        // A fading channel is not restarted to drop the unit
        assert!(rig.commands().is_empty());
    }

    #[test]
    fn test_remove_after_stop_waits_for_fade() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        let params = ChannelParams {
            filter: -0.5,
            ..ChannelParams::default()
        };
        rig.scheduler.add_channel(ChannelId(1), stem.clone(), params);
        rig.clock.advance(10_000);
        rig.scheduler.stop();
        rig.scheduler.remove_channel(ChannelId(1));
        rig.commands();

        // Voice 0 and the filter stay reserved until the fade-out ends
        assert_eq!(
            rig.scheduler.channel_state(ChannelId(1)),
            Some(PlaybackState::Stopping { at: 10_240 })
        );
        assert_eq!(rig.scheduler.available_count(EffectKind::Filter), 1);
        assert_eq!(rig.scheduler.free_voices(), 3);

        rig.scheduler.add_channel(ChannelId(2), stem, ChannelParams::default());
        match rig.commands().as_slice() {
            [EngineCommand::StartVoice { voice, .. }] => assert_ne!(*voice, 0),
            other => panic!("unexpected {:?}", other),
        }

        rig.advance_to(10_239);
        assert!(rig.scheduler.channel_state(ChannelId(1)).is_some());
        rig.advance_to(10_240);
        assert_eq!(rig.scheduler.channel_state(ChannelId(1)), None);
        assert_eq!(rig.scheduler.available_count(EffectKind::Filter), 2);
        assert_eq!(rig.scheduler.free_voices(), 3);
    }

    #[test]
    fn test_readd_after_stop_and_remove_starts_after_fade() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(1), stem.clone(), ChannelParams::default());
        rig.clock.advance(10_000);
        rig.scheduler.stop();
        rig.scheduler.remove_channel(ChannelId(1));
        rig.commands();

        assert!(rig.scheduler.add_channel(ChannelId(1), stem, ChannelParams::default()));
        assert_eq!(rig.scheduler.channel_state(ChannelId(1)), Some(PlaybackState::Stopped));
        assert!(rig.commands().is_empty());

        rig.advance_to(10_240);
        assert_eq!(rig.scheduler.channel_state(ChannelId(1)), Some(PlaybackState::Playing));
        assert!(matches!(
            rig.commands().as_slice(),
            [EngineCommand::StartVoice { voice: 0, start_frame: 10_240, .. }]
        ));
    }

    #[test]
    fn test_tempo_change_keeps_scheduled_frames() {
        let mut rig = rig();
        let stem = rig.stem(120.0);
        rig.scheduler.add_channel(ChannelId(1), stem.clone(), ChannelParams::default());
        rig.scheduler.add_channel(ChannelId(2), stem.clone(), ChannelParams::default());
        rig.scheduler.start();
        rig.clock.advance(50_000);
        rig.commands();

        rig.scheduler.add_channel(ChannelId(3), stem, ChannelParams::default());
        rig.scheduler.remove_channel(ChannelId(1));
        rig.scheduler
            .set_channel_parameter(ChannelId(2), ParameterKind::Volume, 0.5);

        let keys = [
            (ChannelId(3), Slot::Transport),
            (ChannelId(1), Slot::Transport),
            (ChannelId(2), Slot::Volume),
        ];
        let pending = |rig: &Rig| -> Vec<Option<(u64, Action)>> {
            keys.iter().map(|k| rig.scheduler.timeline.pending(*k)).collect()
        };
        let before = pending(&rig);
        assert_eq!(
            before,
            vec![
                Some((96_000, Action::StartVoice)),
                Some((96_000, Action::StopVoice)),
                Some((72_000, Action::ApplyVolume)),
            ]
        );

        rig.scheduler.set_master_bpm(90.0);
        assert!((rig.scheduler.bar_duration() - 60.0 / 90.0 * 4.0).abs() < 1e-12);
        assert_eq!(pending(&rig), before);
        assert_eq!(
            rig.scheduler.channel_state(ChannelId(3)),
            Some(PlaybackState::Starting { at: 96_000 })
        );
        assert_eq!(
            rig.scheduler.channel_state(ChannelId(1)),
            Some(PlaybackState::Stopping { at: 96_000 })
        );

        rig.advance_to(96_000 - 1200);
        let commands = rig.commands();
        assert!(commands.iter().any(|c| matches!(
            c,
            EngineCommand::StartVoice { start_frame: 96_000, .. }
        )));
        assert!(commands.iter().any(|c| matches!(
            c,
            EngineCommand::StopVoice { at_frame: 96_000, .. }
        )));
    }

    #[test]
    fn test_playback_rate() {
        let stem = Stem::new("s", StemKind::Bass, 100.0, 44_100, StereoBuffer::silence(1));
        let rate = playback_rate(120.0, &stem, 48_000);
        assert!((rate - 1.2 * 44_100.0 / 48_000.0).abs() < 1e-6);
    }
}

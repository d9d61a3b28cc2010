//! Render engine - voices, pooled units and the master chain
//!
//! Runs on the audio thread. Per block:
//! 1. drain the command queue
//! 2. render every active voice through its routed units
//!    (filter → pitch → dry + send × delay wet → gain)
//! 3. run the master chain over the sum
//! 4. advance the shared frame clock
//!
//! Nothing here allocates, locks or logs once the engine is built.

use crate::clock::{AudioClock, FrameClock};
use crate::pool::UnitRack;
use crate::types::{StereoBuffer, StereoSample};

use super::command::EngineCommand;
use super::master::MasterChain;
use super::voice::{Voice, VoiceLanes};

/// The looper's audio engine
pub struct LoopEngine {
    voices: Vec<Voice>,
    rack: UnitRack,
    master: MasterChain,
    commands: rtrb::Consumer<EngineCommand>,
    clock: FrameClock,
    /// Scratch for one voice's dry signal
    voice_buffer: StereoBuffer,
    /// Scratch for one voice's delay send
    send_buffer: StereoBuffer,
    max_block: usize,
}

impl LoopEngine {
    /// Assemble an engine from its parts
    ///
    /// One voice is created per entry of `lanes`. Blocks longer than
    /// `max_block` are rendered in slices.
    pub fn new(
        lanes: &[VoiceLanes],
        rack: UnitRack,
        master: MasterChain,
        commands: rtrb::Consumer<EngineCommand>,
        clock: FrameClock,
        max_block: usize,
    ) -> Self {
        let max_block = max_block.max(1);
        Self {
            voices: lanes.iter().map(Voice::new).collect(),
            rack,
            master,
            commands,
            clock,
            voice_buffer: StereoBuffer::silence(max_block),
            send_buffer: StereoBuffer::silence(max_block),
            max_block,
        }
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn max_block(&self) -> usize {
        self.max_block
    }

    /// Number of voices currently holding a stem
    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.is_active()).count()
    }

    pub fn voice(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index)
    }

    /// Render the whole output buffer
    pub fn process(&mut self, output: &mut StereoBuffer) {
        self.process_slice(output.as_mut_slice());
    }

    /// Render into a sample slice of any length
    pub fn process_slice(&mut self, output: &mut [StereoSample]) {
        for block in output.chunks_mut(self.max_block) {
            self.process_block(block);
        }
    }

    fn process_block(&mut self, out: &mut [StereoSample]) {
        let start = self.clock.now_frames();
        let len = out.len();
        self.drain_commands();

        out.fill(StereoSample::silence());

        let rack = &mut self.rack;
        let dry = &mut self.voice_buffer.as_mut_slice()[..len];
        let send = &mut self.send_buffer.as_mut_slice()[..len];

        for voice in self.voices.iter_mut().filter(|v| v.is_active()) {
            voice.render_source(dry, start);
            let route = voice.route();

            for unit in [route.filter, route.pitch].into_iter().flatten() {
                if let Some(unit) = rack.live(unit) {
                    unit.process(dry, start);
                }
            }
            if let Some(delay) = route.delay {
                if let Some(unit) = rack.live(delay) {
                    send.copy_from_slice(dry);
                    unit.process(send, start);
                    let amount = *voice.send();
                    for (i, (d, s)) in dry.iter_mut().zip(send.iter()).enumerate() {
                        *d += *s * amount.value_at(start + i as u64);
                    }
                }
            }

            let gain = *voice.gain();
            for (i, (o, d)) in out.iter_mut().zip(dry.iter()).enumerate() {
                *o += *d * gain.value_at(start + i as u64);
            }

            voice.finish_block(start + len as u64);
        }

        self.master.process(out, start);
        self.clock.advance(len as u64);
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                EngineCommand::StartVoice {
                    voice,
                    stem,
                    loop_frames,
                    start_frame,
                    route,
                } => {
                    if let Some(v) = self.voices.get_mut(voice) {
                        v.start(stem, loop_frames, start_frame, route);
                    }
                }
                EngineCommand::StopVoice { voice, at_frame } => {
                    if let Some(v) = self.voices.get_mut(voice) {
                        v.stop_at(at_frame);
                    }
                }
                EngineCommand::CancelStop { voice } => {
                    if let Some(v) = self.voices.get_mut(voice) {
                        v.cancel_stop();
                    }
                }
                EngineCommand::RestartVoice {
                    voice,
                    loop_frames,
                    at_frame,
                } => {
                    if let Some(v) = self.voices.get_mut(voice) {
                        v.restart_at(loop_frames, at_frame);
                    }
                }
                EngineCommand::Reroute {
                    voice,
                    route,
                    at_frame,
                } => {
                    if let Some(v) = self.voices.get_mut(voice) {
                        v.reroute(route, at_frame);
                    }
                }
                EngineCommand::StopAll { at_frame } => {
                    for v in &mut self.voices {
                        v.stop_at(at_frame);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::NativeUnitFactory;
    use crate::engine::command::command_channel;
    use crate::engine::gc::StemCollector;
    use crate::engine::master::master_bus;
    use crate::engine::voice::UnitRoute;
    use crate::pool::EffectPool;
    use crate::types::{ChannelId, Stem, StemKind, SAMPLE_RATE};

    struct Rig {
        engine: LoopEngine,
        tx: crate::engine::command::CommandSender,
        lanes: Vec<VoiceLanes>,
        pool: EffectPool,
        collector: StemCollector,
    }

    fn rig() -> Rig {
        let lanes: Vec<VoiceLanes> = (0..4).map(|_| VoiceLanes::new()).collect();
        let mut factory = NativeUnitFactory::new(SAMPLE_RATE, 1.0, 64);
        let (pool, rack) = EffectPool::build(2, &mut factory);
        let (_bus, chain) = master_bus(SAMPLE_RATE, 1.0, 64, 0);
        let (tx, rx) = command_channel(16);
        let engine = LoopEngine::new(&lanes, rack, chain, rx, FrameClock::new(SAMPLE_RATE), 64);
        Rig {
            engine,
            tx,
            lanes,
            pool,
            collector: StemCollector::spawn().unwrap(),
        }
    }

    fn dc_stem(rig: &Rig, frames: usize) -> crate::engine::gc::SharedStem {
        rig.collector.share(Stem::new(
            "dc",
            StemKind::Bass,
            120.0,
            SAMPLE_RATE,
            StereoBuffer::from_vec(vec![StereoSample::mono(1.0); frames]),
        ))
    }

    #[test]
    fn test_empty_engine_is_silent_and_advances_clock() {
        let mut rig = rig();
        let mut out = StereoBuffer::silence(200);
        rig.engine.process(&mut out);
        assert_eq!(out.peak(), 0.0);
        assert_eq!(rig.engine.clock().now_frames(), 200);
    }

    #[test]
    fn test_voice_starts_sample_accurately() {
        let mut rig = rig();
        rig.lanes[0].gain.set_now(0.5);
        let stem = dc_stem(&rig, 1000);
        rig.tx.send(EngineCommand::StartVoice {
            voice: 0,
            stem,
            loop_frames: 1000,
            start_frame: 100,
            route: UnitRoute::default(),
        });

        let mut out = StereoBuffer::silence(128);
        rig.engine.process(&mut out);
        assert_eq!(out[99].left, 0.0);
        assert!((out[100].left - 0.5).abs() < 1e-6);
        assert_eq!(rig.engine.active_voices(), 1);
    }

    #[test]
    fn test_stop_frees_voice() {
        let mut rig = rig();
        rig.lanes[1].gain.set_now(1.0);
        let stem = dc_stem(&rig, 1000);
        rig.tx.send(EngineCommand::StartVoice {
            voice: 1,
            stem,
            loop_frames: 1000,
            start_frame: 0,
            route: UnitRoute::default(),
        });
        rig.tx.send(EngineCommand::StopVoice {
            voice: 1,
            at_frame: 32,
        });

        let mut out = StereoBuffer::silence(64);
        rig.engine.process(&mut out);
        assert_eq!(out[31].left, 1.0);
        assert_eq!(out[32].left, 0.0);
        assert_eq!(rig.engine.active_voices(), 0);
    }

    #[test]
    fn test_stale_unit_is_bypassed() {
        let mut rig = rig();
        rig.lanes[0].gain.set_now(1.0);
        rig.lanes[0].send.set_now(1.0);

        let handle = rig.pool.assign(crate::effect::EffectKind::Delay, ChannelId(0)).unwrap();
        let delay = handle.params.as_delay().unwrap().clone();
        delay.delay_time.set_now(0.0005);
        let route = UnitRoute {
            delay: Some(handle.unit_ref()),
            ..UnitRoute::default()
        };
        let stem = dc_stem(&rig, 4000);
        rig.tx.send(EngineCommand::StartVoice {
            voice: 0,
            stem,
            loop_frames: 4000,
            start_frame: 0,
            route,
        });

        let mut out = StereoBuffer::silence(64);
        rig.engine.process(&mut out);
        // Dry plus a 24-sample echo of the DC signal
        assert!((out[63].left - 2.0).abs() < 1e-3, "got {}", out[63].left);

        rig.pool.release(crate::effect::EffectKind::Delay, ChannelId(0));
        rig.engine.process(&mut out);
        assert!(out.iter().all(|s| (s.left - 1.0).abs() < 1e-6));
    }
}

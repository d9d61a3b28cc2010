//! Lock-free command queue from the control domain to the render engine
//!
//! Voice lifecycle changes travel through a bounded `rtrb` ringbuffer and are
//! applied at the start of the next rendered block. Every command carries the
//! exact engine frame it takes effect at, so a command that arrives early
//! still lands sample-accurately inside a later block.
//!
//! Parameter values never travel through this queue; they are written to
//! automation lanes instead.

use super::gc::SharedStem;
use super::voice::UnitRoute;

/// Commands sent from the control domain to the audio thread
pub enum EngineCommand {
    /// Begin playing `stem` on a voice slot at `start_frame`, looping the
    /// first `loop_frames` frames
    StartVoice {
        voice: usize,
        stem: SharedStem,
        loop_frames: usize,
        start_frame: u64,
        route: UnitRoute,
    },
    /// Silence and free a voice at `at_frame`
    StopVoice { voice: usize, at_frame: u64 },
    /// Drop a pending stop
    CancelStop { voice: usize },
    /// Restart from the loop start at `at_frame` with a new loop length
    ///
    /// A later restart replaces a pending one.
    RestartVoice {
        voice: usize,
        loop_frames: usize,
        at_frame: u64,
    },
    /// Swap the unit route and restart from the loop start at `at_frame`
    Reroute {
        voice: usize,
        route: UnitRoute,
        at_frame: u64,
    },
    /// Stop every voice at `at_frame`
    StopAll { at_frame: u64 },
}

impl std::fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineCommand::StartVoice {
                voice,
                loop_frames,
                start_frame,
                ..
            } => write!(
                f,
                "StartVoice(voice {}, {} frames, at {})",
                voice, loop_frames, start_frame
            ),
            EngineCommand::StopVoice { voice, at_frame } => {
                write!(f, "StopVoice(voice {}, at {})", voice, at_frame)
            }
            EngineCommand::CancelStop { voice } => write!(f, "CancelStop(voice {})", voice),
            EngineCommand::RestartVoice {
                voice,
                loop_frames,
                at_frame,
            } => write!(
                f,
                "RestartVoice(voice {}, {} frames, at {})",
                voice, loop_frames, at_frame
            ),
            EngineCommand::Reroute { voice, at_frame, .. } => {
                write!(f, "Reroute(voice {}, at {})", voice, at_frame)
            }
            EngineCommand::StopAll { at_frame } => write!(f, "StopAll(at {})", at_frame),
        }
    }
}

/// Default capacity of the command queue
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Control-side end of the command queue
pub struct CommandSender {
    producer: rtrb::Producer<EngineCommand>,
}

impl CommandSender {
    /// Push a command without blocking
    ///
    /// A full queue drops the command with a warning and returns `false`.
    pub fn send(&mut self, command: EngineCommand) -> bool {
        match self.producer.push(command) {
            Ok(()) => true,
            Err(rtrb::PushError::Full(command)) => {
                log::warn!("Engine command queue full, dropping {:?}", command);
                false
            }
        }
    }

    /// Free slots left in the queue
    pub fn slots(&self) -> usize {
        self.producer.slots()
    }
}

/// Create a bounded command channel
///
/// The sender stays in the control domain, the consumer goes to the engine.
pub fn command_channel(capacity: usize) -> (CommandSender, rtrb::Consumer<EngineCommand>) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1));
    (CommandSender { producer }, consumer)
}

//! Wiring the control and render halves together

use crate::clock::FrameClock;
use crate::config::LooperConfig;
use crate::effect::{NativeUnitFactory, UnitFactory};
use crate::engine::{command_channel, master_bus, LoopEngine, VoiceLanes};
use crate::pool::EffectPool;
use crate::scheduler::PlaybackScheduler;

/// Build a scheduler and the engine it drives, with the built-in effect units
///
/// The scheduler stays on the control thread; the engine goes to whatever
/// renders audio (a device callback or an offline loop).
pub fn build_looper(config: &LooperConfig) -> (PlaybackScheduler, LoopEngine) {
    let config = config.validated();
    let mut factory = NativeUnitFactory::new(
        config.sample_rate,
        config.max_delay_seconds,
        config.block_size,
    );
    build_looper_with(&config, &mut factory)
}

/// Same as [`build_looper`] with a custom unit factory
pub fn build_looper_with(
    config: &LooperConfig,
    factory: &mut impl UnitFactory,
) -> (PlaybackScheduler, LoopEngine) {
    let config = config.validated();
    let clock = FrameClock::new(config.sample_rate);

    let (pool, rack) = EffectPool::build(config.pool_capacity, factory);
    let (master, chain) = master_bus(
        config.sample_rate,
        config.max_delay_seconds,
        config.block_size,
        config.fade_frames(),
    );
    let (commands, consumer) = command_channel(config.command_queue_capacity);
    let lanes: Vec<VoiceLanes> = (0..config.max_channels).map(|_| VoiceLanes::new()).collect();

    let engine = LoopEngine::new(
        &lanes,
        rack,
        chain,
        consumer,
        clock.clone(),
        config.block_size,
    );
    let scheduler = PlaybackScheduler::new(clock, &config, pool, master, commands, lanes);

    log::info!(
        "Looper ready: {} Hz, {} voices, {} units per effect",
        config.sample_rate,
        config.max_channels,
        config.pool_capacity
    );
    (scheduler, engine)
}

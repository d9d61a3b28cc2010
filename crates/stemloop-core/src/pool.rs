//! Fixed-capacity pools of effect units
//!
//! Units are scarce: each kind has a fixed number of slots, built once at
//! startup and cycled between *free* and *assigned* for the process lifetime.
//! The pool itself lives in the control domain; the render halves of the same
//! units live in the [`UnitRack`] owned by the engine.
//!
//! Releasing a unit resets its parameters to neutral and bumps its generation.
//! Any voice still routed through the old generation stops using the unit on
//! its next block, and the render half clears its buffers before the next
//! owner hears it.

use crate::effect::{EffectKind, EffectUnit, UnitFactory, UnitParams};
use crate::types::ChannelId;

/// Reference to one generation of a pooled unit, as stored in a voice route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitRef {
    pub kind: EffectKind,
    pub index: usize,
    pub generation: u32,
}

/// A unit assigned to a channel
#[derive(Debug, Clone)]
pub struct UnitHandle {
    pub kind: EffectKind,
    /// Slot index within the pool of this kind
    pub index: usize,
    /// Generation the unit had when it was assigned
    pub generation: u32,
    /// Shared parameters to automate
    pub params: UnitParams,
}

impl UnitHandle {
    pub fn unit_ref(&self) -> UnitRef {
        UnitRef {
            kind: self.kind,
            index: self.index,
            generation: self.generation,
        }
    }
}

#[derive(Debug)]
struct UnitSlot {
    params: UnitParams,
    owner: Option<ChannelId>,
}

/// The units of a single kind
#[derive(Debug)]
pub struct UnitPool {
    kind: EffectKind,
    slots: Vec<UnitSlot>,
    /// Capacity asked for at construction (slots may be fewer after failures)
    requested: usize,
}

impl UnitPool {
    fn new(kind: EffectKind, requested: usize) -> Self {
        Self {
            kind,
            slots: Vec::with_capacity(requested),
            requested,
        }
    }

    pub fn kind(&self) -> EffectKind {
        self.kind
    }

    /// Number of units that were actually built
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of units asked for at construction
    pub fn requested_capacity(&self) -> usize {
        self.requested
    }

    /// Number of currently free units
    pub fn available_count(&self) -> usize {
        self.slots.iter().filter(|s| s.owner.is_none()).count()
    }

    /// The unit held by `channel`, if any
    pub fn held_by(&self, channel: ChannelId) -> Option<UnitHandle> {
        self.slots
            .iter()
            .position(|s| s.owner == Some(channel))
            .map(|index| self.handle(index))
    }

    /// Owner of the unit at `index`
    pub fn owner_of(&self, index: usize) -> Option<ChannelId> {
        self.slots.get(index).and_then(|s| s.owner)
    }

    /// Assign the first free unit to `channel`
    ///
    /// Returns `None` when the pool is exhausted; the channel then plays
    /// without this effect. The caller must not assign twice to the same
    /// channel.
    pub fn assign(&mut self, channel: ChannelId) -> Option<UnitHandle> {
        if let Some(existing) = self.held_by(channel) {
            debug_assert!(false, "{} already holds a {} unit", channel, self.kind);
            log::error!(
                "{} pool: {} already holds unit {}, not assigning another",
                self.kind,
                channel,
                existing.index
            );
            return None;
        }

        let Some(index) = self.slots.iter().position(|s| s.owner.is_none()) else {
            log::warn!(
                "{} pool exhausted ({} units), {} plays without it",
                self.kind,
                self.capacity(),
                channel
            );
            return None;
        };

        self.slots[index].owner = Some(channel);
        log::debug!("{} pool: unit {} -> {}", self.kind, index, channel);
        Some(self.handle(index))
    }

    /// Return the unit held by `channel` to the pool
    ///
    /// Returns `false` (and does nothing) if the channel holds no unit of
    /// this kind.
    pub fn release(&mut self, channel: ChannelId) -> bool {
        let Some(index) = self.slots.iter().position(|s| s.owner == Some(channel)) else {
            return false;
        };
        self.release_slot(index);
        log::debug!("{} pool: unit {} released by {}", self.kind, index, channel);
        true
    }

    /// Release every assigned unit, appending former owners to `owners`
    pub fn release_all_into(&mut self, owners: &mut Vec<ChannelId>) {
        for index in 0..self.slots.len() {
            if let Some(owner) = self.slots[index].owner {
                owners.push(owner);
                self.release_slot(index);
            }
        }
    }

    /// Release every assigned unit, returning the former owners
    pub fn release_all(&mut self) -> Vec<ChannelId> {
        let mut owners = Vec::new();
        self.release_all_into(&mut owners);
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    fn release_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        // Disconnect first so no voice hears the reset
        slot.params.bump_generation();
        slot.params.reset_to_neutral();
        slot.owner = None;
    }

    fn handle(&self, index: usize) -> UnitHandle {
        let params = self.slots[index].params.clone();
        UnitHandle {
            kind: self.kind,
            index,
            generation: params.generation(),
            params,
        }
    }

    /// Parameters of the unit at `index`
    pub fn params(&self, index: usize) -> Option<&UnitParams> {
        self.slots.get(index).map(|s| &s.params)
    }
}

/// One pool per effect kind
#[derive(Debug)]
pub struct EffectPool {
    delay: UnitPool,
    filter: UnitPool,
    pitch: UnitPool,
}

impl EffectPool {
    /// Build `capacity` units of every kind
    ///
    /// A unit whose construction fails is left out: the pool reports a reduced
    /// capacity instead of failing. Returns the control-side pool and the
    /// render-side rack holding the DSP halves.
    pub fn build(capacity: usize, factory: &mut impl UnitFactory) -> (EffectPool, UnitRack) {
        let mut pool = EffectPool {
            delay: UnitPool::new(EffectKind::Delay, capacity),
            filter: UnitPool::new(EffectKind::Filter, capacity),
            pitch: UnitPool::new(EffectKind::Pitch, capacity),
        };
        let mut rack = UnitRack::default();

        for kind in EffectKind::ALL {
            let units = rack.units_mut(kind);
            units.reserve_exact(capacity);
            for i in 0..capacity {
                match factory.build(kind, i) {
                    Ok(unit) => units.push(unit),
                    Err(e) => log::warn!("{} unit {} unavailable: {}", kind, i, e),
                }
            }

            let slots = &mut pool.pool_mut(kind).slots;
            slots.extend(rack.units(kind).iter().map(|unit| UnitSlot {
                params: unit.params(),
                owner: None,
            }));

            let built = slots.len();
            if built < capacity {
                log::warn!("{} pool running with {}/{} units", kind, built, capacity);
            } else {
                log::info!("{} pool ready with {} units", kind, built);
            }
        }

        (pool, rack)
    }

    pub fn pool(&self, kind: EffectKind) -> &UnitPool {
        match kind {
            EffectKind::Delay => &self.delay,
            EffectKind::Filter => &self.filter,
            EffectKind::Pitch => &self.pitch,
        }
    }

    pub fn pool_mut(&mut self, kind: EffectKind) -> &mut UnitPool {
        match kind {
            EffectKind::Delay => &mut self.delay,
            EffectKind::Filter => &mut self.filter,
            EffectKind::Pitch => &mut self.pitch,
        }
    }

    pub fn assign(&mut self, kind: EffectKind, channel: ChannelId) -> Option<UnitHandle> {
        self.pool_mut(kind).assign(channel)
    }

    pub fn release(&mut self, kind: EffectKind, channel: ChannelId) -> bool {
        self.pool_mut(kind).release(channel)
    }

    /// Release every unit of every kind held by `channel`
    pub fn release_channel(&mut self, channel: ChannelId) -> usize {
        EffectKind::ALL
            .iter()
            .filter(|kind| self.release(**kind, channel))
            .count()
    }

    /// Release every assigned unit across all pools
    ///
    /// Returns the deduplicated ids of the channels that held at least one
    /// unit, in ascending order.
    pub fn release_all(&mut self) -> Vec<ChannelId> {
        let mut owners = Vec::new();
        for kind in EffectKind::ALL {
            self.pool_mut(kind).release_all_into(&mut owners);
        }
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    pub fn available_count(&self, kind: EffectKind) -> usize {
        self.pool(kind).available_count()
    }

    pub fn capacity(&self, kind: EffectKind) -> usize {
        self.pool(kind).capacity()
    }

    pub fn held_by(&self, kind: EffectKind, channel: ChannelId) -> Option<UnitHandle> {
        self.pool(kind).held_by(channel)
    }
}

/// Render halves of every pooled unit, indexed like the pools
#[derive(Default)]
pub struct UnitRack {
    delay: Vec<EffectUnit>,
    filter: Vec<EffectUnit>,
    pitch: Vec<EffectUnit>,
}

impl UnitRack {
    pub fn units(&self, kind: EffectKind) -> &[EffectUnit] {
        match kind {
            EffectKind::Delay => &self.delay,
            EffectKind::Filter => &self.filter,
            EffectKind::Pitch => &self.pitch,
        }
    }

    fn units_mut(&mut self, kind: EffectKind) -> &mut Vec<EffectUnit> {
        match kind {
            EffectKind::Delay => &mut self.delay,
            EffectKind::Filter => &mut self.filter,
            EffectKind::Pitch => &mut self.pitch,
        }
    }

    /// The unit behind `unit`, if it is still on the referenced generation
    ///
    /// A stale reference (the unit was released since) yields `None`, which
    /// disconnects it from the route.
    #[inline]
    pub fn live(&mut self, unit: UnitRef) -> Option<&mut EffectUnit> {
        let slot = self.units_mut(unit.kind).get_mut(unit.index)?;
        if slot.generation() != unit.generation {
            return None;
        }
        slot.sync_generation();
        Some(slot)
    }
}

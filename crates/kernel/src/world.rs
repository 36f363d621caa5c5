use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use worldspace_common::{EntityId, EntityKind, Transform, WorldCell};

/// An event record produced by every mutation to the world.
///
/// Downstream consumers (streaming, persistence) drain the log once per tick
/// and react to what changed instead of diffing whole world states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorldEvent {
    /// Entity was spawned with the given kind and transform.
    Spawned {
        id: EntityId,
        kind: EntityKind,
        transform: Transform,
    },
    /// Entity was removed from the simulation.
    Despawned { id: EntityId },
    /// Entity transform was updated.
    TransformUpdated {
        id: EntityId,
        old: Transform,
        new: Transform,
    },
    /// A single world cell changed to a new state id.
    CellChanged { cell: WorldCell, state: u16 },
    /// Simulation advanced one tick with the given seed.
    Stepped { tick: u64, seed: u64 },
}

/// An item or sub-object attached to an entity in a numbered slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub slot: u8,
    pub item: u32,
}

/// A timed status effect applied to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEffect {
    pub effect: u16,
    pub amplifier: u8,
    pub remaining_ticks: u32,
}

/// Per-entity data stored in the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub kind: EntityKind,
    pub transform: Transform,
    /// Units per tick.
    pub velocity: Vec3,
    pub equipment: Vec<Equipment>,
    pub passengers: Vec<EntityId>,
    pub effects: Vec<StatusEffect>,
}

impl EntityData {
    pub fn new(kind: EntityKind, transform: Transform) -> Self {
        Self {
            kind,
            transform,
            velocity: Vec3::ZERO,
            equipment: Vec::new(),
            passengers: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Current world position.
    pub fn position(&self) -> Vec3 {
        self.transform.position
    }
}

/// The authoritative mobile-entity state.
///
/// All mutations go through explicit operations and are logged. Uses
/// BTreeMap for deterministic iteration order across all platforms.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct World {
    entities: BTreeMap<EntityId, EntityData>,
    tick: u64,
    /// Seed for deterministic RNG. Advanced each step for reproducibility.
    seed: u64,
    /// Draw counter mixed into the seed by `random_u64`.
    #[serde(skip)]
    draws: u64,
    /// Append-only event log of all mutations.
    #[serde(skip)]
    event_log: Vec<WorldEvent>,
}

impl World {
    /// Create an empty world at tick 0 with seed 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a world with a specific seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }

    /// Current simulation tick.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Current RNG seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of entities in the world.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Drain and return the event log.
    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.event_log)
    }

    /// Read-only access to the event log.
    pub fn events(&self) -> &[WorldEvent] {
        &self.event_log
    }

    /// Read-only access to all entities (BTreeMap for deterministic iteration).
    pub fn entities(&self) -> &BTreeMap<EntityId, EntityData> {
        &self.entities
    }

    /// Spawn a new entity of `kind`. Returns its id.
    pub fn spawn(&mut self, kind: EntityKind, transform: Transform) -> EntityId {
        let id = EntityId::new();
        self.spawn_with_id(id, EntityData::new(kind, transform));
        id
    }

    /// Spawn an entity with a specific id and full data.
    pub fn spawn_with_id(&mut self, id: EntityId, data: EntityData) {
        self.event_log.push(WorldEvent::Spawned {
            id,
            kind: data.kind,
            transform: data.transform,
        });
        self.entities.insert(id, data);
    }

    /// Remove an entity. Returns the data if it existed.
    pub fn despawn(&mut self, id: EntityId) -> Option<EntityData> {
        let data = self.entities.remove(&id);
        if data.is_some() {
            self.event_log.push(WorldEvent::Despawned { id });
            // Riders of a removed vehicle stay in the world, unmounted.
            for other in self.entities.values_mut() {
                other.passengers.retain(|p| *p != id);
            }
        }
        data
    }

    /// Get a reference to entity data.
    pub fn get(&self, id: EntityId) -> Option<&EntityData> {
        self.entities.get(&id)
    }

    /// Update an entity's transform and log the change.
    pub fn set_transform(&mut self, id: EntityId, new: Transform) -> bool {
        if let Some(data) = self.entities.get_mut(&id) {
            let old = data.transform;
            data.transform = new;
            self.event_log
                .push(WorldEvent::TransformUpdated { id, old, new });
            true
        } else {
            false
        }
    }

    /// Move an entity to `position`, keeping rotation and scale.
    pub fn move_to(&mut self, id: EntityId, position: Vec3) -> bool {
        let Some(data) = self.entities.get(&id) else {
            return false;
        };
        let new = Transform {
            position,
            ..data.transform
        };
        self.set_transform(id, new)
    }

    /// Set an entity's velocity in units per tick.
    pub fn set_velocity(&mut self, id: EntityId, velocity: Vec3) -> bool {
        match self.entities.get_mut(&id) {
            Some(data) => {
                data.velocity = velocity;
                true
            }
            None => false,
        }
    }

    /// Put `item` into an equipment slot, replacing whatever was there.
    pub fn equip(&mut self, id: EntityId, slot: u8, item: u32) -> bool {
        let Some(data) = self.entities.get_mut(&id) else {
            return false;
        };
        data.equipment.retain(|e| e.slot != slot);
        data.equipment.push(Equipment { slot, item });
        data.equipment.sort_by_key(|e| e.slot);
        true
    }

    /// Apply a status effect. An existing effect of the same id is replaced.
    pub fn add_effect(&mut self, id: EntityId, effect: StatusEffect) -> bool {
        let Some(data) = self.entities.get_mut(&id) else {
            return false;
        };
        data.effects.retain(|e| e.effect != effect.effect);
        data.effects.push(effect);
        true
    }

    /// Mount `rider` on `vehicle`. Both must exist and differ.
    pub fn mount(&mut self, vehicle: EntityId, rider: EntityId) -> bool {
        if vehicle == rider || !self.entities.contains_key(&rider) {
            return false;
        }
        match self.entities.get_mut(&vehicle) {
            Some(data) if !data.passengers.contains(&rider) => {
                data.passengers.push(rider);
                true
            }
            _ => false,
        }
    }

    /// Record that a world cell changed state.
    ///
    /// Cell contents belong to the region layer; the kernel only records the
    /// change so that streaming can apply and propagate it.
    pub fn set_cell(&mut self, cell: WorldCell, state: u16) {
        self.event_log.push(WorldEvent::CellChanged { cell, state });
    }

    /// Deterministic random number derived from the seed and a draw counter.
    pub fn random_u64(&mut self) -> u64 {
        self.draws = self.draws.wrapping_add(1);
        splitmix64(self.seed ^ self.draws.wrapping_mul(0x9e37_79b9_7f4a_7c15))
    }

    /// Deterministic random float in `[-1, 1)`.
    pub fn random_signed(&mut self) -> f32 {
        let bits = self.random_u64() >> 40;
        (bits as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }

    /// Advance the simulation by one tick.
    ///
    /// Expired status effects are dropped; given the same starting seed and
    /// sequence of operations the world reaches identical states.
    pub fn step(&mut self) {
        self.tick += 1;
        self.seed = splitmix64(self.seed);
        for data in self.entities.values_mut() {
            data.effects.retain_mut(|e| {
                e.remaining_ticks = e.remaining_ticks.saturating_sub(1);
                e.remaining_ticks > 0
            });
        }
        self.event_log.push(WorldEvent::Stepped {
            tick: self.tick,
            seed: self.seed,
        });
    }
}

/// Splitmix64 ... a fast, high-quality deterministic PRNG step function.
fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

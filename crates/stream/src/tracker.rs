//! Entity interest: which observers know about which mobile entities.
//!
//! Every tracked entity carries the set of observers currently tracking it.
//! Once per tick the set is recomputed from horizontal distance, limited to
//! regions the observer is streamed when the caller says so; observers
//! that leave get a remove message, newcomers get a spawn snapshot, and
//! everyone else gets a delta on the entity's update cadence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use glam::Vec3;
use serde::Serialize;
use worldspace_common::{EntityId, EntityKind};
use worldspace_kernel::{EntityData, World};

use crate::codec::EntityCodec;
use crate::error::StreamError;
use crate::observer::{Observer, ObserverId, ObserverTable, UpdateMessage};
use crate::spatial::{REGION_SIZE, RegionCoord};

/// Fixed-point units per world unit used for position deltas.
pub const FIXED_SCALE: f64 = 4096.0;
/// Smallest relative move worth sending: 1/32 of a unit.
pub const MIN_MOVE: i64 = 128;
/// A relative move goes out every this many updates even when still.
pub const FORCED_MOVE_UPDATES: u32 = 60;
/// Ticks between absolute position refreshes.
pub const TELEPORT_INTERVAL_TICKS: u32 = 400;
/// Squared velocity change worth sending.
pub const VELOCITY_EPSILON_SQ: f32 = 0.0004;

/// Visibility and update cadence for one kind of entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingPolicy {
    /// Horizontal visibility radius in world units.
    pub radius: f32,
    /// Ticks between delta updates. `None` never sends deltas.
    pub update_interval: Option<u32>,
    pub send_velocity: bool,
}

impl TrackingPolicy {
    pub const fn new(radius: f32, update_interval: Option<u32>, send_velocity: bool) -> Self {
        Self {
            radius,
            update_interval,
            send_velocity,
        }
    }
}

/// Built-in policy for an entity kind.
pub fn default_policy(kind: EntityKind) -> TrackingPolicy {
    match kind {
        EntityKind::Avatar => TrackingPolicy::new(512.0, Some(2), false),
        EntityKind::Creature | EntityKind::Animal => TrackingPolicy::new(80.0, Some(3), true),
        EntityKind::Vehicle => TrackingPolicy::new(80.0, Some(3), true),
        EntityKind::Boss => TrackingPolicy::new(160.0, Some(3), true),
        EntityKind::Projectile => TrackingPolicy::new(64.0, Some(10), true),
        EntityKind::Item => TrackingPolicy::new(64.0, Some(20), true),
        EntityKind::Orb | EntityKind::FallingBlock => TrackingPolicy::new(160.0, Some(20), true),
        EntityKind::Hanging => TrackingPolicy::new(160.0, None, false),
    }
}

/// Policy lookup keyed by entity kind, with per-kind overrides.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    overrides: HashMap<EntityKind, TrackingPolicy>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, kind: EntityKind, policy: TrackingPolicy) {
        self.overrides.insert(kind, policy);
    }

    pub fn get(&self, kind: EntityKind) -> TrackingPolicy {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_policy(kind))
    }
}

/// How an entity's position changed since the last update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Movement {
    Stationary,
    /// Offset in 1/4096 units from the last sent position.
    Relative { dx: i16, dy: i16, dz: i16 },
    /// Absolute position.
    Teleport(Vec3),
}

/// An incremental entity update for observers already tracking it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityDelta {
    pub movement: Movement,
    pub velocity: Option<Vec3>,
}

/// Whether an observer currently tracks an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    NotTracking,
    Tracking,
}

fn to_fixed(pos: Vec3) -> [i64; 3] {
    [pos.x, pos.y, pos.z].map(|v| (f64::from(v) * FIXED_SCALE).round() as i64)
}

fn horizontal_distance_sq(a: Vec3, b: Vec3) -> f32 {
    let dx = a.x - b.x;
    let dz = a.z - b.z;
    dx * dx + dz * dz
}

/// Interest state for one tracked entity.
#[derive(Debug, Clone)]
pub struct EntityWatchEntry {
    id: EntityId,
    kind: EntityKind,
    policy: TrackingPolicy,
    tracked_by: BTreeSet<ObserverId>,
    last_sent_position: [i64; 3],
    last_known_motion: Vec3,
    /// Ticks since tracking began.
    age: u64,
    updates: u32,
    ticks_since_absolute: u32,
}

impl EntityWatchEntry {
    fn new(id: EntityId, entity: &EntityData, policy: TrackingPolicy) -> Self {
        Self {
            id,
            kind: entity.kind,
            policy,
            tracked_by: BTreeSet::new(),
            last_sent_position: to_fixed(entity.position()),
            last_known_motion: entity.velocity,
            age: 0,
            updates: 0,
            ticks_since_absolute: 0,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Visibility radius after the tracking cap.
    pub fn visibility_radius(&self) -> f32 {
        self.policy.radius
    }

    pub fn update_interval(&self) -> Option<u32> {
        self.policy.update_interval
    }

    pub fn tracked_by(&self) -> impl Iterator<Item = ObserverId> + '_ {
        self.tracked_by.iter().copied()
    }

    /// Whether `observer` may see this entity at `position`.
    fn eligible(&self, observer: &Observer, position: Vec3) -> bool {
        if observer.avatar == Some(self.id) {
            return false;
        }
        // Never beyond what the observer itself can see.
        let view = (observer.view_radius.max(0) * REGION_SIZE) as f32;
        let radius = self.policy.radius.min(view);
        horizontal_distance_sq(observer.position, position) <= radius * radius
    }

    /// Position every tracking observer holds, as of the last update sent.
    fn sent_position(&self) -> Vec3 {
        let [x, y, z] = self.last_sent_position.map(|v| (v as f64 / FIXED_SCALE) as f32);
        Vec3::new(x, y, z)
    }

    /// Spawn snapshot for a newcomer. It carries the same base the shared
    /// relative deltas are computed from.
    fn snapshot(&self, entity: &EntityData) -> EntityData {
        let mut snapshot = entity.clone();
        if self.policy.update_interval.is_some() {
            snapshot.transform.position = self.sent_position();
            if self.policy.send_velocity {
                snapshot.velocity = self.last_known_motion;
            }
        }
        snapshot
    }

    /// Work out this tick's delta, if there is one, and advance the sent state.
    fn next_delta(&mut self, entity: &EntityData) -> Option<EntityDelta> {
        let interval = self.policy.update_interval?;
        if self.age % u64::from(interval.max(1)) != 0 {
            return None;
        }
        self.updates = self.updates.wrapping_add(1);

        let current = to_fixed(entity.position());
        let d = [
            current[0] - self.last_sent_position[0],
            current[1] - self.last_sent_position[1],
            current[2] - self.last_sent_position[2],
        ];
        let out_of_range = d
            .iter()
            .any(|v| *v < i64::from(i16::MIN) || *v > i64::from(i16::MAX));
        let moved = d.iter().any(|v| v.abs() >= MIN_MOVE);
        let forced = self.updates % FORCED_MOVE_UPDATES == 0;

        let movement = if out_of_range || self.ticks_since_absolute >= TELEPORT_INTERVAL_TICKS {
            self.last_sent_position = current;
            self.ticks_since_absolute = 0;
            Movement::Teleport(entity.position())
        } else if moved || forced {
            self.last_sent_position = current;
            Movement::Relative {
                dx: d[0] as i16,
                dy: d[1] as i16,
                dz: d[2] as i16,
            }
        } else {
            Movement::Stationary
        };

        let velocity = if self.policy.send_velocity {
            let change = (entity.velocity - self.last_known_motion).length_squared();
            let stopped = entity.velocity == Vec3::ZERO && self.last_known_motion != Vec3::ZERO;
            if change > VELOCITY_EPSILON_SQ || stopped {
                self.last_known_motion = entity.velocity;
                Some(entity.velocity)
            } else {
                None
            }
        } else {
            None
        };

        if movement == Movement::Stationary && velocity.is_none() {
            None
        } else {
            Some(EntityDelta { movement, velocity })
        }
    }
}

/// Entity interest counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub spawns_sent: usize,
    pub deltas_sent: usize,
    pub removes_sent: usize,
    pub teleports: usize,
    pub tracked_entities: usize,
    /// (entity, observer) pairs in `Tracking` after the tick.
    pub tracked_pairs: usize,
}

/// Owns every `EntityWatchEntry`.
pub struct EntityInterestTracker {
    entries: BTreeMap<EntityId, EntityWatchEntry>,
    policies: PolicyTable,
    tracking_cap: f32,
    codec: Arc<dyn EntityCodec>,
    disconnected: BTreeSet<ObserverId>,
    /// Failed channels, skipped until the observer is forgotten.
    closed: BTreeSet<ObserverId>,
    // Scratch buffers reused across ticks.
    eligible: BTreeSet<ObserverId>,
    leaving: Vec<ObserverId>,
}

impl std::fmt::Debug for EntityInterestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityInterestTracker")
            .field("entries", &self.entries.len())
            .field("tracking_cap", &self.tracking_cap)
            .finish_non_exhaustive()
    }
}

impl EntityInterestTracker {
    pub fn new(tracking_cap: f32, codec: Arc<dyn EntityCodec>) -> Self {
        Self::with_policies(PolicyTable::new(), tracking_cap, codec)
    }

    pub fn with_policies(policies: PolicyTable, tracking_cap: f32, codec: Arc<dyn EntityCodec>) -> Self {
        Self {
            entries: BTreeMap::new(),
            policies,
            tracking_cap: tracking_cap.max(0.0),
            codec,
            disconnected: BTreeSet::new(),
            closed: BTreeSet::new(),
            eligible: BTreeSet::new(),
            leaving: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: EntityId) -> Option<&EntityWatchEntry> {
        self.entries.get(&id)
    }

    pub fn is_tracked(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn state(&self, entity: EntityId, observer: ObserverId) -> TrackingState {
        match self.entries.get(&entity) {
            Some(entry) if entry.tracked_by.contains(&observer) => TrackingState::Tracking,
            _ => TrackingState::NotTracking,
        }
    }

    /// Start tracking an entity. Observers are attached on the next tick.
    /// Returns `false` if it was already tracked.
    pub fn track(&mut self, id: EntityId, entity: &EntityData) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        let mut policy = self.policies.get(entity.kind);
        policy.radius = policy.radius.min(self.tracking_cap);
        tracing::debug!(entity = %id, kind = ?entity.kind, radius = policy.radius, "tracking entity");
        self.entries.insert(id, EntityWatchEntry::new(id, entity, policy));
        true
    }

    /// Send a remove to every tracking observer and drop the entry.
    pub fn untrack(&mut self, id: EntityId, observers: &ObserverTable) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        if !entry.tracked_by.is_empty() {
            let msg = self.codec.encode_remove(id);
            for observer in entry.tracked_by {
                self.deliver(observers, observer, msg.clone());
            }
        }
        tracing::debug!(entity = %id, "untracked entity");
        true
    }

    fn detach(&mut self, observer: ObserverId) -> usize {
        let mut removed = 0;
        for entry in self.entries.values_mut() {
            if entry.tracked_by.remove(&observer) {
                removed += 1;
            }
        }
        removed
    }

    /// Drop an observer that left, without messaging it. Its id may be
    /// reused by a later observer.
    pub fn forget_observer(&mut self, observer: ObserverId) -> usize {
        self.closed.remove(&observer);
        self.detach(observer)
    }

    /// Detach an observer whose channel failed and skip it from now on.
    pub fn close_observer(&mut self, observer: ObserverId) -> usize {
        self.closed.insert(observer);
        self.detach(observer)
    }

    /// Observers whose channel failed since the last call.
    pub fn take_disconnected(&mut self) -> Vec<ObserverId> {
        std::mem::take(&mut self.disconnected).into_iter().collect()
    }

    fn deliver(&mut self, observers: &ObserverTable, id: ObserverId, msg: UpdateMessage) -> bool {
        match observers.send(id, msg) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(observer = %id, %err, "entity update not delivered");
                self.disconnected.insert(id);
                false
            }
        }
    }

    /// Recompute every interest set and send spawns, deltas, and removes,
    /// with no region restriction.
    pub fn tick(&mut self, world: &World, observers: &ObserverTable) -> TrackerStats {
        self.tick_in(world, observers, |_, _| true)
    }

    /// Like [`tick`](Self::tick), but an entity is only visible to an
    /// observer when `streamed(observer, region)` holds for the region the
    /// entity stands in.
    pub fn tick_in<F>(&mut self, world: &World, observers: &ObserverTable, streamed: F) -> TrackerStats
    where
        F: Fn(ObserverId, RegionCoord) -> bool,
    {
        let mut stats = TrackerStats::default();

        let vanished: Vec<EntityId> = self
            .entries
            .keys()
            .filter(|id| world.get(**id).is_none())
            .copied()
            .collect();
        for id in vanished {
            tracing::warn!(
                error = %StreamError::InvariantViolation(format!("tracked entity {id} left the world without despawn")),
                "untracking vanished entity"
            );
            let watchers = self.entries.get(&id).map_or(0, |e| e.tracked_by.len());
            self.untrack(id, observers);
            stats.removes_sent += watchers;
        }

        let mut entries = std::mem::take(&mut self.entries);
        for (id, entry) in entries.iter_mut() {
            let Some(entity) = world.get(*id) else {
                continue;
            };
            let position = entity.position();
            let region = RegionCoord::containing(position);

            self.eligible.clear();
            self.eligible.extend(
                observers
                    .iter()
                    .filter(|o| {
                        !self.closed.contains(&o.id)
                            && entry.eligible(o, position)
                            && streamed(o.id, region)
                    })
                    .map(|o| o.id),
            );

            // Leaving.
            self.leaving.clear();
            self.leaving.extend(
                entry
                    .tracked_by
                    .iter()
                    .filter(|o| !self.eligible.contains(*o))
                    .copied(),
            );
            if !self.leaving.is_empty() {
                let msg = self.codec.encode_remove(*id);
                let leaving = std::mem::take(&mut self.leaving);
                for observer in &leaving {
                    entry.tracked_by.remove(observer);
                    self.deliver(observers, *observer, msg.clone());
                    stats.removes_sent += 1;
                }
                self.leaving = leaving;
            }

            // Staying: deltas against the last sent state.
            if let Some(delta) = entry.next_delta(entity) {
                if matches!(delta.movement, Movement::Teleport(_)) {
                    stats.teleports += 1;
                }
                if !entry.tracked_by.is_empty() {
                    let msg = self.codec.encode_delta(*id, &delta);
                    for observer in entry.tracked_by.iter().copied().collect::<Vec<_>>() {
                        if self.deliver(observers, observer, msg.clone()) {
                            stats.deltas_sent += 1;
                        }
                    }
                }
            }

            // Entering: snapshot at the shared delta base, then attach.
            let entering: Vec<ObserverId> = self
                .eligible
                .iter()
                .filter(|o| !entry.tracked_by.contains(*o))
                .copied()
                .collect();
            if !entering.is_empty() {
                let msg = self.codec.encode_spawn(*id, &entry.snapshot(entity));
                for observer in entering {
                    if self.deliver(observers, observer, msg.clone()) {
                        entry.tracked_by.insert(observer);
                        stats.spawns_sent += 1;
                    }
                }
            }

            entry.age += 1;
            entry.ticks_since_absolute = entry.ticks_since_absolute.saturating_add(1);
        }
        self.entries = entries;

        // Channels that failed during this tick never stay attached.
        for observer in self.disconnected.iter().copied().collect::<Vec<_>>() {
            self.close_observer(observer);
        }

        stats.tracked_entities = self.entries.len();
        stats.tracked_pairs = self.entries.values().map(|e| e.tracked_by.len()).sum();
        tracing::trace!(?stats, "entity interest tick");
        stats
    }
}

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use worldspace_kernel::{World, WorldEvent};

use crate::budget::{StreamStats, TickTimer};
use crate::codec::{EntityCodec, RegionCodec};
use crate::config::{AdaptiveRadius, StreamConfig};
use crate::error::StreamError;
use crate::observer::{ObserverId, ObserverTable};
use crate::registry::ChunkWatchRegistry;
use crate::store::RegionStore;
use crate::tracker::{EntityInterestTracker, PolicyTable, TrackerStats};

/// What one simulation tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub regions: StreamStats,
    pub entities: TrackerStats,
    /// Observers that started watching this tick.
    pub joined: Vec<ObserverId>,
    /// Observers that left the table.
    pub left: Vec<ObserverId>,
    /// Observers whose channel failed; purged everywhere.
    pub disconnected: Vec<ObserverId>,
    /// Server-wide radius cap in effect after the tick.
    pub radius_cap: i32,
    pub duration: Duration,
}

/// Runs region streaming and entity interest once per simulation tick.
///
/// Order within a tick is fixed: world events and observer changes first,
/// then the region diff flush, then the load and send queues, then entity
/// interest. Entity messages therefore never reference a region the
/// observer has not been sent or scheduled to receive.
pub struct SimulationTickDriver {
    regions: ChunkWatchRegistry,
    entities: EntityInterestTracker,
    entity_codec: Arc<dyn EntityCodec>,
    tracking_cap: f32,
    adaptive: AdaptiveRadius,
    timer: TickTimer,
    /// Purged after a channel failure; ignored until they leave the table.
    dropped: BTreeSet<ObserverId>,
    ticks: u64,
}

impl std::fmt::Debug for SimulationTickDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationTickDriver")
            .field("regions", &self.regions)
            .field("entities", &self.entities)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

impl SimulationTickDriver {
    pub fn new(
        config: StreamConfig,
        store: Arc<dyn RegionStore>,
        region_codec: Arc<dyn RegionCodec>,
        entity_codec: Arc<dyn EntityCodec>,
    ) -> Result<Self, StreamError> {
        let config = config.validated();
        let tracking_cap = config.tracking_cap();
        let adaptive = config.adaptive_radius.clone();
        let regions = ChunkWatchRegistry::new(config, store, region_codec)?;
        Ok(Self {
            regions,
            entities: EntityInterestTracker::new(tracking_cap, Arc::clone(&entity_codec)),
            entity_codec,
            tracking_cap,
            timer: TickTimer::new(adaptive.sample_ticks as usize),
            adaptive,
            dropped: BTreeSet::new(),
            ticks: 0,
        })
    }

    /// Replace the entity policy table. Call before the first tick.
    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.entities = EntityInterestTracker::with_policies(
            policies,
            self.tracking_cap,
            Arc::clone(&self.entity_codec),
        );
        self
    }

    pub fn regions(&self) -> &ChunkWatchRegistry {
        &self.regions
    }

    pub fn entities(&self) -> &EntityInterestTracker {
        &self.entities
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn timer(&self) -> &TickTimer {
        &self.timer
    }

    /// Advance streaming by one tick.
    pub fn tick(&mut self, world: &mut World, observers: &ObserverTable) -> TickReport {
        let started = Instant::now();
        let _span = tracing::info_span!("sim_tick", tick = self.ticks).entered();

        self.apply_world_events(world, observers);
        let (joined, left) = self.sync_observers(observers);

        let region_stats = self.regions.tick(observers);
        // Entities are only visible inside regions the observer is streamed.
        let registry = &self.regions;
        let entity_stats = self
            .entities
            .tick_in(world, observers, |id, coord| registry.streams_to(id, coord));

        let mut disconnected: BTreeSet<ObserverId> = self.regions.take_disconnected().into_iter().collect();
        disconnected.extend(self.entities.take_disconnected());
        for id in &disconnected {
            self.regions.purge_observer(*id);
            self.entities.close_observer(*id);
            self.dropped.insert(*id);
            tracing::info!(observer = %id, "observer channel closed, purged");
        }

        let duration = started.elapsed();
        self.timer.record(duration);
        self.adapt_radius();

        let report = TickReport {
            tick: self.ticks,
            regions: region_stats,
            entities: entity_stats,
            joined,
            left,
            disconnected: disconnected.into_iter().collect(),
            radius_cap: self.regions.radius_cap(),
            duration,
        };
        tracing::trace!(
            tick = report.tick,
            loaded = report.regions.regions_loaded,
            sent = report.regions.regions_sent,
            spawns = report.entities.spawns_sent,
            ?duration,
            "tick done"
        );
        self.ticks += 1;
        report
    }

    fn apply_world_events(&mut self, world: &mut World, observers: &ObserverTable) {
        for event in world.drain_events() {
            match event {
                WorldEvent::Spawned { id, .. } => {
                    // Spawned and despawned within the tick: nothing to track.
                    if let Some(data) = world.get(id) {
                        self.entities.track(id, data);
                    }
                }
                WorldEvent::Despawned { id } => {
                    self.entities.untrack(id, observers);
                }
                WorldEvent::CellChanged { cell, state } => {
                    self.regions.set_cell(cell, state);
                }
                WorldEvent::TransformUpdated { .. } | WorldEvent::Stepped { .. } => {}
            }
        }
    }

    /// Bring registry footprints in line with the observer table.
    fn sync_observers(&mut self, observers: &ObserverTable) -> (Vec<ObserverId>, Vec<ObserverId>) {
        let mut left: Vec<ObserverId> = self
            .regions
            .watcher_ids()
            .filter(|id| !observers.contains(*id))
            .collect();
        left.sort();
        for id in &left {
            self.regions.purge_observer(*id);
            self.entities.forget_observer(*id);
            tracing::debug!(observer = %id, "observer left");
        }
        let reusable: Vec<ObserverId> = self
            .dropped
            .iter()
            .filter(|id| !observers.contains(**id))
            .copied()
            .collect();
        for id in reusable {
            self.dropped.remove(&id);
            self.entities.forget_observer(id);
        }

        let mut joined = Vec::new();
        for observer in observers.iter() {
            if self.dropped.contains(&observer.id) {
                continue;
            }
            if self.regions.watch(observers, observer.id) {
                joined.push(observer.id);
                continue;
            }
            self.regions.update_observer_position(observers, observer.id);
            self.regions
                .update_observer_radius(observers, observer.id, observer.view_radius);
        }
        (joined, left)
    }

    /// Shrink the radius cap while ticks run over target; grow it back once
    /// they are comfortably under.
    fn adapt_radius(&mut self) {
        if !self.adaptive.enabled {
            return;
        }
        let window = self.adaptive.sample_ticks.max(1);
        if self.timer.count() < window as usize || (self.ticks + 1) % window != 0 {
            return;
        }
        let average = self.timer.average();
        let target = Duration::from_millis(self.adaptive.target_tick_ms);
        let cap = self.regions.radius_cap();
        let max = self.regions.config().view_radius;

        let next = if average > target && cap > self.adaptive.min_radius {
            cap - 1
        } else if average < target / 2 && cap < max {
            cap + 1
        } else {
            cap
        };
        if next != cap {
            self.regions.set_radius_cap(next);
            self.timer.clear();
            tracing::info!(from = cap, to = next, ?average, ?target, "adjusted view radius cap");
        }
    }
}

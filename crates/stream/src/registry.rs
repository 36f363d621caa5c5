//! Region interest registry.
//!
//! `ChunkWatchRegistry` owns one `RegionWatchEntry` per region that has at
//! least one interested observer or an outstanding load. Observers are added
//! and removed as their square footprint moves or resizes, and once per tick
//! the registry flushes pending cell changes and drains the bounded load and
//! send queues.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use worldspace_common::WorldCell;

use crate::budget::{StreamStats, TickBudget};
use crate::codec::RegionCodec;
use crate::config::StreamConfig;
use crate::diff::FlushPlan;
use crate::entry::{LoadState, RegionWatchEntry};
use crate::error::StreamError;
use crate::loader::AsyncRegionLoader;
use crate::observer::{ObserverId, ObserverTable, UpdateMessage};
use crate::region::Region;
use crate::spatial::{CellPos, Footprint, RegionCoord, split_cell};
use crate::store::{LoadKind, RegionStore, provide_region};

/// Footprint bookkeeping for one watching observer.
#[derive(Debug, Clone, Copy)]
struct Watcher {
    footprint: Footprint,
    /// Position the footprint was last computed from.
    managed_position: Vec3,
}

/// What happened to one queued load.
enum LoadStep {
    /// A load finished, failed, or ran synchronously.
    Done,
    /// Still waiting on a worker or on queue space.
    Waiting,
    /// Stale queue item.
    Skipped,
}

fn deliver(
    observers: &ObserverTable,
    disconnected: &mut BTreeSet<ObserverId>,
    id: ObserverId,
    msg: UpdateMessage,
) -> bool {
    match observers.send(id, msg) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(observer = %id, %err, "region update not delivered");
            disconnected.insert(id);
            false
        }
    }
}

fn horizontal_distance(a: Vec3, b: Vec3) -> f32 {
    let dx = a.x - b.x;
    let dz = a.z - b.z;
    (dx * dx + dz * dz).sqrt()
}

/// Owns every `RegionWatchEntry` and runs the per-tick region pipeline.
pub struct ChunkWatchRegistry {
    config: StreamConfig,
    radius_cap: i32,
    entries: HashMap<RegionCoord, RegionWatchEntry>,
    /// Entries with pending changes, in first-mark order.
    dirty: Vec<RegionCoord>,
    pending_load: Vec<RegionCoord>,
    /// Coordinates currently in `pending_load`.
    load_queued: HashSet<RegionCoord>,
    pending_send: Vec<RegionCoord>,
    sort_pending: bool,
    store: Arc<dyn RegionStore>,
    codec: Arc<dyn RegionCodec>,
    loader: Option<AsyncRegionLoader>,
    watchers: HashMap<ObserverId, Watcher>,
    /// Failed regions and the tick they failed on.
    failed: BTreeMap<RegionCoord, u64>,
    disconnected: BTreeSet<ObserverId>,
    scratch: Vec<CellPos>,
    stats: StreamStats,
    ticks: u64,
}

impl std::fmt::Debug for ChunkWatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkWatchRegistry")
            .field("entries", &self.entries.len())
            .field("watchers", &self.watchers.len())
            .field("pending_load", &self.pending_load.len())
            .field("pending_send", &self.pending_send.len())
            .field("async", &self.loader.is_some())
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

impl ChunkWatchRegistry {
    /// Build a registry. Spawns the worker pool when async generation is on.
    pub fn new(
        config: StreamConfig,
        store: Arc<dyn RegionStore>,
        codec: Arc<dyn RegionCodec>,
    ) -> Result<Self, StreamError> {
        let config = config.validated();
        let loader = if config.async_generation_enabled {
            Some(AsyncRegionLoader::new(Arc::clone(&store), &config.loader)?)
        } else {
            None
        };
        Ok(Self {
            radius_cap: config.view_radius,
            config,
            entries: HashMap::new(),
            dirty: Vec::new(),
            pending_load: Vec::new(),
            load_queued: HashSet::new(),
            pending_send: Vec::new(),
            sort_pending: false,
            store,
            codec,
            loader,
            watchers: HashMap::new(),
            failed: BTreeMap::new(),
            disconnected: BTreeSet::new(),
            scratch: Vec::new(),
            stats: StreamStats::default(),
            ticks: 0,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, coord: RegionCoord) -> Option<&RegionWatchEntry> {
        self.entries.get(&coord)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegionWatchEntry> {
        self.entries.values()
    }

    pub fn pending_loads(&self) -> usize {
        self.pending_load.len()
    }

    pub fn pending_sends(&self) -> usize {
        self.pending_send.len()
    }

    /// Loader jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.loader.as_ref().map_or(0, AsyncRegionLoader::in_flight)
    }

    pub fn is_failed(&self, coord: RegionCoord) -> bool {
        self.failed.contains_key(&coord)
    }

    /// Current footprint of a watching observer.
    pub fn footprint(&self, id: ObserverId) -> Option<Footprint> {
        self.watchers.get(&id).map(|w| w.footprint)
    }

    /// Whether `coord` is sent, loading, or queued for `id`.
    pub fn streams_to(&self, id: ObserverId, coord: RegionCoord) -> bool {
        self.entries.get(&coord).is_some_and(|e| e.has_observer(id))
    }

    pub fn is_watching(&self, id: ObserverId) -> bool {
        self.watchers.contains_key(&id)
    }

    /// Ids of watching observers, unordered.
    pub fn watcher_ids(&self) -> impl Iterator<Item = ObserverId> + '_ {
        self.watchers.keys().copied()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn radius_cap(&self) -> i32 {
        self.radius_cap
    }

    /// Lower or restore the largest radius any observer gets. Takes effect
    /// on the next radius update of each observer.
    pub fn set_radius_cap(&mut self, cap: i32) {
        self.radius_cap = cap.clamp(0, self.config.view_radius);
    }

    fn effective_radius(&self, requested: i32) -> i32 {
        requested.clamp(0, self.radius_cap)
    }

    /// Observers whose channel failed since the last call.
    pub fn take_disconnected(&mut self) -> Vec<ObserverId> {
        std::mem::take(&mut self.disconnected).into_iter().collect()
    }

    /// Register `id` as interested in `coord`. Idempotent.
    ///
    /// A new entry requests its region; an already-sent region goes to the
    /// new observer in full at once. Regions in failure cooldown are skipped
    /// and picked up again when the cooldown ends.
    pub fn add_observer(&mut self, observers: &ObserverTable, id: ObserverId, coord: RegionCoord) -> bool {
        if self.failed.contains_key(&coord) {
            tracing::trace!(%coord, observer = %id, "region in failure cooldown");
            return false;
        }
        let mut created = false;
        let entry = self.entries.entry(coord).or_insert_with(|| {
            created = true;
            RegionWatchEntry::new(coord)
        });
        if !entry.add_observer(id) {
            return false;
        }
        self.stats.observers_added += 1;

        if created {
            self.request(coord);
        } else if entry.is_sent() {
            if let Some(msg) = entry.full_message(self.codec.as_ref()) {
                deliver(observers, &mut self.disconnected, id, msg);
            }
        }
        true
    }

    /// Drop `id`'s interest in `coord`, unloading it on the observer first if
    /// it was sent. An entry left without observers is cancelled and removed.
    pub fn remove_observer(&mut self, observers: &ObserverTable, id: ObserverId, coord: RegionCoord) -> bool {
        let Some(entry) = self.entries.get_mut(&coord) else {
            return false;
        };
        if !entry.remove_observer(id) {
            return false;
        }
        if entry.is_sent() {
            let msg = self.codec.encode_unload(coord);
            deliver(observers, &mut self.disconnected, id, msg);
        }
        self.stats.observers_removed += 1;
        if entry.observer_count() == 0 {
            self.release(coord);
        }
        true
    }

    fn release(&mut self, coord: RegionCoord) {
        if let Some(mut entry) = self.entries.remove(&coord) {
            if entry.cancel_ticket() {
                tracing::debug!(%coord, "cancelled region load without observers");
            }
        }
    }

    /// Queue the initial load of a freshly created entry.
    fn request(&mut self, coord: RegionCoord) {
        if let Some(loader) = &self.loader {
            let kind = if self.store.contains(coord) {
                LoadKind::Load
            } else {
                LoadKind::Generate
            };
            match loader.submit(coord, kind) {
                Ok(ticket) => {
                    if let Some(entry) = self.entries.get_mut(&coord) {
                        entry.begin_async(ticket);
                    }
                }
                Err(StreamError::QueueFull { capacity }) => {
                    tracing::trace!(%coord, capacity, "loader queue full, region waits");
                }
                Err(err) => {
                    tracing::warn!(%coord, %err, "async submit failed, region loads in the tick");
                }
            }
        }
        // A region released and re-added before the drain reached it is
        // still queued.
        if self.load_queued.insert(coord) {
            self.pending_load.push(coord);
            self.sort_pending = true;
        }
    }

    /// Start streaming the footprint of an observer in the table.
    pub fn watch(&mut self, observers: &ObserverTable, id: ObserverId) -> bool {
        if self.watchers.contains_key(&id) {
            return false;
        }
        let Some(observer) = observers.get(id) else {
            tracing::warn!(observer = %id, "watch requested for unknown observer");
            return false;
        };
        let radius = self.effective_radius(observer.view_radius);
        let footprint = Footprint::new(RegionCoord::containing(observer.position), radius);
        self.watchers.insert(
            id,
            Watcher {
                footprint,
                managed_position: observer.position,
            },
        );
        for coord in footprint.regions() {
            self.add_observer(observers, id, coord);
        }
        tracing::debug!(observer = %id, center = %footprint.center, radius, "observer watching");
        true
    }

    /// Stop streaming to an observer, unloading every region it was sent.
    pub fn unwatch(&mut self, observers: &ObserverTable, id: ObserverId) -> bool {
        let Some(watcher) = self.watchers.remove(&id) else {
            return false;
        };
        for coord in watcher.footprint.regions() {
            self.remove_observer(observers, id, coord);
        }
        tracing::debug!(observer = %id, "observer stopped watching");
        true
    }

    /// Forget an observer whose channel is gone, without messaging it.
    pub fn purge_observer(&mut self, id: ObserverId) -> usize {
        self.watchers.remove(&id);
        let mut emptied = Vec::new();
        let mut removed = 0;
        for (coord, entry) in self.entries.iter_mut() {
            if entry.remove_observer(id) {
                removed += 1;
                if entry.observer_count() == 0 {
                    emptied.push(*coord);
                }
            }
        }
        for coord in emptied {
            self.release(coord);
        }
        self.stats.observers_removed += removed;
        removed
    }

    /// Recompute the footprint after the observer moved.
    ///
    /// Nothing changes until it has moved at least `movement_threshold`
    /// units from where the footprint was last computed and its centre region
    /// differs.
    pub fn update_observer_position(&mut self, observers: &ObserverTable, id: ObserverId) -> bool {
        let Some(observer) = observers.get(id) else {
            return false;
        };
        let threshold = self.config.movement_threshold;
        let Some(watcher) = self.watchers.get_mut(&id) else {
            return false;
        };
        let position = observer.position;
        if horizontal_distance(position, watcher.managed_position) < threshold {
            return false;
        }
        let center = RegionCoord::containing(position);
        if center == watcher.footprint.center {
            return false;
        }
        let old = watcher.footprint;
        let new = Footprint::new(center, old.radius);
        watcher.footprint = new;
        watcher.managed_position = position;
        self.apply_footprint_change(observers, id, old, new);
        true
    }

    /// Resize an observer's footprint, capped by the server radius.
    pub fn update_observer_radius(&mut self, observers: &ObserverTable, id: ObserverId, requested: i32) -> bool {
        let radius = self.effective_radius(requested);
        let Some(watcher) = self.watchers.get_mut(&id) else {
            return false;
        };
        if watcher.footprint.radius == radius {
            return false;
        }
        let old = watcher.footprint;
        let new = Footprint::new(old.center, radius);
        watcher.footprint = new;
        tracing::debug!(observer = %id, from = old.radius, to = radius, "observer radius changed");
        self.apply_footprint_change(observers, id, old, new);
        true
    }

    fn apply_footprint_change(&mut self, observers: &ObserverTable, id: ObserverId, old: Footprint, new: Footprint) {
        for coord in old.difference(&new) {
            self.remove_observer(observers, id, coord);
        }
        for coord in new.difference(&old) {
            self.add_observer(observers, id, coord);
        }
    }

    /// Record one changed cell. Only the first mark since a flush schedules
    /// the entry.
    pub fn mark_dirty(&mut self, coord: RegionCoord, cell: CellPos) -> bool {
        let Some(entry) = self.entries.get_mut(&coord) else {
            tracing::warn!(
                error = %StreamError::InvariantViolation(format!("change recorded for unwatched region {coord}")),
                "dropping cell change"
            );
            return false;
        };
        if entry.mark_dirty(cell) {
            self.dirty.push(coord);
        }
        true
    }

    /// Apply a cell change.
    ///
    /// The change is written through to the store so later loads include
    /// it. A resident region is updated and the change scheduled for its
    /// observers; a region still queued or loading holds the change until
    /// its contents arrive. Returns `false` when nothing took the change or
    /// the cell already had that state.
    pub fn set_cell(&mut self, cell: WorldCell, state: u16) -> bool {
        let Some((coord, local)) = split_cell(cell) else {
            tracing::warn!(?cell, "cell change outside the region height");
            return false;
        };
        let stored = match self.store.write_cell(coord, local, state) {
            Ok(()) => true,
            Err(err) => {
                tracing::trace!(%coord, %err, "cell change not persisted");
                false
            }
        };
        let Some(entry) = self.entries.get_mut(&coord) else {
            return stored;
        };
        match entry.region_mut() {
            Some(region) => {
                if region.set(local, state) == state {
                    return false;
                }
                self.mark_dirty(coord, local)
            }
            None => {
                tracing::trace!(?cell, %coord, "holding cell change until the region loads");
                entry.hold_edit(local, state);
                true
            }
        }
    }

    /// Run one tick: failure retries, diff flush, then the bounded load and
    /// send queues. Returns statistics accumulated since the previous tick.
    pub fn tick(&mut self, observers: &ObserverTable) -> StreamStats {
        let started = Instant::now();
        let _span = tracing::info_span!("stream_tick", tick = self.ticks).entered();

        self.retry_failed(observers);
        self.flush_dirty(observers);

        if self.sort_pending && self.ticks % self.config.sort_interval_ticks == 0 {
            self.sort_queues();
            self.sort_pending = false;
        }

        let deadline = started + self.config.time_budget();
        let mut loads = TickBudget::new(deadline, self.config.max_region_loads_per_tick);
        self.drain_loads(observers, &mut loads);
        let mut sends = TickBudget::new(deadline, self.config.max_region_sends_per_tick);
        self.drain_sends(observers, &mut sends);

        self.ticks += 1;
        self.stats.pending_loads = self.pending_load.len();
        self.stats.pending_sends = self.pending_send.len();
        self.stats.total_entries = self.entries.len();
        self.stats.tick_time = started.elapsed();
        let stats = std::mem::take(&mut self.stats);
        tracing::trace!(?stats, "region tick done");
        stats
    }

    fn retry_failed(&mut self, observers: &ObserverTable) {
        if self.failed.is_empty() {
            return;
        }
        let now = self.ticks;
        let retry_after = self.config.failure_retry_ticks;
        let due: Vec<RegionCoord> = self
            .failed
            .iter()
            .filter(|(_, failed_at)| now.saturating_sub(**failed_at) >= retry_after)
            .map(|(coord, _)| *coord)
            .collect();
        for coord in due {
            self.failed.remove(&coord);
            let mut interested: Vec<ObserverId> = self
                .watchers
                .iter()
                .filter(|(_, w)| w.footprint.contains(coord))
                .map(|(id, _)| *id)
                .collect();
            interested.sort();
            if !interested.is_empty() {
                tracing::debug!(%coord, observers = interested.len(), "retrying failed region");
            }
            for id in interested {
                self.add_observer(observers, id, coord);
            }
        }
    }

    fn flush_dirty(&mut self, observers: &ObserverTable) {
        let dirty = std::mem::take(&mut self.dirty);
        let threshold = self.config.diff_clumping_threshold;
        for coord in &dirty {
            let Some(entry) = self.entries.get_mut(coord) else {
                continue;
            };
            let (plan, msg) = entry.flush(threshold, self.codec.as_ref(), &mut self.scratch);
            let Some(msg) = msg else {
                continue;
            };
            match plan {
                FlushPlan::Single(_) => self.stats.single_cell_updates += 1,
                FlushPlan::Batch => self.stats.batch_updates += 1,
                FlushPlan::Full(_) => self.stats.full_resends += 1,
                FlushPlan::Nothing => {}
            }
            for id in entry.observers() {
                deliver(observers, &mut self.disconnected, id, msg.clone());
            }
        }
        // Reuse the allocation; anything marked during the flush is kept.
        let mut dirty = dirty;
        dirty.clear();
        dirty.append(&mut self.dirty);
        self.dirty = dirty;
    }

    /// Closest-to-an-observer first. Stable, so ties keep request order.
    fn sort_queues(&mut self) {
        let entries = &self.entries;
        let watchers = &self.watchers;
        let nearest = |coord: &RegionCoord| -> i64 {
            entries
                .get(coord)
                .into_iter()
                .flat_map(|e| e.observers())
                .filter_map(|id| watchers.get(&id))
                .map(|w| w.footprint.center.distance_sq(*coord))
                .min()
                .unwrap_or(i64::MAX)
        };
        self.pending_load.sort_by_cached_key(|c| nearest(c));
        self.pending_send.sort_by_cached_key(|c| nearest(c));
    }

    fn drain_loads(&mut self, observers: &ObserverTable, budget: &mut TickBudget) {
        let mut queue = std::mem::take(&mut self.pending_load).into_iter();
        let mut keep = Vec::new();
        while let Some(coord) = queue.next() {
            if !budget.can_continue() {
                self.stats.budget_exhausted |= budget.timed_out();
                keep.push(coord);
                keep.extend(queue.by_ref());
                break;
            }
            match self.advance_load(observers, coord) {
                LoadStep::Done => {
                    budget.charge();
                    self.load_queued.remove(&coord);
                }
                LoadStep::Waiting => keep.push(coord),
                LoadStep::Skipped => {
                    self.load_queued.remove(&coord);
                }
            }
        }
        keep.append(&mut self.pending_load);
        self.pending_load = keep;
    }

    fn advance_load(&mut self, observers: &ObserverTable, coord: RegionCoord) -> LoadStep {
        let Some(entry) = self.entries.get_mut(&coord) else {
            return LoadStep::Skipped;
        };
        if entry.state() == LoadState::Ready {
            return LoadStep::Skipped;
        }
        if entry.has_in_flight() {
            return match entry.poll_ticket() {
                None => LoadStep::Waiting,
                Some(Ok(region)) => {
                    self.install(coord, region);
                    LoadStep::Done
                }
                Some(Err(err)) => {
                    self.handle_failure(observers, coord, err);
                    LoadStep::Done
                }
            };
        }
        if let Some(loader) = &self.loader {
            // Rejected by a full queue earlier; try again.
            let kind = if self.store.contains(coord) {
                LoadKind::Load
            } else {
                LoadKind::Generate
            };
            match loader.submit(coord, kind) {
                Ok(ticket) => {
                    entry.begin_async(ticket);
                    return LoadStep::Waiting;
                }
                Err(StreamError::QueueFull { .. }) => return LoadStep::Waiting,
                Err(err) => {
                    tracing::warn!(%coord, %err, "async submit failed, loading in the tick");
                }
            }
        }

        entry.begin_sync();
        match provide_region(self.store.as_ref(), coord, LoadKind::Load) {
            Ok(region) => self.install(coord, region),
            Err(err) => self.handle_failure(observers, coord, err),
        }
        LoadStep::Done
    }

    fn install(&mut self, coord: RegionCoord, region: Region) {
        let Some(entry) = self.entries.get_mut(&coord) else {
            return;
        };
        entry.complete(region);
        self.pending_send.push(coord);
        self.stats.regions_loaded += 1;
        tracing::debug!(%coord, "region loaded");
    }

    /// Retry once synchronously; on a second failure drop the entry and
    /// unload it from its observers.
    fn handle_failure(&mut self, observers: &ObserverTable, coord: RegionCoord, mut err: StreamError) {
        let Some(entry) = self.entries.get_mut(&coord) else {
            return;
        };
        if entry.take_retry() {
            tracing::warn!(%coord, %err, "region load failed, retrying once");
            entry.begin_sync();
            match provide_region(self.store.as_ref(), coord, LoadKind::Load) {
                Ok(region) => {
                    self.install(coord, region);
                    return;
                }
                Err(retry_err) => err = retry_err,
            }
        }

        tracing::warn!(%coord, error = %err, "dropping region after failed retry");
        if let Some(entry) = self.entries.remove(&coord) {
            let msg = self.codec.encode_unload(coord);
            for id in entry.observers() {
                deliver(observers, &mut self.disconnected, id, msg.clone());
            }
        }
        self.failed.insert(coord, self.ticks);
        self.stats.load_failures += 1;
    }

    fn drain_sends(&mut self, observers: &ObserverTable, budget: &mut TickBudget) {
        let mut queue = std::mem::take(&mut self.pending_send).into_iter();
        let mut keep = Vec::new();
        while let Some(coord) = queue.next() {
            if !budget.can_continue() {
                self.stats.budget_exhausted |= budget.timed_out();
                keep.push(coord);
                keep.extend(queue.by_ref());
                break;
            }
            let Some(entry) = self.entries.get_mut(&coord) else {
                continue;
            };
            if entry.is_sent() || entry.state() != LoadState::Ready {
                continue;
            }
            let Some(msg) = entry.full_message(self.codec.as_ref()) else {
                continue;
            };
            for id in entry.observers() {
                deliver(observers, &mut self.disconnected, id, msg.clone());
            }
            entry.mark_sent();
            self.stats.regions_sent += 1;
            budget.charge();
            tracing::debug!(%coord, observers = entry.observer_count(), "region sent");
        }
        keep.append(&mut self.pending_send);
        self.pending_send = keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::config::{FullQueuePolicy, LoaderConfig};
    use crate::error::StoreError;
    use crate::observer::{MessageKind, Observer};
    use crate::store::FlatWorldStore;
    use crossbeam_channel::Receiver;
    use std::thread;
    use std::time::Duration;

    fn config() -> StreamConfig {
        StreamConfig {
            per_tick_time_budget_ms: 10_000,
            ..StreamConfig::default()
        }
    }

    fn registry(config: StreamConfig) -> ChunkWatchRegistry {
        registry_with(config, Arc::new(FlatWorldStore::default()))
    }

    fn registry_with(config: StreamConfig, store: Arc<dyn RegionStore>) -> ChunkWatchRegistry {
        ChunkWatchRegistry::new(config, store, Arc::new(JsonCodec)).unwrap()
    }

    fn observer_at(table: &mut ObserverTable, id: u32, pos: Vec3, radius: i32) -> Receiver<UpdateMessage> {
        let (observer, rx) = Observer::with_channel(ObserverId(id), pos, radius);
        table.insert(observer);
        rx
    }

    fn count(rx: &Receiver<UpdateMessage>, kind: MessageKind) -> usize {
        rx.try_iter().filter(|m| m.kind == kind).count()
    }

    fn tick_until_sent(registry: &mut ChunkWatchRegistry, table: &ObserverTable) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.entries().any(|e| !e.is_sent()) && Instant::now() < deadline {
            registry.tick(table);
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Every footprint region holds its observer and every entry observer
    /// has the region in its footprint.
    fn assert_symmetric(registry: &ChunkWatchRegistry) {
        for (id, watcher) in &registry.watchers {
            for coord in watcher.footprint.regions() {
                if registry.is_failed(coord) {
                    continue;
                }
                let entry = registry.entry(coord).expect("footprint region has an entry");
                assert!(entry.has_observer(*id));
            }
        }
        for entry in registry.entries() {
            for id in entry.observers() {
                assert!(registry.footprint(id).unwrap().contains(entry.coord()));
            }
        }
    }

    fn assert_no_orphans(registry: &ChunkWatchRegistry) {
        for entry in registry.entries() {
            assert!(entry.observer_count() > 0 || entry.has_in_flight());
        }
    }

    struct SlowStore(Duration);

    impl RegionStore for SlowStore {
        fn load(&self, _coord: RegionCoord) -> Result<Option<Region>, StoreError> {
            Ok(None)
        }

        fn generate(&self, coord: RegionCoord) -> Result<Region, StoreError> {
            thread::sleep(self.0);
            Ok(Region::empty(coord))
        }
    }

    struct FailingStore;

    impl RegionStore for FailingStore {
        fn load(&self, _coord: RegionCoord) -> Result<Option<Region>, StoreError> {
            Err(StoreError::new("corrupt region file"))
        }

        fn generate(&self, _coord: RegionCoord) -> Result<Region, StoreError> {
            Err(StoreError::new("unreachable generator"))
        }
    }

    /// Generation fails on loader workers and succeeds on the tick thread.
    struct WorkerFailingStore {
        home: thread::ThreadId,
    }

    impl RegionStore for WorkerFailingStore {
        fn load(&self, _coord: RegionCoord) -> Result<Option<Region>, StoreError> {
            Ok(None)
        }

        fn generate(&self, coord: RegionCoord) -> Result<Region, StoreError> {
            if thread::current().id() == self.home {
                Ok(Region::empty(coord))
            } else {
                Err(StoreError::new("worker ran out of scratch space"))
            }
        }
    }

    #[test]
    fn five_by_five_footprint_loads_and_sends_in_one_tick() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::new(8.0, 64.0, 8.0), 2);
        let mut registry = registry(config());

        assert!(registry.watch(&table, ObserverId(1)));
        assert_eq!(registry.len(), 25);
        assert!(registry.entries().all(|e| e.state() == LoadState::Idle));

        let stats = registry.tick(&table);
        assert_eq!(stats.observers_added, 25);
        assert_eq!(stats.regions_loaded, 25);
        assert_eq!(stats.regions_sent, 25);
        assert!(registry
            .entries()
            .all(|e| e.state() == LoadState::Ready && e.is_sent()));
        assert_eq!(count(&rx, MessageKind::RegionFull), 25);
        assert_symmetric(&registry);
    }

    #[test]
    fn seventy_changes_flush_as_one_full_resend() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::new(8.0, 64.0, 8.0), 0);
        let mut registry = registry(config());
        registry.watch(&table, ObserverId(1));
        registry.tick(&table);
        rx.try_iter().for_each(drop);

        let coord = RegionCoord::new(0, 0);
        for i in 0..70u8 {
            assert!(registry.mark_dirty(coord, CellPos::new(i % 16, 100, i / 16)));
        }
        let stats = registry.tick(&table);
        assert_eq!(stats.full_resends, 1);
        let msgs: Vec<UpdateMessage> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::RegionFull);
    }

    #[test]
    fn repeated_marks_flush_once() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::ZERO, 0);
        let mut registry = registry(config());
        registry.watch(&table, ObserverId(1));
        registry.tick(&table);
        rx.try_iter().for_each(drop);

        let coord = RegionCoord::new(0, 0);
        for _ in 0..5 {
            registry.mark_dirty(coord, CellPos::new(3, 70, 3));
        }
        let stats = registry.tick(&table);
        assert_eq!(stats.single_cell_updates, 1);
        let msgs: Vec<UpdateMessage> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::RegionCell);

        // Nothing pending, nothing sent.
        registry.tick(&table);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_cell_writes_region_and_sends_update() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::ZERO, 0);
        let mut registry = registry(config());
        registry.watch(&table, ObserverId(1));
        registry.tick(&table);
        rx.try_iter().for_each(drop);

        assert!(registry.set_cell(WorldCell::new(2, 200, 3), 42));
        // Same state again is not a change.
        assert!(!registry.set_cell(WorldCell::new(2, 200, 3), 42));
        // Not watched: kept by the store only.
        assert!(registry.set_cell(WorldCell::new(500, 10, 500), 1));
        assert!(registry.entry(RegionCoord::new(31, 31)).is_none());

        let region = registry.entry(RegionCoord::new(0, 0)).unwrap().region().unwrap();
        assert_eq!(region.get(CellPos::new(2, 200, 3)), 42);
        registry.tick(&table);
        assert_eq!(count(&rx, MessageKind::RegionCell), 1);
    }

    #[test]
    fn edits_survive_reloading_the_region() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::ZERO, 0);
        let mut registry = registry(config());
        registry.watch(&table, ObserverId(1));
        registry.tick(&table);
        assert!(registry.set_cell(WorldCell::new(1, 200, 1), 42));
        registry.tick(&table);

        registry.unwatch(&table, ObserverId(1));
        assert!(registry.is_empty());
        registry.watch(&table, ObserverId(1));
        registry.tick(&table);
        let region = registry.entry(RegionCoord::new(0, 0)).unwrap().region().unwrap();
        assert_eq!(region.get(CellPos::new(1, 200, 1)), 42);
        let kinds: Vec<MessageKind> = rx.try_iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            [
                MessageKind::RegionFull,
                MessageKind::RegionCell,
                MessageKind::RegionUnload,
                MessageKind::RegionFull
            ]
        );
    }

    #[test]
    fn edit_to_a_queued_region_is_applied_on_load() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 0);
        // Read-only, so only the entry can carry the change.
        let mut registry = registry_with(config(), Arc::new(SlowStore(Duration::ZERO)));
        registry.watch(&table, ObserverId(1));
        assert_eq!(registry.entry(RegionCoord::new(0, 0)).unwrap().state(), LoadState::Idle);

        assert!(registry.set_cell(WorldCell::new(1, 200, 1), 42));
        assert_eq!(registry.entry(RegionCoord::new(0, 0)).unwrap().held_edits(), 1);
        // Nobody watches this one and the store cannot keep it.
        assert!(!registry.set_cell(WorldCell::new(100, 10, 100), 1));

        registry.tick(&table);
        let entry = registry.entry(RegionCoord::new(0, 0)).unwrap();
        assert!(entry.is_sent());
        assert_eq!(entry.region().unwrap().get(CellPos::new(1, 200, 1)), 42);
    }

    #[test]
    fn edit_during_async_generation_is_applied_on_install() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 0);
        let mut registry = registry_with(
            StreamConfig {
                async_generation_enabled: true,
                ..config()
            },
            Arc::new(SlowStore(Duration::from_millis(5))),
        );
        registry.watch(&table, ObserverId(1));
        assert_eq!(
            registry.entry(RegionCoord::new(0, 0)).unwrap().state(),
            LoadState::Generating
        );

        assert!(registry.set_cell(WorldCell::new(3, 90, 3), 7));
        tick_until_sent(&mut registry, &table);
        let entry = registry.entry(RegionCoord::new(0, 0)).unwrap();
        assert!(entry.is_sent());
        assert_eq!(entry.region().unwrap().get(CellPos::new(3, 90, 3)), 7);
    }

    #[test]
    fn mark_dirty_without_entry_is_dropped() {
        let mut registry = registry(config());
        assert!(!registry.mark_dirty(RegionCoord::new(9, 9), CellPos::new(0, 0, 0)));
    }

    #[test]
    fn load_count_budget_is_respected() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 2);
        let mut registry = registry(StreamConfig {
            max_region_loads_per_tick: 4,
            ..config()
        });
        registry.watch(&table, ObserverId(1));

        let stats = registry.tick(&table);
        assert_eq!(stats.regions_loaded, 4);
        assert_eq!(registry.pending_loads(), 21);
        let ready = registry
            .entries()
            .filter(|e| e.state() == LoadState::Ready)
            .count();
        assert_eq!(ready, 4);

        let stats = registry.tick(&table);
        assert_eq!(stats.regions_loaded, 4);
        assert_eq!(registry.pending_loads(), 17);
    }

    #[test]
    fn time_budget_stops_between_slow_loads() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 2);
        let mut registry = registry_with(
            StreamConfig {
                per_tick_time_budget_ms: 1,
                ..StreamConfig::default()
            },
            Arc::new(SlowStore(Duration::from_millis(20))),
        );
        registry.watch(&table, ObserverId(1));

        let stats = registry.tick(&table);
        assert_eq!(stats.regions_loaded, 1);
        assert!(stats.budget_exhausted);
        assert_eq!(registry.pending_loads(), 24);
    }

    #[test]
    fn unwatch_unloads_and_removes_everything() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::ZERO, 2);
        let mut registry = registry(config());
        registry.watch(&table, ObserverId(1));
        registry.tick(&table);
        rx.try_iter().for_each(drop);

        assert!(registry.unwatch(&table, ObserverId(1)));
        assert!(registry.is_empty());
        assert_eq!(count(&rx, MessageKind::RegionUnload), 25);
        assert!(!registry.unwatch(&table, ObserverId(1)));
    }

    #[test]
    fn late_joiner_gets_sent_regions_at_once() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 1);
        let rx2 = observer_at(&mut table, 2, Vec3::new(4.0, 0.0, 4.0), 1);
        let mut registry = registry(config());
        registry.watch(&table, ObserverId(1));
        registry.tick(&table);

        registry.watch(&table, ObserverId(2));
        assert_eq!(registry.len(), 9);
        assert_eq!(count(&rx2, MessageKind::RegionFull), 9);

        // Leaving the shared regions keeps them for the other observer.
        registry.unwatch(&table, ObserverId(2));
        assert_eq!(registry.len(), 9);
        assert_symmetric(&registry);
    }

    #[test]
    fn add_observer_is_idempotent() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 0);
        let mut registry = registry(config());
        let coord = RegionCoord::new(3, 3);
        assert!(registry.add_observer(&table, ObserverId(1), coord));
        assert!(!registry.add_observer(&table, ObserverId(1), coord));
        assert_eq!(registry.pending_loads(), 1);
        assert!(registry.remove_observer(&table, ObserverId(1), coord));
        assert!(!registry.remove_observer(&table, ObserverId(1), coord));
        assert!(registry.is_empty());
        // The stale queue item is dropped on the next tick.
        registry.tick(&table);
        assert_eq!(registry.pending_loads(), 0);
    }

    #[test]
    fn readding_a_released_region_is_queued_once() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 0);
        let mut registry = registry(config());
        let coord = RegionCoord::new(3, 3);
        registry.add_observer(&table, ObserverId(1), coord);
        registry.remove_observer(&table, ObserverId(1), coord);
        registry.add_observer(&table, ObserverId(1), coord);
        assert_eq!(registry.pending_loads(), 1);

        let stats = registry.tick(&table);
        assert_eq!(stats.regions_loaded, 1);
        assert_eq!(registry.pending_loads(), 0);

        // Queued again after the first load completed.
        registry.remove_observer(&table, ObserverId(1), coord);
        registry.add_observer(&table, ObserverId(1), coord);
        assert_eq!(registry.pending_loads(), 1);
    }

    #[test]
    fn movement_needs_threshold_and_region_change() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::new(8.0, 0.0, 8.0), 2);
        let mut registry = registry(config());
        registry.watch(&table, ObserverId(1));
        registry.tick(&table);
        rx.try_iter().for_each(drop);

        // Inside the same region.
        table.get_mut(ObserverId(1)).unwrap().position = Vec3::new(14.0, 0.0, 8.0);
        assert!(!registry.update_observer_position(&table, ObserverId(1)));

        // One region over.
        table.get_mut(ObserverId(1)).unwrap().position = Vec3::new(17.0, 0.0, 8.0);
        assert!(registry.update_observer_position(&table, ObserverId(1)));
        assert_eq!(registry.footprint(ObserverId(1)).unwrap().center, RegionCoord::new(1, 0));
        assert_eq!(count(&rx, MessageKind::RegionUnload), 5);
        assert_eq!(registry.len(), 25);
        assert_symmetric(&registry);

        // Crossing back by a hair is below the threshold.
        table.get_mut(ObserverId(1)).unwrap().position = Vec3::new(15.0, 0.0, 8.0);
        assert!(!registry.update_observer_position(&table, ObserverId(1)));
    }

    #[test]
    fn radius_change_only_touches_the_difference() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 2);
        let mut registry = registry(config());
        registry.watch(&table, ObserverId(1));
        registry.tick(&table);

        assert!(registry.update_observer_radius(&table, ObserverId(1), 4));
        assert_eq!(registry.len(), 81);
        // Already-watched regions are not requested again.
        assert_eq!(registry.pending_loads(), 81 - 25);

        assert!(registry.update_observer_radius(&table, ObserverId(1), 1));
        assert_eq!(registry.len(), 9);
        assert!(!registry.update_observer_radius(&table, ObserverId(1), 1));
        assert_symmetric(&registry);
    }

    #[test]
    fn radius_cap_limits_footprints() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 20);
        let mut registry = registry(StreamConfig {
            view_radius: 3,
            ..config()
        });
        registry.watch(&table, ObserverId(1));
        assert_eq!(registry.footprint(ObserverId(1)).unwrap().radius, 3);

        registry.set_radius_cap(1);
        assert!(registry.update_observer_radius(&table, ObserverId(1), 20));
        assert_eq!(registry.len(), 9);

        registry.set_radius_cap(50);
        assert_eq!(registry.radius_cap(), 3);
    }

    #[test]
    fn no_orphans_after_churn() {
        let mut table = ObserverTable::new();
        for id in 1..=3 {
            observer_at(&mut table, id, Vec3::new(id as f32 * 20.0, 0.0, 0.0), 2);
        }
        let mut registry = registry(StreamConfig {
            max_region_loads_per_tick: 3,
            movement_threshold: 0.0,
            ..config()
        });
        for id in 1..=3 {
            registry.watch(&table, ObserverId(id));
        }
        registry.tick(&table);

        for step in 0..6 {
            let o = table.get_mut(ObserverId(1)).unwrap();
            o.position.z += 17.0;
            registry.update_observer_position(&table, ObserverId(1));
            registry.update_observer_radius(&table, ObserverId(2), step % 3);
            if step == 3 {
                registry.unwatch(&table, ObserverId(3));
            }
            registry.tick(&table);
            assert_no_orphans(&registry);
            assert_symmetric(&registry);
        }
    }

    #[test]
    fn queue_is_sorted_closest_first() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::new(8.0, 0.0, 8.0), 2);
        let mut registry = registry(StreamConfig {
            max_region_loads_per_tick: 1,
            sort_interval_ticks: 1,
            ..config()
        });
        registry.watch(&table, ObserverId(1));
        registry.tick(&table);
        assert_eq!(
            registry.entry(RegionCoord::new(0, 0)).unwrap().state(),
            LoadState::Ready
        );

        table.get_mut(ObserverId(1)).unwrap().position = Vec3::new(40.0, 0.0, 8.0);
        assert!(registry.update_observer_position(&table, ObserverId(1)));
        registry.tick(&table);
        assert_eq!(
            registry.entry(RegionCoord::new(2, 0)).unwrap().state(),
            LoadState::Ready
        );
    }

    #[test]
    fn failed_region_is_dropped_then_retried_after_cooldown() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::ZERO, 0);
        let mut registry = registry_with(
            StreamConfig {
                failure_retry_ticks: 3,
                ..config()
            },
            Arc::new(FailingStore),
        );
        registry.watch(&table, ObserverId(1));

        let stats = registry.tick(&table);
        assert_eq!(stats.load_failures, 1);
        assert!(registry.is_empty());
        assert!(registry.is_failed(RegionCoord::new(0, 0)));
        assert_eq!(count(&rx, MessageKind::RegionUnload), 1);
        // Not re-added during cooldown.
        assert!(!registry.add_observer(&table, ObserverId(1), RegionCoord::new(0, 0)));

        registry.tick(&table);
        registry.tick(&table);
        assert!(registry.is_empty());
        // Cooldown over: requested again, fails again.
        let stats = registry.tick(&table);
        assert_eq!(stats.observers_added, 1);
        assert_eq!(stats.load_failures, 1);
    }

    #[test]
    fn failed_async_generation_recovers_on_sync_retry() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::ZERO, 1);
        let mut registry = registry_with(
            StreamConfig {
                async_generation_enabled: true,
                ..config()
            },
            Arc::new(WorkerFailingStore {
                home: thread::current().id(),
            }),
        );
        registry.watch(&table, ObserverId(1));
        assert!(registry.entries().all(|e| e.has_in_flight()));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut failures = 0;
        while registry.entries().any(|e| !e.is_sent()) && Instant::now() < deadline {
            failures += registry.tick(&table).load_failures;
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(failures, 0);
        assert_eq!(registry.len(), 9);
        assert!(registry.entries().all(|e| e.is_sent() && e.state() == LoadState::Ready));
        assert!(Footprint::new(RegionCoord::new(0, 0), 1)
            .regions()
            .into_iter()
            .all(|c| !registry.is_failed(c)));
        assert_eq!(count(&rx, MessageKind::RegionFull), 9);
    }

    #[test]
    fn closed_channel_is_reported_and_purged() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::ZERO, 1);
        observer_at(&mut table, 2, Vec3::ZERO, 1);
        let mut registry = registry(config());
        registry.watch(&table, ObserverId(1));
        registry.watch(&table, ObserverId(2));
        drop(rx);

        registry.tick(&table);
        assert_eq!(registry.take_disconnected(), vec![ObserverId(1)]);
        assert_eq!(registry.purge_observer(ObserverId(1)), 9);
        assert!(!registry.is_watching(ObserverId(1)));
        assert!(registry.entries().all(|e| !e.has_observer(ObserverId(1))));
        assert_eq!(registry.len(), 9);
    }

    #[test]
    fn async_generation_streams_everything() {
        let mut table = ObserverTable::new();
        let rx = observer_at(&mut table, 1, Vec3::ZERO, 2);
        let mut registry = registry(StreamConfig {
            async_generation_enabled: true,
            ..config()
        });
        registry.watch(&table, ObserverId(1));
        assert!(registry
            .entries()
            .all(|e| e.state() == LoadState::Generating));

        tick_until_sent(&mut registry, &table);
        assert!(registry.entries().all(|e| e.is_sent()));
        assert_eq!(count(&rx, MessageKind::RegionFull), 25);
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn full_loader_queue_is_retried() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 1);
        let mut registry = registry_with(
            StreamConfig {
                async_generation_enabled: true,
                loader: LoaderConfig {
                    workers: 1,
                    max_queued: 1,
                    when_full: FullQueuePolicy::Reject,
                },
                ..config()
            },
            Arc::new(SlowStore(Duration::from_millis(2))),
        );
        registry.watch(&table, ObserverId(1));
        assert!(registry.entries().any(|e| e.state() == LoadState::Idle));

        tick_until_sent(&mut registry, &table);
        assert_eq!(registry.len(), 9);
        assert!(registry.entries().all(|e| e.is_sent()));
    }

    #[test]
    fn removing_last_observer_cancels_async_load() {
        let mut table = ObserverTable::new();
        observer_at(&mut table, 1, Vec3::ZERO, 1);
        let mut registry = registry_with(
            StreamConfig {
                async_generation_enabled: true,
                ..config()
            },
            Arc::new(SlowStore(Duration::from_millis(5))),
        );
        registry.watch(&table, ObserverId(1));
        assert!(registry.entries().all(|e| e.has_in_flight()));

        registry.unwatch(&table, ObserverId(1));
        assert!(registry.is_empty());
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.in_flight() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(registry.in_flight(), 0);
        registry.tick(&table);
        assert_eq!(registry.pending_loads(), 0);
    }
}

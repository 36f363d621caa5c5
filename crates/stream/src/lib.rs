//! Streaming: spatial interest management and world streaming.
//!
//! Decides every tick which regions and which mobile entities each observer
//! must be told about, and streams region contents, cell changes, and entity
//! updates to observers with bounded per-tick cost.
//!
//! # Invariants
//! - An observer is in a region's watch entry iff the region is inside its
//!   footprint (regions in failure cooldown excepted).
//! - A region entry has at least one observer or an in-flight load; the last
//!   observer leaving cancels the load and removes the entry.
//! - A cell marked dirty several times before a flush goes out once.
//! - Load and send queues never exceed their per-tick count or time budget;
//!   the budget is checked between items, never mid-item.
//! - Loader workers never touch simulation state. Results are only observed
//!   by polling a ticket on the simulation thread.
//! - Tick order is fixed: diff flush, then queue drain, then entity interest.
//!   An entity is only visible to an observer inside regions streamed to it.
//! - Cell changes are written through to the region store, and a region that
//!   is still loading holds its changes until the contents arrive.
//!
//! Collaborators (region store, codecs, observer sinks) are traits so the
//! engine runs against any persistence format or wire protocol.

mod budget;
mod codec;
mod config;
mod diff;
mod driver;
mod entry;
mod error;
mod loader;
mod observer;
mod region;
mod registry;
mod spatial;
mod store;
mod tracker;

pub use budget::{StreamStats, TickBudget, TickTimer};
pub use codec::{EntityCodec, JsonCodec, RegionCodec};
pub use config::{AdaptiveRadius, FullQueuePolicy, LoaderConfig, StreamConfig};
pub use diff::{FlushPlan, INLINE_CAPACITY, PendingDiff};
pub use driver::{SimulationTickDriver, TickReport};
pub use entry::{LoadState, RegionWatchEntry};
pub use error::{StoreError, StreamError};
pub use loader::{AsyncRegionLoader, LoadPoll, LoadTicket};
pub use observer::{
    ChannelClosed, ChannelSink, MessageKind, MessageSink, Observer, ObserverId, ObserverTable,
    UpdateMessage,
};
pub use region::{AIR, Region, SectionMask};
pub use registry::ChunkWatchRegistry;
pub use spatial::{
    CellPos, Footprint, MAX_VIEW_RADIUS, MIN_VIEW_RADIUS, REGION_CELLS, REGION_HEIGHT,
    REGION_SIZE, RegionCoord, SECTION_COUNT, SECTION_HEIGHT, clamp_view_radius, split_cell,
};
pub use store::{FlatWorldStore, LoadKind, RegionStore, provide_region};
pub use tracker::{
    EntityDelta, EntityInterestTracker, EntityWatchEntry, Movement, PolicyTable, TrackerStats,
    TrackingPolicy, TrackingState, default_policy,
};

pub fn crate_info() -> &'static str {
    "worldspace-stream v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("stream"));
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::{StoreError, StreamError};
use crate::region::Region;
use crate::spatial::{CellPos, RegionCoord};

/// Source of region contents: persisted regions and the world generator.
///
/// Implementations are called from loader worker threads as well as from
/// the simulation thread, so they must be shareable.
pub trait RegionStore: Send + Sync + 'static {
    /// Load a previously stored region. `Ok(None)` means it was never stored.
    fn load(&self, coord: RegionCoord) -> Result<Option<Region>, StoreError>;

    /// Generate a region from scratch.
    fn generate(&self, coord: RegionCoord) -> Result<Region, StoreError>;

    /// Cheap existence check used to pick between a load and a generate job.
    fn contains(&self, _coord: RegionCoord) -> bool {
        false
    }

    /// Persist one changed cell so later loads of the region include it.
    ///
    /// The default store is read-only; edits then only live in regions that
    /// are resident when they happen.
    fn write_cell(&self, _coord: RegionCoord, _pos: CellPos, _state: u16) -> Result<(), StoreError> {
        Err(StoreError::new("region store is read-only"))
    }
}

/// What a load request is expected to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    /// Read from the store, generating only if nothing is stored.
    Load,
    /// Skip the lookup and generate.
    Generate,
}

/// Produce a region, falling back from load to generate.
pub fn provide_region(
    store: &dyn RegionStore,
    coord: RegionCoord,
    kind: LoadKind,
) -> Result<Region, StreamError> {
    if kind == LoadKind::Load {
        match store.load(coord) {
            Ok(Some(region)) => return Ok(region),
            Ok(None) => {}
            Err(source) => return Err(StreamError::LoadFailure { coord, source }),
        }
    }
    store
        .generate(coord)
        .map_err(|source| StreamError::GenerationFailure { coord, source })
}

/// Seeded generator of gently varying flat terrain.
///
/// Cell edits are kept in memory per region; a region with edits loads as
/// generated terrain with its edits replayed on top.
#[derive(Debug)]
pub struct FlatWorldStore {
    pub seed: u64,
    pub ground_state: u16,
    pub base_height: u8,
    pub height_variance: u8,
    /// Packed cell position to state, per edited region.
    edits: Mutex<HashMap<RegionCoord, BTreeMap<u16, u16>>>,
}

impl Default for FlatWorldStore {
    fn default() -> Self {
        Self {
            seed: 0,
            ground_state: 1,
            base_height: 60,
            height_variance: 8,
            edits: Mutex::new(HashMap::new()),
        }
    }
}

impl FlatWorldStore {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Number of regions carrying edits.
    pub fn edited_regions(&self) -> usize {
        self.edits().map_or(0, |edits| edits.len())
    }

    fn edits(&self) -> Result<MutexGuard<'_, HashMap<RegionCoord, BTreeMap<u16, u16>>>, StoreError> {
        self.edits
            .lock()
            .map_err(|_| StoreError::new("edit table poisoned by a panicked writer"))
    }

    fn height_at(&self, coord: RegionCoord) -> u8 {
        if self.height_variance == 0 {
            return self.base_height;
        }
        let mut h: u64 = 0xcbf2_9ce4_8422_2325 ^ self.seed;
        for b in coord.x.to_le_bytes().iter().chain(coord.z.to_le_bytes().iter()) {
            h ^= u64::from(*b);
            h = h.wrapping_mul(0x0100_0000_01b3);
        }
        let offset = (h % u64::from(self.height_variance)) as u8;
        self.base_height.saturating_add(offset)
    }
}

impl RegionStore for FlatWorldStore {
    fn load(&self, coord: RegionCoord) -> Result<Option<Region>, StoreError> {
        let edits = self.edits()?;
        let Some(cells) = edits.get(&coord) else {
            return Ok(None);
        };
        let mut region = self.generate(coord)?;
        for (packed, state) in cells {
            region.set(CellPos::unpack(*packed), *state);
        }
        Ok(Some(region))
    }

    fn generate(&self, coord: RegionCoord) -> Result<Region, StoreError> {
        Ok(Region::layered(coord, self.ground_state, self.height_at(coord)))
    }

    fn contains(&self, coord: RegionCoord) -> bool {
        self.edits().is_ok_and(|edits| edits.contains_key(&coord))
    }

    fn write_cell(&self, coord: RegionCoord, pos: CellPos, state: u16) -> Result<(), StoreError> {
        self.edits()?.entry(coord).or_default().insert(pos.pack(), state);
        Ok(())
    }
}

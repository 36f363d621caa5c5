use glam::Vec3;
use serde::{Deserialize, Serialize};
use worldspace_common::WorldCell;

/// Edge length of a region in cells, along X and Z.
pub const REGION_SIZE: i32 = 16;
/// Height of a region in cells.
pub const REGION_HEIGHT: i32 = 256;
/// Height of one vertical section of a region.
pub const SECTION_HEIGHT: i32 = 16;
/// Number of vertical sections per region.
pub const SECTION_COUNT: usize = (REGION_HEIGHT / SECTION_HEIGHT) as usize;
/// Number of cells stored per region.
pub const REGION_CELLS: usize = (REGION_SIZE * REGION_SIZE * REGION_HEIGHT) as usize;

/// Smallest server-wide view radius, in regions.
pub const MIN_VIEW_RADIUS: i32 = 3;
/// Largest server-wide view radius, in regions.
pub const MAX_VIEW_RADIUS: i32 = 32;

/// Clamp a server view radius into the supported range.
pub fn clamp_view_radius(radius: i32) -> i32 {
    radius.clamp(MIN_VIEW_RADIUS, MAX_VIEW_RADIUS)
}

/// A 2D region coordinate in the world grid (regions span the full height).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionCoord {
    pub x: i32,
    pub z: i32,
}

impl RegionCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Region containing a world position.
    pub fn containing(pos: Vec3) -> Self {
        Self {
            x: (pos.x / REGION_SIZE as f32).floor() as i32,
            z: (pos.z / REGION_SIZE as f32).floor() as i32,
        }
    }

    /// Region containing a world cell.
    pub fn of_cell(cell: WorldCell) -> Self {
        Self {
            x: cell.x.div_euclid(REGION_SIZE),
            z: cell.z.div_euclid(REGION_SIZE),
        }
    }

    /// World position of the region's horizontal centre (at y = 0).
    pub fn center(self) -> Vec3 {
        let half = REGION_SIZE as f32 * 0.5;
        Vec3::new(
            (self.x * REGION_SIZE) as f32 + half,
            0.0,
            (self.z * REGION_SIZE) as f32 + half,
        )
    }

    /// Squared distance to another region, in region units.
    pub fn distance_sq(self, other: RegionCoord) -> i64 {
        let dx = i64::from(self.x - other.x);
        let dz = i64::from(self.z - other.z);
        dx * dx + dz * dz
    }
}

impl std::fmt::Display for RegionCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// Position of a cell inside its region.
///
/// Packs into a `u16` as `x << 12 | z << 8 | y`, which is what the diff
/// buffer stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    pub x: u8,
    pub y: u8,
    pub z: u8,
}

impl CellPos {
    /// Build a local position. `x` and `z` are masked into `0..16`.
    pub fn new(x: u8, y: u8, z: u8) -> Self {
        Self {
            x: x & 0x0f,
            y,
            z: z & 0x0f,
        }
    }

    pub fn pack(self) -> u16 {
        (u16::from(self.x) << 12) | (u16::from(self.z) << 8) | u16::from(self.y)
    }

    pub fn unpack(packed: u16) -> Self {
        Self {
            x: ((packed >> 12) & 0x0f) as u8,
            z: ((packed >> 8) & 0x0f) as u8,
            y: (packed & 0xff) as u8,
        }
    }

    /// Index into a region's flat cell array (y-major, then z, then x).
    pub fn index(self) -> usize {
        (usize::from(self.y) * REGION_SIZE as usize + usize::from(self.z)) * REGION_SIZE as usize
            + usize::from(self.x)
    }

    /// Vertical section this cell belongs to.
    pub fn section(self) -> usize {
        usize::from(self.y) / SECTION_HEIGHT as usize
    }
}

/// Split a world cell into its region and local position.
///
/// Returns `None` for cells above or below the region height.
pub fn split_cell(cell: WorldCell) -> Option<(RegionCoord, CellPos)> {
    if !(0..REGION_HEIGHT).contains(&cell.y) {
        return None;
    }
    let local = CellPos::new(
        cell.x.rem_euclid(REGION_SIZE) as u8,
        cell.y as u8,
        cell.z.rem_euclid(REGION_SIZE) as u8,
    );
    Some((RegionCoord::of_cell(cell), local))
}

/// The square set of regions an observer watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footprint {
    pub center: RegionCoord,
    pub radius: i32,
}

impl Footprint {
    pub fn new(center: RegionCoord, radius: i32) -> Self {
        Self {
            center,
            radius: radius.max(0),
        }
    }

    /// Whether `coord` lies inside the footprint.
    ///
    /// Pure integer comparison, so two footprints always agree on the
    /// boundary regardless of how the observer position was rounded.
    pub fn contains(&self, coord: RegionCoord) -> bool {
        (coord.x - self.center.x).abs() <= self.radius
            && (coord.z - self.center.z).abs() <= self.radius
    }

    /// Number of regions covered.
    pub fn len(&self) -> usize {
        let side = (2 * self.radius + 1) as usize;
        side * side
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// All covered regions, centre first, then ring by ring outward.
    pub fn regions(&self) -> Vec<RegionCoord> {
        let mut out = Vec::with_capacity(self.len());
        out.push(self.center);
        for ring in 1..=self.radius {
            let (cx, cz) = (self.center.x, self.center.z);
            // Top and bottom rows, full width.
            for dx in -ring..=ring {
                out.push(RegionCoord::new(cx + dx, cz - ring));
                out.push(RegionCoord::new(cx + dx, cz + ring));
            }
            // Left and right columns, without the corners already pushed.
            for dz in (-ring + 1)..ring {
                out.push(RegionCoord::new(cx - ring, cz + dz));
                out.push(RegionCoord::new(cx + ring, cz + dz));
            }
        }
        out
    }

    /// Regions covered by `self` but not by `other`, closest to the centre first.
    pub fn difference(&self, other: &Footprint) -> Vec<RegionCoord> {
        self.regions()
            .into_iter()
            .filter(|c| !other.contains(*c))
            .collect()
    }
}

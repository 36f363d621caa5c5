use crate::spatial::{CellPos, REGION_CELLS, REGION_SIZE, RegionCoord, SECTION_COUNT, SECTION_HEIGHT};

/// State id of an empty cell.
pub const AIR: u16 = 0;

/// Bitset over the vertical sections of a region (bit `i` = section `i`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SectionMask(pub u16);

impl SectionMask {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(u16::MAX);

    pub fn insert(&mut self, section: usize) {
        debug_assert!(section < SECTION_COUNT);
        self.0 |= 1 << section;
    }

    pub fn contains(self, section: usize) -> bool {
        section < SECTION_COUNT && self.0 & (1 << section) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Set sections in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..SECTION_COUNT).filter(move |s| self.contains(*s))
    }
}

/// Cell contents of one region, as produced by a region store.
///
/// Cells are opaque `u16` state ids; what they mean belongs to the world
/// rules, not to streaming.
#[derive(Clone, PartialEq, Eq)]
pub struct Region {
    coord: RegionCoord,
    cells: Box<[u16]>,
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("coord", &self.coord)
            .field("sections", &self.non_empty_sections())
            .finish()
    }
}

impl Region {
    /// An all-air region.
    pub fn empty(coord: RegionCoord) -> Self {
        Self {
            coord,
            cells: vec![AIR; REGION_CELLS].into_boxed_slice(),
        }
    }

    /// A region filled with `state` up to (excluding) `height`, air above.
    pub fn layered(coord: RegionCoord, state: u16, height: u8) -> Self {
        let mut region = Self::empty(coord);
        let layer = (REGION_SIZE * REGION_SIZE) as usize;
        region.cells[..usize::from(height) * layer].fill(state);
        region
    }

    pub fn coord(&self) -> RegionCoord {
        self.coord
    }

    pub fn get(&self, pos: CellPos) -> u16 {
        self.cells[pos.index()]
    }

    /// Overwrite a cell. Returns the previous state.
    pub fn set(&mut self, pos: CellPos, state: u16) -> u16 {
        std::mem::replace(&mut self.cells[pos.index()], state)
    }

    /// All cells of one section, in index order.
    pub fn section(&self, section: usize) -> &[u16] {
        let len = (REGION_SIZE * REGION_SIZE * SECTION_HEIGHT) as usize;
        &self.cells[section * len..(section + 1) * len]
    }

    /// Sections holding at least one non-air cell.
    pub fn non_empty_sections(&self) -> SectionMask {
        let mut mask = SectionMask::EMPTY;
        for s in 0..SECTION_COUNT {
            if self.section(s).iter().any(|c| *c != AIR) {
                mask.insert(s);
            }
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_region_has_no_sections() {
        let r = Region::empty(RegionCoord::new(0, 0));
        assert!(r.non_empty_sections().is_empty());
        assert_eq!(r.get(CellPos::new(3, 3, 3)), AIR);
    }

    #[test]
    fn layered_region_fills_lower_sections() {
        let r = Region::layered(RegionCoord::new(1, 2), 5, 40);
        assert_eq!(r.get(CellPos::new(0, 39, 0)), 5);
        assert_eq!(r.get(CellPos::new(0, 40, 0)), AIR);
        let mask = r.non_empty_sections();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn set_returns_previous_state() {
        let mut r = Region::empty(RegionCoord::new(0, 0));
        let pos = CellPos::new(15, 255, 15);
        assert_eq!(r.set(pos, 9), AIR);
        assert_eq!(r.set(pos, 4), 9);
        assert!(r.non_empty_sections().contains(15));
    }

    #[test]
    fn section_mask_bits() {
        let mut m = SectionMask::EMPTY;
        m.insert(0);
        m.insert(15);
        assert_eq!(m.count(), 2);
        assert!(m.contains(15));
        assert!(!m.contains(16));
        assert_eq!(SectionMask::ALL.count(), 16);
    }
}

use std::collections::{BTreeSet, HashSet};

use crate::region::SectionMask;
use crate::spatial::CellPos;

/// Changes kept in the fixed inline buffer before spilling.
pub const INLINE_CAPACITY: usize = 64;

/// How a region's pending changes go out on flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPlan {
    Nothing,
    /// Exactly one cell changed.
    Single(CellPos),
    /// A handful of cells, sent individually addressed.
    Batch,
    /// Too many changes; resend these sections whole.
    Full(SectionMask),
}

/// Cell changes recorded for one region since its last flush.
///
/// Each cell appears at most once per flush cycle. The first
/// `INLINE_CAPACITY` changes live in a fixed array, the rest in an
/// overflow set keyed by packed coordinate. A membership set makes repeated
/// marks of the same cell constant time.
#[derive(Debug, Clone)]
pub struct PendingDiff {
    inline: [u16; INLINE_CAPACITY],
    len: usize,
    overflow: BTreeSet<u16>,
    members: HashSet<u16>,
    sections: SectionMask,
}

impl Default for PendingDiff {
    fn default() -> Self {
        Self {
            inline: [0; INLINE_CAPACITY],
            len: 0,
            overflow: BTreeSet::new(),
            members: HashSet::new(),
            sections: SectionMask::EMPTY,
        }
    }
}

impl PendingDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change. Returns `false` if the cell was already pending.
    pub fn record(&mut self, cell: CellPos) -> bool {
        let packed = cell.pack();
        if !self.members.insert(packed) {
            return false;
        }
        if self.len < INLINE_CAPACITY {
            self.inline[self.len] = packed;
            self.len += 1;
        } else {
            self.overflow.insert(packed);
        }
        self.sections.insert(cell.section());
        true
    }

    /// Number of distinct pending cells.
    pub fn len(&self) -> usize {
        self.len + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sections touched by pending changes.
    pub fn sections(&self) -> SectionMask {
        self.sections
    }

    /// Pending cells, inline buffer first, then overflow in packed order.
    pub fn cells(&self) -> impl Iterator<Item = CellPos> + '_ {
        self.inline[..self.len]
            .iter()
            .chain(self.overflow.iter())
            .map(|p| CellPos::unpack(*p))
    }

    /// Decide how to send the pending changes given the clumping threshold.
    pub fn plan(&self, clumping_threshold: usize) -> FlushPlan {
        match self.len() {
            0 => FlushPlan::Nothing,
            1 => FlushPlan::Single(CellPos::unpack(self.inline[0])),
            n if n < clumping_threshold => FlushPlan::Batch,
            _ => FlushPlan::Full(self.sections),
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.overflow.clear();
        self.members.clear();
        self.sections = SectionMask::EMPTY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(i: u16) -> CellPos {
        CellPos::new((i % 16) as u8, (i / 256) as u8, ((i / 16) % 16) as u8)
    }

    #[test]
    fn duplicate_marks_are_recorded_once() {
        let mut diff = PendingDiff::new();
        let c = CellPos::new(1, 70, 2);
        assert!(diff.record(c));
        for _ in 0..10 {
            assert!(!diff.record(c));
        }
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.plan(64), FlushPlan::Single(c));
    }

    #[test]
    fn spills_into_overflow_without_duplicates() {
        let mut diff = PendingDiff::new();
        for i in 0..100 {
            assert!(diff.record(cell(i)));
        }
        for i in 0..100 {
            assert!(!diff.record(cell(i)));
        }
        assert_eq!(diff.len(), 100);
        let cells: BTreeSet<CellPos> = diff.cells().collect();
        assert_eq!(cells.len(), 100);
    }

    #[test]
    fn repeated_marks_after_clear_are_new_again() {
        let mut diff = PendingDiff::new();
        for i in 0..70 {
            diff.record(cell(i));
        }
        diff.clear();
        // Same cells, in both the inline and the overflow range.
        assert!(diff.record(cell(3)));
        assert!(diff.record(cell(66)));
        assert!(!diff.record(cell(66)));
        assert_eq!(diff.len(), 2);
        assert_eq!(diff.cells().collect::<Vec<_>>(), vec![cell(3), cell(66)]);
    }

    #[test]
    fn plan_switches_to_full_at_threshold() {
        let mut diff = PendingDiff::new();
        for i in 0..63 {
            diff.record(cell(i));
        }
        assert_eq!(diff.plan(64), FlushPlan::Batch);
        diff.record(cell(63));
        assert!(matches!(diff.plan(64), FlushPlan::Full(_)));
    }

    #[test]
    fn full_plan_carries_touched_sections() {
        let mut diff = PendingDiff::new();
        for i in 0..70u16 {
            diff.record(CellPos::new((i % 16) as u8, if i < 35 { 5 } else { 200 }, (i / 16) as u8));
        }
        match diff.plan(64) {
            FlushPlan::Full(mask) => assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 12]),
            other => panic!("expected full resend, got {other:?}"),
        }
    }

    #[test]
    fn clear_resets_everything() {
        let mut diff = PendingDiff::new();
        for i in 0..80 {
            diff.record(cell(i));
        }
        diff.clear();
        assert!(diff.is_empty());
        assert_eq!(diff.len(), 0);
        assert!(diff.sections().is_empty());
        assert_eq!(diff.plan(64), FlushPlan::Nothing);
        assert!(diff.record(cell(0)));
    }
}

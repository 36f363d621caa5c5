use std::collections::BTreeSet;

use crate::codec::RegionCodec;
use crate::diff::{FlushPlan, PendingDiff};
use crate::error::StreamError;
use crate::loader::{LoadPoll, LoadTicket};
use crate::observer::{ObserverId, UpdateMessage};
use crate::region::Region;
use crate::spatial::{CellPos, RegionCoord};
use crate::store::LoadKind;

/// Where a region is in its load lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Waiting for a synchronous load in the tick.
    Idle,
    /// A load job is running on the worker pool, or a synchronous load is
    /// in progress.
    Loading,
    /// A generation job is running on the worker pool.
    Generating,
    /// Region contents are available.
    Ready,
}

/// Per-region streaming state: who watches it, whether it is loaded, and
/// what changed since the last flush.
#[derive(Debug)]
pub struct RegionWatchEntry {
    coord: RegionCoord,
    observers: BTreeSet<ObserverId>,
    state: LoadState,
    region: Option<Region>,
    ticket: Option<LoadTicket>,
    pending: PendingDiff,
    /// Cell changes that arrived before the contents did.
    held: Vec<(CellPos, u16)>,
    sent: bool,
    retried: bool,
}

impl RegionWatchEntry {
    pub fn new(coord: RegionCoord) -> Self {
        Self {
            coord,
            observers: BTreeSet::new(),
            state: LoadState::Idle,
            region: None,
            ticket: None,
            pending: PendingDiff::new(),
            held: Vec::new(),
            sent: false,
            retried: false,
        }
    }

    pub fn coord(&self) -> RegionCoord {
        self.coord
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    pub fn region_mut(&mut self) -> Option<&mut Region> {
        self.region.as_mut()
    }

    /// Observers in id order.
    pub fn observers(&self) -> impl Iterator<Item = ObserverId> + '_ {
        self.observers.iter().copied()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn has_observer(&self, id: ObserverId) -> bool {
        self.observers.contains(&id)
    }

    /// Whether the full region has gone out to the current observers.
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn has_in_flight(&self) -> bool {
        self.ticket.is_some()
    }

    pub fn pending(&self) -> &PendingDiff {
        &self.pending
    }

    /// Returns `false` if the observer was already present.
    pub fn add_observer(&mut self, id: ObserverId) -> bool {
        self.observers.insert(id)
    }

    /// Returns `false` if the observer was not present.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove(&id)
    }

    /// Record a changed cell. Returns `true` only for the first change since
    /// the last flush, which is when the entry needs scheduling.
    pub fn mark_dirty(&mut self, cell: CellPos) -> bool {
        let was_clean = self.pending.is_empty();
        self.pending.record(cell) && was_clean
    }

    /// Keep a cell change for a region that is not loaded yet. Held changes
    /// are written into the contents on `complete`, in arrival order.
    pub fn hold_edit(&mut self, cell: CellPos, state: u16) {
        self.held.push((cell, state));
    }

    pub fn held_edits(&self) -> usize {
        self.held.len()
    }

    /// Attach a worker-pool ticket.
    pub fn begin_async(&mut self, ticket: LoadTicket) {
        self.state = match ticket.kind() {
            LoadKind::Load => LoadState::Loading,
            LoadKind::Generate => LoadState::Generating,
        };
        self.ticket = Some(ticket);
    }

    /// Mark a synchronous load as started.
    pub fn begin_sync(&mut self) {
        self.state = LoadState::Loading;
    }

    /// Poll the attached ticket. `None` while pending or with no ticket.
    pub fn poll_ticket(&mut self) -> Option<Result<Region, StreamError>> {
        let ticket = self.ticket.as_mut()?;
        let outcome = match ticket.poll() {
            LoadPoll::Pending => return None,
            LoadPoll::Ready(region) => Ok(region),
            LoadPoll::Failed(err) => Err(err),
        };
        self.ticket = None;
        Some(outcome)
    }

    /// Cancel any in-flight job. Its result will be discarded.
    pub fn cancel_ticket(&mut self) -> bool {
        match self.ticket.take() {
            Some(ticket) => {
                ticket.cancel();
                if self.state != LoadState::Ready {
                    self.state = LoadState::Idle;
                }
                true
            }
            None => false,
        }
    }

    /// Install loaded contents, replaying held changes on top.
    pub fn complete(&mut self, mut region: Region) {
        debug_assert_eq!(region.coord(), self.coord);
        for (cell, state) in self.held.drain(..) {
            region.set(cell, state);
        }
        self.region = Some(region);
        self.state = LoadState::Ready;
    }

    /// Consume the single automatic retry. Returns `false` if already used.
    pub fn take_retry(&mut self) -> bool {
        !std::mem::replace(&mut self.retried, true)
    }

    /// Full region message for first send or for late joiners.
    pub fn full_message(&self, codec: &dyn RegionCodec) -> Option<UpdateMessage> {
        let region = self.region.as_ref()?;
        Some(codec.encode_full(region, region.non_empty_sections()))
    }

    pub fn mark_sent(&mut self) {
        self.sent = true;
        // Anything pending is already part of the full region just sent.
        self.pending.clear();
    }

    /// Turn pending changes into one message and clear them.
    ///
    /// Nothing is produced before the first full send, since that send
    /// already reflects every change.
    pub fn flush(
        &mut self,
        clumping_threshold: usize,
        codec: &dyn RegionCodec,
        scratch: &mut Vec<CellPos>,
    ) -> (FlushPlan, Option<UpdateMessage>) {
        let plan = self.pending.plan(clumping_threshold);
        let msg = match (&self.region, self.sent) {
            (Some(region), true) => match plan {
                FlushPlan::Nothing => None,
                FlushPlan::Single(cell) => Some(codec.encode_diff(region, &[cell])),
                FlushPlan::Batch => {
                    scratch.clear();
                    scratch.extend(self.pending.cells());
                    Some(codec.encode_diff(region, scratch))
                }
                FlushPlan::Full(sections) => Some(codec.encode_full(region, sections)),
            },
            _ => None,
        };
        self.pending.clear();
        (plan, msg)
    }
}

//! Codec seams: turning regions and entity changes into update messages.
//!
//! The wire format belongs to the presentation layer. `JsonCodec` is a
//! readable reference implementation used by the server binary and tests.

use serde::Serialize;
use worldspace_common::EntityId;
use worldspace_kernel::EntityData;

use crate::observer::{MessageKind, UpdateMessage};
use crate::region::{Region, SectionMask};
use crate::spatial::{CellPos, RegionCoord};
use crate::tracker::{EntityDelta, Movement};

/// Serializes region state for observers.
pub trait RegionCodec: Send + Sync {
    /// Full contents of the given sections.
    fn encode_full(&self, region: &Region, sections: SectionMask) -> UpdateMessage;
    /// Current state of the listed cells. One cell is a single-cell update.
    fn encode_diff(&self, region: &Region, cells: &[CellPos]) -> UpdateMessage;
    /// Tell the observer to forget a region.
    fn encode_unload(&self, coord: RegionCoord) -> UpdateMessage;
}

/// Serializes entity spawns, deltas, and removals for observers.
pub trait EntityCodec: Send + Sync {
    fn encode_spawn(&self, id: EntityId, entity: &EntityData) -> UpdateMessage;
    fn encode_delta(&self, id: EntityId, delta: &EntityDelta) -> UpdateMessage;
    fn encode_remove(&self, id: EntityId) -> UpdateMessage;
}

#[derive(Serialize)]
struct SectionRuns {
    section: usize,
    /// `(state, run length)` pairs in cell index order.
    runs: Vec<(u16, u16)>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame<'a> {
    RegionFull {
        coord: RegionCoord,
        sections: Vec<SectionRuns>,
    },
    RegionCells {
        coord: RegionCoord,
        cells: Vec<(u16, u16)>,
    },
    RegionUnload {
        coord: RegionCoord,
    },
    EntitySpawn {
        id: EntityId,
        entity: &'a EntityData,
    },
    EntityDelta {
        id: EntityId,
        movement: &'a Movement,
        velocity: Option<[f32; 3]>,
    },
    EntityRemove {
        id: EntityId,
    },
}

/// Human-readable JSON frames, one per message.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    fn encode(kind: MessageKind, frame: &Frame<'_>) -> UpdateMessage {
        let payload = serde_json::to_vec(frame).unwrap_or_else(|err| {
            tracing::error!(%err, ?kind, "failed to encode update frame");
            Vec::new()
        });
        UpdateMessage::new(kind, payload)
    }
}

fn run_length(cells: &[u16]) -> Vec<(u16, u16)> {
    let mut runs: Vec<(u16, u16)> = Vec::new();
    for &state in cells {
        match runs.last_mut() {
            Some((last, len)) if *last == state && *len < u16::MAX => *len += 1,
            _ => runs.push((state, 1)),
        }
    }
    runs
}

impl RegionCodec for JsonCodec {
    fn encode_full(&self, region: &Region, sections: SectionMask) -> UpdateMessage {
        let sections = sections
            .iter()
            .map(|s| SectionRuns {
                section: s,
                runs: run_length(region.section(s)),
            })
            .collect();
        Self::encode(
            MessageKind::RegionFull,
            &Frame::RegionFull {
                coord: region.coord(),
                sections,
            },
        )
    }

    fn encode_diff(&self, region: &Region, cells: &[CellPos]) -> UpdateMessage {
        let kind = if cells.len() == 1 {
            MessageKind::RegionCell
        } else {
            MessageKind::RegionBatch
        };
        let cells = cells.iter().map(|c| (c.pack(), region.get(*c))).collect();
        Self::encode(
            kind,
            &Frame::RegionCells {
                coord: region.coord(),
                cells,
            },
        )
    }

    fn encode_unload(&self, coord: RegionCoord) -> UpdateMessage {
        Self::encode(MessageKind::RegionUnload, &Frame::RegionUnload { coord })
    }
}

impl EntityCodec for JsonCodec {
    fn encode_spawn(&self, id: EntityId, entity: &EntityData) -> UpdateMessage {
        Self::encode(MessageKind::EntitySpawn, &Frame::EntitySpawn { id, entity })
    }

    fn encode_delta(&self, id: EntityId, delta: &EntityDelta) -> UpdateMessage {
        Self::encode(
            MessageKind::EntityDelta,
            &Frame::EntityDelta {
                id,
                movement: &delta.movement,
                velocity: delta.velocity.map(|v| v.to_array()),
            },
        )
    }

    fn encode_remove(&self, id: EntityId) -> UpdateMessage {
        Self::encode(MessageKind::EntityRemove, &Frame::EntityRemove { id })
    }
}

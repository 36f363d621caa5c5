//! Shared value types for the worldspace engine.

mod types;

pub use types::{EntityId, EntityKind, Transform, WorldCell};

//! World Kernel: authoritative mobile-entity state and deterministic stepping.
//!
//! # Invariants
//! - All state mutations flow through explicit operations.
//! - Every mutation appends a `WorldEvent`; consumers drain the log once per tick.

pub mod world;

pub use world::{EntityData, Equipment, StatusEffect, World, WorldEvent};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::StreamError;
use crate::spatial::{REGION_SIZE, clamp_view_radius};

/// What `AsyncRegionLoader::submit` does when the job queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullQueuePolicy {
    /// Fail the submit with `StreamError::QueueFull`; the region is retried later.
    Reject,
    /// Block the simulation thread until a worker frees a slot.
    Block,
}

/// Worker pool sizing for background generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Worker threads, which is also the number of concurrent generations.
    pub workers: usize,
    /// Jobs that may wait in the queue.
    pub max_queued: usize,
    pub when_full: FullQueuePolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_queued: 64,
            when_full: FullQueuePolicy::Reject,
        }
    }
}

/// Server-wide view radius that shrinks when ticks run long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveRadius {
    pub enabled: bool,
    /// Average tick duration to stay under.
    pub target_tick_ms: u64,
    /// Never shrink below this radius.
    pub min_radius: i32,
    /// Ticks between adjustments.
    pub sample_ticks: u64,
}

impl Default for AdaptiveRadius {
    fn default() -> Self {
        Self {
            enabled: false,
            target_tick_ms: 50,
            min_radius: 3,
            sample_ticks: 20,
        }
    }
}

/// Streaming configuration: view radius, per-tick budgets, diff batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Largest view radius (in regions) any observer gets. Clamped to 3..=32.
    pub view_radius: i32,
    /// Maximum number of region loads/generations per tick.
    pub max_region_loads_per_tick: usize,
    /// Maximum number of first-time region sends per tick.
    pub max_region_sends_per_tick: usize,
    /// Wall-clock budget for draining the load and send queues.
    pub per_tick_time_budget_ms: u64,
    /// Pending changes at or above this count are sent as a full resend.
    pub diff_clumping_threshold: usize,
    /// Generate regions on the worker pool instead of inside the tick.
    pub async_generation_enabled: bool,
    /// Pending queues are re-sorted at most once every this many ticks.
    pub sort_interval_ticks: u64,
    /// Distance an observer must move before its footprint is recomputed.
    pub movement_threshold: f32,
    /// Ticks before a failed region is requested again.
    pub failure_retry_ticks: u64,
    /// Upper bound on entity visibility radius. Defaults to just inside the
    /// view radius.
    pub entity_tracking_cap: Option<f32>,
    pub loader: LoaderConfig,
    pub adaptive_radius: AdaptiveRadius,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            view_radius: 10,
            max_region_loads_per_tick: 32,
            max_region_sends_per_tick: 81,
            per_tick_time_budget_ms: 10,
            diff_clumping_threshold: 64,
            async_generation_enabled: false,
            sort_interval_ticks: 4,
            movement_threshold: 8.0,
            failure_retry_ticks: 100,
            entity_tracking_cap: None,
            loader: LoaderConfig::default(),
            adaptive_radius: AdaptiveRadius::default(),
        }
    }
}

impl StreamConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, StreamError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.validated())
    }

    /// Clamp every option into its supported range.
    pub fn validated(mut self) -> Self {
        self.view_radius = clamp_view_radius(self.view_radius);
        self.max_region_loads_per_tick = self.max_region_loads_per_tick.max(1);
        self.max_region_sends_per_tick = self.max_region_sends_per_tick.max(1);
        // Below 2 the single-cell path and the batch path collapse.
        self.diff_clumping_threshold = self.diff_clumping_threshold.max(2);
        self.sort_interval_ticks = self.sort_interval_ticks.max(1);
        self.movement_threshold = self.movement_threshold.max(0.0);
        self.loader.workers = self.loader.workers.max(1);
        self.loader.max_queued = self.loader.max_queued.max(1);
        self.adaptive_radius.min_radius = self.adaptive_radius.min_radius.clamp(0, self.view_radius);
        self.adaptive_radius.sample_ticks = self.adaptive_radius.sample_ticks.max(1);
        self
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.per_tick_time_budget_ms)
    }

    /// Effective cap on entity visibility radius, in world units.
    pub fn tracking_cap(&self) -> f32 {
        self.entity_tracking_cap
            .unwrap_or(((self.view_radius - 1) * REGION_SIZE) as f32)
    }
}

use crate::observer::ObserverId;
use crate::spatial::RegionCoord;

/// Error reported by a region store implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Errors from the streaming engine.
///
/// None of these stop the tick loop: failures are retried, cleaned up, or
/// logged and dropped by the component that observes them.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to load region {coord}: {source}")]
    LoadFailure {
        coord: RegionCoord,
        #[source]
        source: StoreError,
    },
    #[error("failed to generate region {coord}: {source}")]
    GenerationFailure {
        coord: RegionCoord,
        #[source]
        source: StoreError,
    },
    #[error("region loader queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },
    #[error("region loader has shut down")]
    LoaderShutdown,
    #[error("failed to spawn loader worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("observer {0} channel closed")]
    ObserverChannelFailure(ObserverId),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

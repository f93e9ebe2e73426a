// # Common Types and Traits
//
// Shared identifiers, the component lifecycle trait, and health-status enum
// used across every module in the substrate.

pub mod bounded_map;

pub use bounded_map::BoundedHashMap;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier for a change event emitted by a file watcher / change source.
pub type EventId = uuid::Uuid;

/// Identifier for a change fragment derived from parsing a `ChangeEvent`.
pub type FragmentId = uuid::Uuid;

/// Identifier for a queued task.
pub type TaskId = uuid::Uuid;

/// Identifier for a micro-batch processed by the `BatchProcessor`.
pub type BatchId = uuid::Uuid;

/// Monotonically increasing tag assigned to each batch for downstream
/// ordering/versioning.
pub type EpochId = u64;

/// Identifier for a long-running sync operation.
pub type OperationId = uuid::Uuid;

/// Ephemeral multi-agent session identifier (used verbatim as a key suffix
/// in the external key/value store, e.g. `session:<id>`).
pub type SessionId = String;

/// Milliseconds since the Unix epoch. Used instead of `SystemTime` on the
/// wire so values round-trip through the external store's JSON encoding.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Health status of a component, reported via `Component::health_check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Component is fully operational.
    Healthy,
    /// Component is operational but degraded (e.g. below min pool size).
    Degraded,
    /// Component is not operational.
    Unhealthy,
}

/// Base lifecycle trait implemented by every major component in the
/// substrate (`ConnectionPool`, `QueueManager`, `WorkerPool`,
/// `BatchProcessor`, `IngestionPipeline`, `SessionManager`,
/// `SynchronizationCoordinator`).
#[async_trait::async_trait]
pub trait Component: Send + Sync {
    /// Initialize the component's background tasks and resources.
    async fn initialize(&self) -> Result<()>;

    /// Shut the component down, releasing all resources on every exit path.
    async fn shutdown(&self) -> Result<()>;

    /// Report current health.
    fn health_check(&self) -> HealthStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}

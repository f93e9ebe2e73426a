// High-throughput ingestion and multi-agent session coordination substrate
// for a code-intelligence knowledge graph.
//
// Dataflow: a change event enters `IngestionPipeline`, is classified and
// enqueued in a `QueueManager`, dequeued by a `WorkerPool` handler, parsed
// into change fragments, queued again as entity/relationship/embedding
// tasks, and drained by `BatchProcessor` with idempotency and
// dependency-ordered writes through the external graph interface.
// Concurrently, `SessionManager` coordinates ephemeral multi-agent sessions
// through `SessionStore` over the same `ConnectionPool`, and
// `SynchronizationCoordinator` issues bulk sync cycles reusing the pipeline.

pub mod batch;
pub mod common;
pub mod config;
pub mod error;
pub mod external;
pub mod ingestion;
pub mod monitoring;
pub mod pool;
pub mod queue;
pub mod session;
pub mod sync;
pub mod worker;

pub use common::{Component, HealthStatus};
pub use config::IngestConfig;
pub use error::{IngestError, Result};

use std::sync::Arc;

/// Initializes structured logging. Call once from a binary or test harness
/// embedding this crate.
pub fn init_tracing() {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).with_level(true).init();
}

/// Wires the full substrate together from a root `IngestConfig` and a set of
/// external collaborators. Any collaborator left `None` runs that subsystem
/// in dry-run mode.
pub struct Substrate {
    pub pool: Arc<pool::ConnectionPool>,
    pub batch_processor: Arc<batch::BatchProcessor>,
    pub ingestion_pipeline: Arc<ingestion::IngestionPipeline>,
    pub session_manager: Arc<session::SessionManager>,
    pub session_analytics: Arc<session::SessionAnalytics>,
    pub sync_coordinator: Arc<sync::SynchronizationCoordinator>,
}

impl Substrate {
    pub async fn build(
        config: IngestConfig,
        connection_factory: Arc<dyn pool::ConnectionFactory>,
        parser: Arc<dyn external::Parser>,
        graph: Option<Arc<dyn external::GraphBackend>>,
    ) -> Result<Self> {
        let pool = pool::ConnectionPool::new(config.pool.clone(), connection_factory).await?;

        let batch_processor = Arc::new(batch::BatchProcessor::new(
            batch::BatchConfig {
                entity_batch_size: config.pipeline.batching.entity_batch_size,
                relationship_batch_size: config.pipeline.batching.relationship_batch_size,
                embedding_batch_size: config.pipeline.batching.embedding_batch_size,
                max_concurrent_batches: config.pipeline.batching.max_concurrent_batches,
                idempotency_key_ttl: std::time::Duration::from_millis(config.pipeline.batching.timeout_ms),
            },
            graph.clone(),
        ));

        let ingestion_pipeline = ingestion::IngestionPipeline::new(config.pipeline.clone(), parser.clone(), batch_processor.clone());

        let connection = pool.acquire(Some(pool::ConnectionRole::ReadWrite)).await?;
        let session_store = session::SessionStore::new(connection.connection().client.clone());
        let session_manager = Arc::new(session::SessionManager::new(session_store, config.session.clone(), graph.clone()));
        let session_analytics = Arc::new(session::SessionAnalytics::new(config.analytics.retention_days));

        let sync_coordinator = Arc::new(sync::SynchronizationCoordinator::new(
            parser,
            batch_processor.clone(),
            config.pipeline.batching.max_concurrent_batches,
            sync::ConflictResolution::Overwrite,
        ));

        Ok(Self { pool, batch_processor, ingestion_pipeline, session_manager, session_analytics, sync_coordinator })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InMemoryKeyValueStore, KeyValueStore, StubParser};
    use async_trait::async_trait;

    struct TestFactory;

    #[async_trait]
    impl pool::ConnectionFactory for TestFactory {
        async fn create(&self, _role: pool::ConnectionRole) -> Result<Arc<dyn KeyValueStore>> {
            Ok(Arc::new(InMemoryKeyValueStore::new()))
        }
    }

    #[tokio::test]
    async fn substrate_builds_in_dry_run_mode() {
        let substrate = Substrate::build(IngestConfig::default(), Arc::new(TestFactory), Arc::new(StubParser), None).await.unwrap();
        assert_eq!(substrate.sync_coordinator.get_queue_length(), 0);
    }
}

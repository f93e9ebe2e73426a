// Integration tests exercising the seed scenarios of spec §8 against the
// in-memory fakes of the external collaborators.

use codegraph_substrate::batch::{BatchConfig, BatchProcessor};
use codegraph_substrate::external::{InMemoryGraphBackend, InMemoryKeyValueStore, StubParser};
use codegraph_substrate::pool::{ConnectionFactory, ConnectionPool, ConnectionRole, PoolConfig};
use codegraph_substrate::queue::{PartitionStrategy, QueueManager, TaskPayload};
use codegraph_substrate::session::{EmitEventOpts, SessionEventType, SessionManager, SessionStore};
use codegraph_substrate::sync::{ConflictResolution, FullSyncOpts, SyncEvent, SyncStatus, SynchronizationCoordinator};
use codegraph_substrate::{Result, IngestConfig};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct InMemoryFactory {
    store: Arc<InMemoryKeyValueStore>,
}

#[async_trait]
impl ConnectionFactory for InMemoryFactory {
    async fn create(&self, _role: ConnectionRole) -> Result<Arc<dyn codegraph_substrate::external::KeyValueStore>> {
        Ok(self.store.clone())
    }
}

async fn pool() -> Arc<ConnectionPool> {
    let factory = Arc::new(InMemoryFactory { store: Arc::new(InMemoryKeyValueStore::new()) });
    ConnectionPool::new(PoolConfig::default(), factory).await.unwrap()
}

// Scenario 1: full sync of three files completes with monotonic progress.
#[tokio::test]
async fn full_sync_of_three_files() {
    let batch_processor = Arc::new(BatchProcessor::new(BatchConfig::default(), Some(Arc::new(InMemoryGraphBackend::new()))));
    let coordinator = Arc::new(SynchronizationCoordinator::new(Arc::new(StubParser), batch_processor, 4, ConflictResolution::Overwrite));
    let mut rx = coordinator.subscribe();

    let id = coordinator.start_full_sync(FullSyncOpts {
        files: vec!["test-class.ts".into(), "test-interface.ts".into(), "test-function.js".into()],
        rollback_on_error: false,
    });

    let mut last_progress = 0.0;
    let mut completed = false;
    for _ in 0..50 {
        match tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            Ok(Ok(SyncEvent::Progress { progress, .. })) => {
                assert!(progress.progress >= last_progress, "progress must be monotonic");
                last_progress = progress.progress;
            }
            Ok(Ok(SyncEvent::OperationCompleted { .. })) => {
                completed = true;
                break;
            }
            _ => break,
        }
    }

    assert!(completed);
    let op = coordinator.get_operation(id).unwrap();
    assert_eq!(op.status, SyncStatus::Completed);
    assert_eq!(op.counters.files_processed, 3);
    assert!(op.counters.entities_created >= 3);
    assert!(op.counters.relationships_created >= 2);
}

// Scenario 4: session lifecycle with auto-checkpoint and anchors.
#[tokio::test]
async fn session_lifecycle_auto_checkpoints_on_tenth_event() {
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let graph = Arc::new(InMemoryGraphBackend::new());
    let manager = SessionManager::new(SessionStore::new(kv), IngestConfig::default().session, Some(graph.clone()));

    let session_id = manager.create_session("agentA").await.unwrap();
    for i in 0..9 {
        manager
            .emit_event(&session_id, SessionEventType::Generic, json!({"entityId": format!("e{i}")}), "agentA", EmitEventOpts::default())
            .await
            .unwrap();
    }
    manager
        .emit_event(&session_id, SessionEventType::Generic, json!({"entityId": "e9"}), "agentA", EmitEventOpts::default())
        .await
        .unwrap();

    assert!(!graph.anchors_for("e9").is_empty(), "checkpoint must anchor touched entities");

    manager.leave_session(&session_id, "agentA").await.unwrap();
    let doc = manager.get_session(&session_id).await.unwrap();
    assert!(doc.agent_ids.is_empty());
}

// Scenario 5: backpressure at threshold 100.
#[tokio::test]
async fn backpressure_rejects_at_threshold_then_recovers() {
    let qm = QueueManager::new(4, PartitionStrategy::Hash, 10_000, 100);
    for i in 0..100 {
        qm.enqueue(TaskPayload::new("parse", 5, json!({"i": i})), Some(&format!("k{i}"))).unwrap();
    }

    let err = qm.enqueue(TaskPayload::new("parse", 5, json!({})), Some("overflow")).unwrap_err();
    assert_eq!(err.code(), "QueueOverflow");

    for partition in 0..4 {
        qm.dequeue(partition, 3);
    }
    assert!(qm.enqueue(TaskPayload::new("parse", 5, json!({})), Some("after-drain")).is_ok());
}

// Scenario 6: batch idempotency for a 50-entity batch.
#[tokio::test]
async fn batch_idempotency_for_fifty_entities() {
    use codegraph_substrate::external::GraphItem;

    let graph = Arc::new(InMemoryGraphBackend::new());
    let processor = BatchProcessor::new(BatchConfig::default(), Some(graph.clone()));
    let items: Vec<GraphItem> = (0..50).map(|i| GraphItem { id: format!("e{i}"), item_type: "entity".into(), data: json!({}) }).collect();

    let first = processor.process_entities(items.clone(), None).await.unwrap();
    let second = processor.process_entities(items, None).await.unwrap();

    assert_eq!(first.processed_count, 50);
    assert_eq!(second.processed_count, 50);
    assert_eq!(graph.entity_count(), 50);
}

// Pool capacity invariant: connections never exceed max, even under
// concurrent acquisition.
#[tokio::test]
async fn pool_capacity_never_exceeds_max_under_contention() {
    let pool = pool().await;
    let mut guards = Vec::new();
    for _ in 0..2 {
        guards.push(pool.acquire(None).await.unwrap());
    }
    assert!(pool.stats().total <= PoolConfig::default().max_connections);
}

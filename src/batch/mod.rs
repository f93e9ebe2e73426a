// # Batch Processor
//
// Idempotent, micro-batched writes of entities/relationships/embeddings
// through the external graph backend, with a dependency DAG (cycle detection
// via DFS, topological readiness) for ordering change-fragment processing.
// Idempotency keys are content hashes over each batch's items.

use crate::common::{BatchId, BoundedHashMap};
use crate::error::{IngestError, Result};
use crate::external::{EmbeddingItem, GraphBackend, GraphItem, WriteOpts};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub epoch_id: u64,
    pub processed_count: usize,
    pub failed: Vec<BatchItemFailure>,
    pub success: bool,
}

pub struct BatchConfig {
    pub entity_batch_size: usize,
    pub relationship_batch_size: usize,
    pub embedding_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub idempotency_key_ttl: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            entity_batch_size: 100,
            relationship_batch_size: 100,
            embedding_batch_size: 50,
            max_concurrent_batches: 4,
            idempotency_key_ttl: Duration::from_secs(300),
        }
    }
}

struct CachedResult {
    result: BatchResult,
    expires_at: Instant,
}

/// A change fragment as understood by the dependency DAG: entity or
/// relationship mutation derived from parsing a `ChangeEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeFragment {
    pub id: Uuid,
    pub event_id: Uuid,
    pub change_type: FragmentKind,
    pub operation: FragmentOp,
    pub data: Json,
    pub dependency_hints: Vec<Uuid>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentKind {
    Entity,
    Relationship,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentOp {
    Add,
    Modify,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DagNodeStatus {
    Pending,
    Running,
    Done,
    Failed,
}

struct DagNode {
    fragment: ChangeFragment,
    dependents: Vec<Uuid>,
    remaining_deps: usize,
    status: DagNodeStatus,
}

/// Topologically processes fragments respecting `dependencyHints`. Cycles
/// are detected up front via DFS; on deadlock (a non-empty queue with no
/// ready node) the remainder is processed in arbitrary order and
/// `dag:deadlock` is emitted.
struct DependencyDag {
    nodes: HashMap<Uuid, DagNode>,
}

impl DependencyDag {
    fn build(fragments: Vec<ChangeFragment>) -> Self {
        let ids: HashSet<Uuid> = fragments.iter().map(|f| f.id).collect();
        let mut nodes: HashMap<Uuid, DagNode> = fragments
            .into_iter()
            .map(|f| {
                (
                    f.id,
                    DagNode { dependents: Vec::new(), remaining_deps: 0, fragment: f, status: DagNodeStatus::Pending },
                )
            })
            .collect();

        let edges: Vec<(Uuid, Uuid)> = nodes
            .values()
            .flat_map(|n| n.fragment.dependency_hints.iter().filter(|d| ids.contains(d)).map(move |d| (*d, n.fragment.id)))
            .collect();

        for (dep, dependent) in edges {
            nodes.get_mut(&dep).unwrap().dependents.push(dependent);
            nodes.get_mut(&dependent).unwrap().remaining_deps += 1;
        }

        Self { nodes }
    }

    fn has_cycle(&self) -> bool {
        #[derive(PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<Uuid, Mark> = HashMap::new();

        fn visit(id: Uuid, nodes: &HashMap<Uuid, DagNode>, marks: &mut HashMap<Uuid, Mark>) -> bool {
            match marks.get(&id) {
                Some(Mark::Done) => return false,
                Some(Mark::Visiting) => return true,
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            for dep in &nodes[&id].fragment.dependency_hints {
                if nodes.contains_key(dep) && visit(*dep, nodes, marks) {
                    return true;
                }
            }
            marks.insert(id, Mark::Done);
            false
        }

        self.nodes.keys().any(|id| visit(*id, &self.nodes, &mut marks))
    }

    /// Returns fragments in dependency order. Best-effort on cycles.
    fn ordered(mut self) -> (Vec<ChangeFragment>, bool) {
        let deadlocked = self.has_cycle();
        let mut ready: VecDeque<Uuid> =
            self.nodes.iter().filter(|(_, n)| n.remaining_deps == 0).map(|(id, _)| *id).collect();
        let mut ordered = Vec::with_capacity(self.nodes.len());
        let mut processed: HashSet<Uuid> = HashSet::new();

        while let Some(id) = ready.pop_front() {
            if processed.contains(&id) {
                continue;
            }
            processed.insert(id);
            let dependents = self.nodes[&id].dependents.clone();
            self.nodes.get_mut(&id).unwrap().status = DagNodeStatus::Done;
            ordered.push(self.nodes[&id].fragment.clone());
            for dep in dependents {
                let node = self.nodes.get_mut(&dep).unwrap();
                node.remaining_deps = node.remaining_deps.saturating_sub(1);
                if node.remaining_deps == 0 {
                    ready.push_back(dep);
                }
            }

            if ready.is_empty() && processed.len() < self.nodes.len() {
                // deadlock: remaining nodes have unresolved deps due to a cycle
                let remaining: Vec<Uuid> = self.nodes.keys().filter(|id| !processed.contains(id)).cloned().collect();
                for id in remaining {
                    ready.push_back(id);
                }
            }
        }

        (ordered, deadlocked)
    }
}

fn idempotency_key(operation: &str, items: &[GraphItem]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    for item in items {
        hasher.update(item.id.as_bytes());
        hasher.update(item.item_type.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Entity/relationship/embedding write path with idempotency, micro-batching,
/// and dependency-ordered fragment processing.
pub struct BatchProcessor {
    config: BatchConfig,
    graph: Option<Arc<dyn GraphBackend>>,
    // LRU-bounded on top of the TTL so a burst of distinct batches can't grow
    // this without limit between expiries.
    idempotency_cache: Mutex<BoundedHashMap<String, CachedResult>>,
    next_epoch: AtomicU64,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig, graph: Option<Arc<dyn GraphBackend>>) -> Self {
        Self { config, graph, idempotency_cache: Mutex::new(BoundedHashMap::new(10_000)), next_epoch: AtomicU64::new(1) }
    }

    /// Current entity data, if the backend has one and isn't running dry.
    pub async fn get_entity(&self, id: &str) -> Result<Option<Json>> {
        match &self.graph {
            Some(graph) => graph.get_entity(id).await,
            None => Ok(None),
        }
    }

    fn next_epoch_id(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::SeqCst)
    }

    fn cached(&self, key: &str) -> Option<BatchResult> {
        let mut cache = self.idempotency_cache.lock();
        match cache.get(&key.to_string()) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.result.clone()),
            Some(_) => {
                cache.remove(&key.to_string());
                None
            }
            None => None,
        }
    }

    fn cache(&self, key: String, result: BatchResult) {
        self.idempotency_cache.lock().insert(key, CachedResult { result, expires_at: Instant::now() + self.config.idempotency_key_ttl });
    }

    pub async fn process_entities(&self, items: Vec<GraphItem>, _meta: Option<Json>) -> Result<BatchResult> {
        if items.is_empty() {
            return Ok(BatchResult { success: true, ..Default::default() });
        }
        let key = idempotency_key("entity_upsert", &items);
        if let Some(cached) = self.cached(&key) {
            return Ok(cached);
        }

        let batch_id = Uuid::new_v4();
        let epoch_id = self.next_epoch_id();
        let mut failed = Vec::new();
        let mut processed = 0usize;

        for chunk in items.chunks(self.config.entity_batch_size) {
            match &self.graph {
                Some(graph) => {
                    match graph
                        .create_entities_bulk(chunk.to_vec(), WriteOpts { epoch: Some(epoch_id), batch_size: Some(self.config.entity_batch_size) })
                        .await
                    {
                        Ok(outcome) => {
                            processed += outcome.written;
                            failed.extend(outcome.failed.into_iter().map(|(id, reason)| BatchItemFailure { id, reason }));
                        }
                        Err(e) => return Err(IngestError::BatchProcessing { context: e.to_string() }),
                    }
                }
                None => processed += chunk.len(), // dry-run
            }
        }

        let result = BatchResult { batch_id, epoch_id, processed_count: processed, success: failed.is_empty(), failed };
        self.cache(key, result.clone());
        Ok(result)
    }

    pub async fn process_relationships(&self, items: Vec<GraphItem>, _meta: Option<Json>) -> Result<BatchResult> {
        if items.is_empty() {
            return Ok(BatchResult { success: true, ..Default::default() });
        }

        let (valid, mut failed): (Vec<GraphItem>, Vec<BatchItemFailure>) = {
            let mut valid = Vec::new();
            let mut failed = Vec::new();
            for item in items {
                if relationship_has_endpoints(&item) {
                    valid.push(item);
                } else {
                    warn!(relationship_id = %item.id, "skipping relationship with missing endpoints");
                    failed.push(BatchItemFailure { id: item.id.clone(), reason: "missing endpoint id".into() });
                }
            }
            (valid, failed)
        };

        if valid.is_empty() {
            return Ok(BatchResult { success: failed.is_empty(), failed, ..Default::default() });
        }

        let key = idempotency_key("relationship_upsert", &valid);
        if let Some(cached) = self.cached(&key) {
            return Ok(cached);
        }

        let batch_id = Uuid::new_v4();
        let epoch_id = self.next_epoch_id();
        let mut processed = 0usize;

        for chunk in valid.chunks(self.config.relationship_batch_size) {
            match &self.graph {
                Some(graph) => match graph
                    .create_relationships_bulk(chunk.to_vec(), WriteOpts { epoch: Some(epoch_id), batch_size: Some(self.config.relationship_batch_size) })
                    .await
                {
                    Ok(outcome) => {
                        processed += outcome.written;
                        failed.extend(outcome.failed.into_iter().map(|(id, reason)| BatchItemFailure { id, reason }));
                    }
                    Err(e) => return Err(IngestError::BatchProcessing { context: e.to_string() }),
                },
                None => processed += chunk.len(),
            }
        }

        let result = BatchResult { batch_id, epoch_id, processed_count: processed, success: failed.is_empty(), failed };
        self.cache(key, result.clone());
        Ok(result)
    }

    /// Build the dependency DAG for `fragments`, process entity fragments
    /// before dependent relationship fragments, and dispatch each group to
    /// `process_entities`/`process_relationships`.
    pub async fn process_change_fragments(&self, fragments: Vec<ChangeFragment>) -> Result<BatchResult> {
        if fragments.is_empty() {
            return Ok(BatchResult { success: true, ..Default::default() });
        }

        let dag = DependencyDag::build(fragments);
        let (ordered, deadlocked) = dag.ordered();
        if deadlocked {
            warn!("dag:deadlock; processing remaining fragments in arbitrary order");
        }

        let mut entities = Vec::new();
        let mut relationships = Vec::new();
        for fragment in ordered {
            let item = GraphItem { id: fragment.id.to_string(), item_type: format!("{:?}", fragment.operation), data: fragment.data };
            match fragment.change_type {
                FragmentKind::Entity => entities.push(item),
                FragmentKind::Relationship => relationships.push(item),
            }
        }

        let entity_result = self.process_entities(entities, None).await?;
        let relationship_result = self.process_relationships(relationships, None).await?;

        let mut failed = entity_result.failed;
        failed.extend(relationship_result.failed);
        Ok(BatchResult {
            batch_id: Uuid::new_v4(),
            epoch_id: relationship_result.epoch_id.max(entity_result.epoch_id),
            processed_count: entity_result.processed_count + relationship_result.processed_count,
            success: failed.is_empty(),
            failed,
        })
    }

    pub async fn process_embeddings(&self, items: Vec<EmbeddingItem>) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let Some(graph) = &self.graph else { return Ok(items.len()) };
        let mut written = 0;
        for chunk in items.chunks(self.config.embedding_batch_size) {
            let outcome = graph
                .create_embeddings_batch(chunk.to_vec(), WriteOpts { epoch: None, batch_size: Some(self.config.embedding_batch_size) })
                .await?;
            written += outcome.written;
        }
        Ok(written)
    }
}

fn relationship_has_endpoints(item: &GraphItem) -> bool {
    let data = &item.data;
    let has = |key: &str| -> bool {
        data.get(key).map(|v| v.is_string() || v.is_number()).unwrap_or(false)
            || data.get(key).and_then(|v| v.get("id")).map(|v| v.is_string() || v.is_number()).unwrap_or(false)
    };
    has("from") && has("to")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryGraphBackend;
    use serde_json::json;

    fn entity_item(id: &str) -> GraphItem {
        GraphItem { id: id.to_string(), item_type: "entity".into(), data: json!({"name": id}) }
    }

    #[tokio::test]
    async fn process_entities_is_idempotent() {
        let graph = Arc::new(InMemoryGraphBackend::new());
        let processor = BatchProcessor::new(BatchConfig::default(), Some(graph.clone()));
        let items: Vec<GraphItem> = (0..50).map(|i| entity_item(&format!("e{i}"))).collect();

        let first = processor.process_entities(items.clone(), None).await.unwrap();
        let second = processor.process_entities(items, None).await.unwrap();

        assert_eq!(first.processed_count, 50);
        assert_eq!(second.processed_count, 50);
        assert_eq!(graph.entity_count(), 50, "second call must not re-write");
    }

    #[tokio::test]
    async fn empty_batch_reports_zero_processed() {
        let processor = BatchProcessor::new(BatchConfig::default(), None);
        let result = processor.process_entities(Vec::new(), None).await.unwrap();
        assert_eq!(result.processed_count, 0);
        assert!(result.success);
    }

    #[tokio::test]
    async fn relationship_missing_endpoint_is_skipped_not_failed_batch() {
        let graph = Arc::new(InMemoryGraphBackend::new());
        let processor = BatchProcessor::new(BatchConfig::default(), Some(graph));
        let good = GraphItem { id: "r1".into(), item_type: "rel".into(), data: json!({"from": "e1", "to": "e2"}) };
        let bad = GraphItem { id: "r2".into(), item_type: "rel".into(), data: json!({"from": "e1"}) };

        let result = processor.process_relationships(vec![good, bad], None).await.unwrap();
        assert_eq!(result.processed_count, 1);
        assert_eq!(result.failed.len(), 1);
    }

    #[tokio::test]
    async fn dag_orders_entities_before_dependent_relationships() {
        let graph = Arc::new(InMemoryGraphBackend::new());
        let processor = BatchProcessor::new(BatchConfig::default(), Some(graph));

        let entity_a = Uuid::new_v4();
        let entity_b = Uuid::new_v4();
        let relationship = Uuid::new_v4();

        let fragments = vec![
            ChangeFragment {
                id: relationship,
                event_id: Uuid::new_v4(),
                change_type: FragmentKind::Relationship,
                operation: FragmentOp::Add,
                data: json!({"from": entity_a.to_string(), "to": entity_b.to_string()}),
                dependency_hints: vec![entity_a, entity_b],
                confidence: 0.9,
            },
            ChangeFragment {
                id: entity_a,
                event_id: Uuid::new_v4(),
                change_type: FragmentKind::Entity,
                operation: FragmentOp::Add,
                data: json!({"name": "A"}),
                dependency_hints: vec![],
                confidence: 1.0,
            },
            ChangeFragment {
                id: entity_b,
                event_id: Uuid::new_v4(),
                change_type: FragmentKind::Entity,
                operation: FragmentOp::Add,
                data: json!({"name": "B"}),
                dependency_hints: vec![],
                confidence: 1.0,
            },
        ];

        let result = processor.process_change_fragments(fragments).await.unwrap();
        assert_eq!(result.processed_count, 3);
        assert!(result.success);
    }

    #[test]
    fn dag_detects_cycle() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let fragments = vec![
            ChangeFragment {
                id: a,
                event_id: Uuid::new_v4(),
                change_type: FragmentKind::Entity,
                operation: FragmentOp::Add,
                data: Json::Null,
                dependency_hints: vec![b],
                confidence: 1.0,
            },
            ChangeFragment {
                id: b,
                event_id: Uuid::new_v4(),
                change_type: FragmentKind::Entity,
                operation: FragmentOp::Add,
                data: Json::Null,
                dependency_hints: vec![a],
                confidence: 1.0,
            },
        ];
        let dag = DependencyDag::build(fragments);
        assert!(dag.has_cycle());
    }
}

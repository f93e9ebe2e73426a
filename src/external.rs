// # External Collaborators
//
// The graph backend, key/value+pub/sub store, source parser, embedding
// service, and change source are surrounding systems; we specify only the
// interfaces the core substrate requires from them. Each is a polymorphic
// `async_trait` object; an in-memory fake backs unit and integration tests
// and doubles as the "dry-run" collaborator the `BatchProcessor` falls back
// to when no real `GraphBackend` is configured.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// Graph backend
// ============================================================================

/// A single entity or relationship write item handed to the graph backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphItem {
    pub id: String,
    pub item_type: String,
    pub data: Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteOpts {
    pub epoch: Option<u64>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub written: usize,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingItem {
    pub entity_id: String,
    pub vector: Vec<f32>,
    pub metadata: Json,
}

/// Required graph operations. Bulk APIs are preferred; an adapter
/// backed by a store without bulk support is expected to fall back to serial
/// per-item calls using `WriteOpts::batch_size`.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    async fn create_entities_bulk(&self, items: Vec<GraphItem>, opts: WriteOpts) -> Result<WriteOutcome>;
    async fn create_relationships_bulk(&self, items: Vec<GraphItem>, opts: WriteOpts) -> Result<WriteOutcome>;
    async fn create_embeddings_batch(&self, items: Vec<EmbeddingItem>, opts: WriteOpts) -> Result<WriteOutcome>;
    async fn create_or_update_entity(&self, item: GraphItem, opts: WriteOpts) -> Result<()>;
    async fn create_relationship(&self, item: GraphItem) -> Result<()>;
    async fn query(&self, statement: &str, params: Json) -> Result<Json>;
    /// Fetch an entity's current data, if it exists. Used to honor
    /// skip/merge conflict policies before writing an update.
    async fn get_entity(&self, id: &str) -> Result<Option<Json>>;
    /// Append an anchor to an entity's `metadata.sessions`, keeping only the
    /// most recent `keep_last` entries. Non-critical: callers log and swallow
    /// failures rather than propagate them.
    async fn append_session_anchor(&self, entity_id: &str, anchor: Json, keep_last: usize) -> Result<()>;
}

/// In-memory fake used by tests and as the dry-run collaborator.
#[derive(Default)]
pub struct InMemoryGraphBackend {
    entities: Mutex<HashMap<String, Json>>,
    relationships: Mutex<Vec<GraphItem>>,
    embeddings: Mutex<Vec<EmbeddingItem>>,
    anchors: Mutex<HashMap<String, Vec<Json>>>,
}

impl InMemoryGraphBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.lock().len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.lock().len()
    }

    pub fn anchors_for(&self, entity_id: &str) -> Vec<Json> {
        self.anchors.lock().get(entity_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl GraphBackend for InMemoryGraphBackend {
    async fn create_entities_bulk(&self, items: Vec<GraphItem>, _opts: WriteOpts) -> Result<WriteOutcome> {
        let mut entities = self.entities.lock();
        let written = items.len();
        for item in items {
            entities.insert(item.id, item.data);
        }
        Ok(WriteOutcome { written, failed: Vec::new() })
    }

    async fn create_relationships_bulk(&self, items: Vec<GraphItem>, _opts: WriteOpts) -> Result<WriteOutcome> {
        let written = items.len();
        self.relationships.lock().extend(items);
        Ok(WriteOutcome { written, failed: Vec::new() })
    }

    async fn create_embeddings_batch(&self, items: Vec<EmbeddingItem>, _opts: WriteOpts) -> Result<WriteOutcome> {
        let written = items.len();
        self.embeddings.lock().extend(items);
        Ok(WriteOutcome { written, failed: Vec::new() })
    }

    async fn create_or_update_entity(&self, item: GraphItem, _opts: WriteOpts) -> Result<()> {
        self.entities.lock().insert(item.id, item.data);
        Ok(())
    }

    async fn create_relationship(&self, item: GraphItem) -> Result<()> {
        self.relationships.lock().push(item);
        Ok(())
    }

    async fn query(&self, _statement: &str, _params: Json) -> Result<Json> {
        Ok(Json::Null)
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Json>> {
        Ok(self.entities.lock().get(id).cloned())
    }

    async fn append_session_anchor(&self, entity_id: &str, anchor: Json, keep_last: usize) -> Result<()> {
        let mut anchors = self.anchors.lock();
        let list = anchors.entry(entity_id.to_string()).or_default();
        list.push(anchor);
        let len = list.len();
        if len > keep_last {
            list.drain(0..len - keep_last);
        }
        Ok(())
    }
}

// ============================================================================
// Key/value + pub/sub store
// ============================================================================

/// Required key/value and pub/sub operations, modeled after a
/// Redis-shaped client: hashes for session attributes, sorted sets for
/// ordered event logs, key expiry for TTLs, and a pub/sub channel.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn h_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn h_get_all(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn h_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn z_add(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn z_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn z_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;
    async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;
    async fn z_card(&self, key: &str) -> Result<u64>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;
    async fn ttl(&self, key: &str) -> Result<Option<u64>>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;

    async fn connect(&self) -> Result<()>;
    async fn quit(&self) -> Result<()>;
}

#[derive(Default)]
struct InMemoryKey {
    hash: HashMap<String, String>,
    zset: Vec<(String, f64)>,
    expires_at_ms: Option<u64>,
}

/// In-process fake of the key/value+pub/sub store. Single process-scoped
/// instance shared via `Arc` across `ConnectionPool`, `SessionStore`, and
/// tests.
pub struct InMemoryKeyValueStore {
    data: Mutex<HashMap<String, InMemoryKey>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self { data: Mutex::new(HashMap::new()), channels: Mutex::new(HashMap::new()) }
    }

    fn is_live(entry: &InMemoryKey) -> bool {
        match entry.expires_at_ms {
            Some(exp) => crate::common::now_millis() < exp,
            None => true,
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn h_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock();
        let entry = data.entry(key.to_string()).or_default();
        entry.hash.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn h_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let data = self.data.lock();
        Ok(data.get(key).filter(|e| Self::is_live(e)).map(|e| e.hash.clone()).unwrap_or_default())
    }

    async fn h_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut data = self.data.lock();
        let entry = data.entry(key.to_string()).or_default();
        let current: i64 = entry.hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + delta;
        entry.hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn z_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut data = self.data.lock();
        let entry = data.entry(key.to_string()).or_default();
        entry.zset.retain(|(m, _)| m != member);
        entry.zset.push((member.to_string(), score));
        entry.zset.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        Ok(())
    }

    async fn z_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let data = self.data.lock();
        let Some(entry) = data.get(key).filter(|e| Self::is_live(e)) else {
            return Ok(Vec::new());
        };
        let len = entry.zset.len() as i64;
        let norm = |i: i64| -> i64 { if i < 0 { (len + i).max(0) } else { i } };
        let start = norm(start).min(len);
        let stop = (norm(stop) + 1).min(len);
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(entry.zset[start as usize..stop as usize].iter().map(|(m, _)| m.clone()).collect())
    }

    async fn z_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let data = self.data.lock();
        Ok(data
            .get(key)
            .filter(|e| Self::is_live(e))
            .map(|e| e.zset.iter().filter(|(_, s)| *s >= min && *s <= max).map(|(m, _)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut data = self.data.lock();
        let Some(entry) = data.get_mut(key) else { return Ok(0) };
        let before = entry.zset.len();
        entry.zset.retain(|(_, s)| !(*s >= min && *s <= max));
        Ok((before - entry.zset.len()) as u64)
    }

    async fn z_card(&self, key: &str) -> Result<u64> {
        let data = self.data.lock();
        Ok(data.get(key).filter(|e| Self::is_live(e)).map(|e| e.zset.len() as u64).unwrap_or(0))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut data = self.data.lock();
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at_ms = Some(crate::common::now_millis() + ttl_secs * 1000);
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let data = self.data.lock();
        Ok(data.get(key).and_then(|e| e.expires_at_ms).map(|exp| {
            exp.saturating_sub(crate::common::now_millis()) / 1000
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let data = self.data.lock();
        Ok(data.get(key).map(Self::is_live).unwrap_or(false))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let prefix = pattern.trim_end_matches('*');
        let data = self.data.lock();
        Ok(data.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let channels = self.channels.lock();
        if let Some(tx) = channels.get(channel) {
            let _ = tx.send(message.to_string());
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut channels = self.channels.lock();
        channels.entry(channel.to_string()).or_insert_with(|| broadcast::channel(1024).0).subscribe()
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub entities: Vec<Json>,
    pub relationships: Vec<Json>,
    pub errors: Vec<String>,
}

/// Source-language parser. Errors are non-fatal per file; a
/// missing file should surface as a `ParseOutcome` with one error entry
/// rather than an `Err`.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse_file(&self, path: &str) -> Result<ParseOutcome>;
}

/// Deterministic fake parser for tests: derives a trivial entity per file
/// and fails files whose name contains "error".
#[derive(Default)]
pub struct StubParser;

#[async_trait]
impl Parser for StubParser {
    async fn parse_file(&self, path: &str) -> Result<ParseOutcome> {
        if !path.contains("error") {
            Ok(ParseOutcome {
                entities: vec![Json::String(format!("entity::{path}"))],
                relationships: if path.contains("interface") || path.contains("function") {
                    vec![Json::String(format!("relationship::{path}"))]
                } else {
                    Vec::new()
                },
                errors: Vec::new(),
            })
        } else {
            Ok(ParseOutcome {
                entities: Vec::new(),
                relationships: Vec::new(),
                errors: vec![format!("invalid syntax in {path}")],
            })
        }
    }
}

// ============================================================================
// Embedding service (optional)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingOpts {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub entity_id: String,
    pub vector: Vec<f32>,
    pub metadata: Json,
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn generate_and_store(&self, entity: Json, opts: EmbeddingOpts) -> Result<EmbeddingResult>;
}

// ============================================================================
// Change source
// ============================================================================

/// A change event produced by a watcher and fed into the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: uuid::Uuid,
    pub namespace: String,
    pub module: String,
    pub file_path: String,
    pub event_type: ChangeEventType,
    pub timestamp: u64,
    pub size: u64,
    pub diff_hash: String,
    pub metadata: Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEventType {
    Created,
    Modified,
    Deleted,
}

/// Any producer that delivers `ChangeEvent`s. The pipeline drains this
/// with `recv()` on its own task; a producer with nothing left to emit
/// returns `None` and the drain loop exits.
pub type ChangeSource = Arc<tokio::sync::Mutex<tokio::sync::mpsc::Receiver<ChangeEvent>>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kv_store_hash_roundtrip() {
        let store = InMemoryKeyValueStore::new();
        store.h_set("session:1", "state", "working").await.unwrap();
        let all = store.h_get_all("session:1").await.unwrap();
        assert_eq!(all.get("state"), Some(&"working".to_string()));
    }

    #[tokio::test]
    async fn kv_store_zset_ordering() {
        let store = InMemoryKeyValueStore::new();
        store.z_add("events:1", 2.0, "b").await.unwrap();
        store.z_add("events:1", 1.0, "a").await.unwrap();
        store.z_add("events:1", 3.0, "c").await.unwrap();
        let range = store.z_range("events:1", 0, -1).await.unwrap();
        assert_eq!(range, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn kv_store_expiry() {
        let store = InMemoryKeyValueStore::new();
        store.h_set("k", "f", "v").await.unwrap();
        store.expire("k", 0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn parser_stub_flags_error_files() {
        let parser = StubParser;
        let outcome = parser.parse_file("error-file.ts").await.unwrap();
        assert!(!outcome.errors.is_empty());
        assert!(outcome.entities.is_empty());
    }
}

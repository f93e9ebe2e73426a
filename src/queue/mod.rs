// # Queue Manager
//
// Partitioned, priority-ordered task queues with backpressure, scheduled
// tasks, and retry with exponential backoff and jitter.

use crate::common::{now_millis, TaskId};
use crate::error::{IngestError, Result};
use crate::monitoring::{AlertManager, Counter, RollingWindow};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStrategy {
    Hash,
    Priority,
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub id: TaskId,
    pub task_type: String,
    pub priority: u8,
    pub data: Json,
    pub metadata: Json,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at_ms: u64,
    pub scheduled_at_ms: Option<u64>,
}

impl TaskPayload {
    pub fn new(task_type: impl Into<String>, priority: u8, data: Json) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            priority: priority.min(10),
            data,
            metadata: Json::Object(Default::default()),
            retry_count: 0,
            max_retries: 5,
            created_at_ms: now_millis(),
            scheduled_at_ms: None,
        }
    }

    pub fn with_partition_key(self, key: impl Into<String>) -> (Self, String) {
        let key = key.into();
        (self, key)
    }

    fn is_ready(&self, now: u64) -> bool {
        self.scheduled_at_ms.map(|t| t <= now).unwrap_or(true)
    }
}

/// A task ordered by `(priority desc, created_at asc)` inside a partition's
/// ready heap.
#[derive(Debug, Clone)]
struct QueuedTask {
    task: TaskPayload,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.task.created_at_ms == other.task.created_at_ms
    }
}
impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.task.created_at_ms.cmp(&self.task.created_at_ms))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Partition {
    ready: BinaryHeap<QueuedTask>,
    scheduled: Vec<TaskPayload>,
}

impl Partition {
    fn depth(&self) -> usize {
        self.ready.len() + self.scheduled.len()
    }

    fn promote_scheduled(&mut self, now: u64) {
        if self.scheduled.is_empty() {
            return;
        }
        let mut remaining = Vec::with_capacity(self.scheduled.len());
        for task in self.scheduled.drain(..) {
            if task.is_ready(now) {
                self.ready.push(QueuedTask { task });
            } else {
                remaining.push(task);
            }
        }
        self.scheduled = remaining;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue_depth: usize,
    pub oldest_event_age_ms: u64,
    pub partition_depths: Vec<usize>,
    pub throughput_per_sec: f64,
    pub error_rate: f64,
}

/// Task abandoned after exhausting its retry budget (`task:abandoned`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbandonedTask {
    pub task: TaskPayload,
    pub last_error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    TaskAbandoned(AbandonedTask),
}

/// Partitioned priority task queue.
pub struct QueueManager {
    partitions: Vec<Mutex<Partition>>,
    strategy: PartitionStrategy,
    max_size: usize,
    backpressure_threshold: usize,
    enable_backpressure: bool,
    retry_attempts: u32,
    retry_delay: Duration,
    successes: Counter,
    failures: Counter,
    latency: RollingWindow,
    events: broadcast::Sender<QueueEvent>,
    round_robin_cursor: AtomicU64,
    alert_manager: Option<Arc<AlertManager>>,
}

impl QueueManager {
    pub fn new(partition_count: usize, strategy: PartitionStrategy, max_size: usize, backpressure_threshold: usize) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            partitions: (0..partition_count.max(1)).map(|_| Mutex::new(Partition::default())).collect(),
            strategy,
            max_size,
            backpressure_threshold,
            enable_backpressure: true,
            retry_attempts: 5,
            retry_delay: Duration::from_millis(500),
            successes: Counter::default(),
            failures: Counter::default(),
            latency: RollingWindow::new(1000),
            events,
            round_robin_cursor: AtomicU64::new(0),
            alert_manager: None,
        }
    }

    pub fn with_alert_manager(mut self, alert_manager: Arc<AlertManager>) -> Self {
        self.alert_manager = Some(alert_manager);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn partition_for(&self, task: &TaskPayload, partition_key: Option<&str>) -> usize {
        match self.strategy {
            PartitionStrategy::Priority => {
                let n = self.partition_count();
                let inv = 10u32.saturating_sub(task.priority as u32) as usize;
                (inv * n / 11).min(n - 1)
            }
            PartitionStrategy::RoundRobin => {
                (self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) as usize) % self.partition_count()
            }
            PartitionStrategy::Hash => {
                let key = partition_key.map(str::to_string).unwrap_or_else(|| task.id.to_string());
                (hash_str(&key) as usize) % self.partition_count()
            }
        }
    }

    fn total_depth(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().depth()).sum()
    }

    /// Enqueue a task. Fails fast with `QueueOverflow` when backpressure is
    /// engaged and total depth is at or above `backpressureThreshold`.
    pub fn enqueue(&self, task: TaskPayload, partition_key: Option<&str>) -> Result<()> {
        let depth = self.total_depth();
        if self.enable_backpressure && depth >= self.backpressure_threshold {
            if let Some(alerts) = &self.alert_manager {
                alerts.evaluate("queue_depth", depth as f64);
            }
            return Err(IngestError::QueueOverflow { depth, threshold: self.backpressure_threshold });
        }
        if depth >= self.max_size {
            return Err(IngestError::QueueOverflow { depth, threshold: self.max_size });
        }

        let idx = self.partition_for(&task, partition_key);
        let mut partition = self.partitions[idx].lock();
        let now = now_millis();
        if task.is_ready(now) {
            partition.ready.push(QueuedTask { task });
        } else {
            partition.scheduled.push(task);
        }
        Ok(())
    }

    /// Dequeue up to `n` tasks from a specific partition, highest priority
    /// first, promoting any now-ready scheduled tasks first.
    pub fn dequeue(&self, partition_id: usize, n: usize) -> Vec<TaskPayload> {
        let Some(partition_lock) = self.partitions.get(partition_id) else { return Vec::new() };
        let mut partition = partition_lock.lock();
        partition.promote_scheduled(now_millis());
        (0..n).filter_map(|_| partition.ready.pop().map(|q| q.task)).collect()
    }

    /// Dequeue a batch from a round-robin-selected partition (or the given
    /// one), draining whatever is ready.
    pub fn dequeue_batch(&self, partition_id: Option<usize>) -> Vec<TaskPayload> {
        let idx = partition_id.unwrap_or_else(|| {
            (self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) as usize) % self.partition_count()
        });
        self.dequeue(idx, usize::MAX)
    }

    /// Global top-N by priority across all partitions.
    pub fn dequeue_by_priority(&self, n: usize) -> Vec<TaskPayload> {
        let now = now_millis();
        let mut candidates: Vec<(usize, TaskPayload)> = Vec::new();
        for (idx, partition_lock) in self.partitions.iter().enumerate() {
            let mut partition = partition_lock.lock();
            partition.promote_scheduled(now);
            for q in partition.ready.iter() {
                candidates.push((idx, q.task.clone()));
            }
        }
        candidates.sort_by(|a, b| {
            b.1.priority.cmp(&a.1.priority).then_with(|| a.1.created_at_ms.cmp(&b.1.created_at_ms))
        });
        candidates.truncate(n);

        for (idx, task) in &candidates {
            let mut partition = self.partitions[*idx].lock();
            let before = partition.ready.len();
            let items: Vec<QueuedTask> = partition.ready.drain().filter(|q| q.task.id != task.id).collect();
            partition.ready = items.into_iter().collect();
            debug_assert!(partition.ready.len() <= before);
        }
        candidates.into_iter().map(|(_, t)| t).collect()
    }

    /// Reinsert a failed task with incremented retry count and a backoff
    /// delay, or abandon it once `maxRetries` is exceeded.
    pub fn requeue(&self, mut task: TaskPayload, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        task.retry_count += 1;
        if task.retry_count > task.max_retries {
            self.failures.inc();
            warn!(task_id = %task.id, task_type = %task.task_type, "task:abandoned");
            let _ = self.events.send(QueueEvent::TaskAbandoned(AbandonedTask { task, last_error: error }));
            return Ok(());
        }

        let base_ms = self.retry_delay.as_millis() as u64;
        let backoff = base_ms.saturating_mul(1u64 << task.retry_count.min(16));
        let jitter_frac = rand::rng().random_range(-0.25..=0.25);
        let jittered = (backoff as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
        let delay_ms = jittered.min(60_000);

        task.scheduled_at_ms = Some(now_millis() + delay_ms);
        if let Json::Object(ref mut map) = task.metadata {
            map.insert("lastError".to_string(), Json::String(error));
        }
        self.failures.inc();
        self.enqueue(task, None)
    }

    pub fn record_success(&self, latency_ms: f64) {
        self.successes.inc();
        self.latency.record(latency_ms);
    }

    pub fn is_backpressured(&self) -> bool {
        self.enable_backpressure && self.total_depth() >= self.backpressure_threshold
    }

    pub fn get_partition_status(&self) -> Vec<usize> {
        self.partitions.iter().map(|p| p.lock().depth()).collect()
    }

    pub fn get_metrics(&self) -> QueueMetrics {
        let partition_depths = self.get_partition_status();
        let depth: usize = partition_depths.iter().sum();
        let oldest_age = self
            .partitions
            .iter()
            .flat_map(|p| p.lock().ready.iter().map(|q| q.task.created_at_ms).collect::<Vec<_>>())
            .min()
            .map(|created| now_millis().saturating_sub(created))
            .unwrap_or(0);

        let successes = self.successes.get();
        let failures = self.failures.get();
        let error_rate = if successes + failures == 0 { 0.0 } else { failures as f64 / (successes + failures) as f64 };

        if let Some(alerts) = &self.alert_manager {
            alerts.evaluate("queue_depth", depth as f64);
            alerts.evaluate("error_rate", error_rate);
        }

        QueueMetrics {
            queue_depth: depth,
            oldest_event_age_ms: oldest_age,
            partition_depths,
            throughput_per_sec: successes as f64,
            error_rate,
        }
    }
}

fn hash_str(s: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager").field("partitions", &self.partition_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: u8) -> TaskPayload {
        TaskPayload::new("parse", priority, Json::Null)
    }

    #[test]
    fn priority_respected_within_partition() {
        let qm = QueueManager::new(1, PartitionStrategy::RoundRobin, 1000, 900);
        qm.enqueue(task(3), None).unwrap();
        qm.enqueue(task(7), None).unwrap();
        let out = qm.dequeue(0, 2);
        assert_eq!(out[0].priority, 7);
        assert_eq!(out[1].priority, 3);
    }

    #[test]
    fn fifo_within_equal_priority() {
        let qm = QueueManager::new(1, PartitionStrategy::RoundRobin, 1000, 900);
        let first = task(5);
        let first_id = first.id;
        qm.enqueue(first, None).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        qm.enqueue(task(5), None).unwrap();
        let out = qm.dequeue(0, 1);
        assert_eq!(out[0].id, first_id);
    }

    #[test]
    fn backpressure_rejects_then_recovers() {
        let qm = QueueManager::new(1, PartitionStrategy::RoundRobin, 1000, 5);
        for _ in 0..5 {
            qm.enqueue(task(1), None).unwrap();
        }
        let err = qm.enqueue(task(1), None).unwrap_err();
        assert_eq!(err.code(), "QueueOverflow");

        qm.dequeue(0, 2);
        assert!(qm.enqueue(task(1), None).is_ok());
    }

    #[test]
    fn dequeue_by_priority_is_global() {
        let qm = QueueManager::new(4, PartitionStrategy::Hash, 1000, 900);
        qm.enqueue(task(1), Some("a")).unwrap();
        qm.enqueue(task(9), Some("b")).unwrap();
        qm.enqueue(task(5), Some("c")).unwrap();
        let top = qm.dequeue_by_priority(1);
        assert_eq!(top[0].priority, 9);
    }

    #[test]
    fn requeue_increments_retry_and_schedules_backoff() {
        let qm = QueueManager::new(1, PartitionStrategy::RoundRobin, 1000, 900);
        let t = task(5);
        qm.requeue(t, "boom").unwrap();
        assert_eq!(qm.get_partition_status()[0], 1);
    }

    #[test]
    fn requeue_past_max_retries_abandons_task() {
        let qm = QueueManager::new(1, PartitionStrategy::RoundRobin, 1000, 900);
        let mut rx = qm.subscribe();
        let mut t = task(5);
        t.retry_count = t.max_retries;
        qm.requeue(t, "boom").unwrap();
        assert_eq!(qm.get_partition_status()[0], 0);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn hash_partitioning_is_stable_for_same_key() {
        let qm = QueueManager::new(8, PartitionStrategy::Hash, 1000, 900);
        let t1 = task(5);
        let t2 = task(5);
        assert_eq!(qm.partition_for(&t1, Some("stable-key")), qm.partition_for(&t2, Some("stable-key")));
    }
}

// # Worker Pool
//
// Parallel task executors pulling from a `QueueManager` partition, dispatching
// by registered handler, auto-scaling on depth, and replacing workers that
// fail repeatedly or time out.

use crate::common::{Component, HealthStatus};
use crate::error::{IngestError, Result};
use crate::monitoring::{Counter, RollingWindow};
use crate::queue::{QueueManager, TaskPayload};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as Json;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// A registered task handler. `TaskType` is an open string key rather than a
/// closed enum; handlers register dynamically.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskPayload) -> Result<Json>;
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerPoolMetrics {
    pub active_workers: usize,
    pub busy_workers: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_duration_ms: f64,
}

pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_timeout: Duration,
    pub scale_up_threshold: usize,
    pub scale_down_threshold: usize,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    pub restart_threshold: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 16,
            worker_timeout: Duration::from_secs(30),
            scale_up_threshold: 500,
            scale_down_threshold: 50,
            scale_up_cooldown: Duration::from_secs(10),
            scale_down_cooldown: Duration::from_secs(30),
            restart_threshold: 5,
        }
    }
}

struct WorkerSlot {
    consecutive_failures: AtomicU32,
    alive: AtomicBool,
}

/// Parallel workers draining a `QueueManager` partition, dispatching to
/// registered handlers by task type.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<QueueManager>,
    partition_id: usize,
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
    running: Arc<AtomicBool>,
    worker_count: Arc<AtomicUsize>,
    busy_workers: Arc<AtomicUsize>,
    slots: DashMap<usize, Arc<WorkerSlot>>,
    completed: Counter,
    failed: Counter,
    durations: RollingWindow,
    shutdown_notify: Arc<Notify>,
    last_scale_ms: Arc<std::sync::atomic::AtomicU64>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, queue: Arc<QueueManager>, partition_id: usize) -> Self {
        Self {
            config,
            queue,
            partition_id,
            handlers: DashMap::new(),
            running: Arc::new(AtomicBool::new(false)),
            worker_count: Arc::new(AtomicUsize::new(0)),
            busy_workers: Arc::new(AtomicUsize::new(0)),
            slots: DashMap::new(),
            completed: Counter::default(),
            failed: Counter::default(),
            durations: RollingWindow::new(1000),
            shutdown_notify: Arc::new(Notify::new()),
            last_scale_ms: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    pub fn register_handler(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        for _ in 0..self.config.min_workers {
            self.spawn_worker();
        }
        self.clone().spawn_autoscaler();
        info!(min = self.config.min_workers, "worker pool started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>) {
        let id = self.worker_count.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(WorkerSlot { consecutive_failures: AtomicU32::new(0), alive: AtomicBool::new(true) });
        self.slots.insert(id, slot.clone());
        let pool = self.clone();

        tokio::spawn(async move {
            debug!(worker_id = id, "worker started");
            loop {
                if !pool.running.load(Ordering::SeqCst) || !slot.alive.load(Ordering::SeqCst) {
                    break;
                }
                let tasks = pool.queue.dequeue(pool.partition_id, 1);
                let Some(task) = tasks.into_iter().next() else {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    continue;
                };

                pool.busy_workers.fetch_add(1, Ordering::SeqCst);
                let started = std::time::Instant::now();
                let result = pool.execute_task(&task).await;
                let elapsed_ms = started.elapsed().as_millis() as f64;
                pool.busy_workers.fetch_sub(1, Ordering::SeqCst);

                match result {
                    Ok(_) => {
                        slot.consecutive_failures.store(0, Ordering::SeqCst);
                        pool.completed.inc();
                        pool.durations.record(elapsed_ms);
                    }
                    Err(e) => {
                        pool.failed.inc();
                        let failures = slot.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                        warn!(worker_id = id, error = %e, task_id = %task.id, "task failed");
                        let _ = pool.queue.requeue(task, e.to_string());

                        if failures >= pool.config.restart_threshold {
                            error!(worker_id = id, failures, "worker exceeded restart threshold, terminating");
                            slot.alive.store(false, Ordering::SeqCst);
                            pool.worker_count.fetch_sub(1, Ordering::SeqCst);
                            pool.spawn_worker();
                            break;
                        }
                    }
                }
            }
            debug!(worker_id = id, "worker stopped");
        });
    }

    async fn execute_task(&self, task: &TaskPayload) -> Result<Json> {
        let Some(handler) = self.handlers.get(&task.task_type).map(|h| h.clone()) else {
            return Err(IngestError::ValidationError { context: format!("no handler registered for {}", task.task_type) });
        };

        match timeout(self.config.worker_timeout, handler.handle(task)).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::WorkerTimeout {
                timeout_ms: self.config.worker_timeout.as_millis() as u64,
                context: format!("task {} ({})", task.id, task.task_type),
            }),
        }
    }

    fn spawn_autoscaler(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            loop {
                ticker.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.maybe_scale();
            }
        });
    }

    fn maybe_scale(self: &Arc<Self>) {
        let depth = self.queue.get_partition_status().get(self.partition_id).copied().unwrap_or(0);
        let workers = self.worker_count.load(Ordering::SeqCst);
        let now = crate::common::now_millis();
        let last = self.last_scale_ms.load(Ordering::SeqCst);

        if depth >= self.config.scale_up_threshold
            && workers < self.config.max_workers
            && now.saturating_sub(last) >= self.config.scale_up_cooldown.as_millis() as u64
        {
            self.spawn_worker();
            self.last_scale_ms.store(now, Ordering::SeqCst);
            info!(depth, workers = workers + 1, "worker pool scaled up");
        } else if depth <= self.config.scale_down_threshold
            && workers > self.config.min_workers
            && now.saturating_sub(last) >= self.config.scale_down_cooldown.as_millis() as u64
        {
            if let Some(entry) = self.slots.iter().find(|e| e.value().alive.load(Ordering::SeqCst)) {
                entry.value().alive.store(false, Ordering::SeqCst);
                self.worker_count.fetch_sub(1, Ordering::SeqCst);
                self.last_scale_ms.store(now, Ordering::SeqCst);
                info!(depth, workers = workers - 1, "worker pool scaled down");
            }
        }
    }

    pub fn get_metrics(&self) -> WorkerPoolMetrics {
        WorkerPoolMetrics {
            active_workers: self.worker_count.load(Ordering::SeqCst),
            busy_workers: self.busy_workers.load(Ordering::SeqCst),
            tasks_completed: self.completed.get(),
            tasks_failed: self.failed.get(),
            average_duration_ms: self.durations.average(),
        }
    }
}

#[async_trait]
impl Component for WorkerPool {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop().await
    }

    fn health_check(&self) -> HealthStatus {
        let workers = self.worker_count.load(Ordering::SeqCst);
        if workers == 0 {
            HealthStatus::Unhealthy
        } else if workers < self.config.min_workers {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PartitionStrategy;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn handle(&self, task: &TaskPayload) -> Result<Json> {
            Ok(task.data.clone())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _task: &TaskPayload) -> Result<Json> {
            Err(IngestError::ParseError { context: "always fails".into() })
        }
    }

    #[tokio::test]
    async fn processes_registered_task_type() {
        let queue = Arc::new(QueueManager::new(1, PartitionStrategy::RoundRobin, 1000, 900));
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig { min_workers: 1, ..Default::default() }, queue.clone(), 0));
        pool.register_handler("echo", Arc::new(EchoHandler));
        pool.start().await.unwrap();

        queue.enqueue(TaskPayload::new("echo", 5, Json::String("hi".into())), None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pool.get_metrics().tasks_completed, 1);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_task_is_requeued() {
        let queue = Arc::new(QueueManager::new(1, PartitionStrategy::RoundRobin, 1000, 900));
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig { min_workers: 1, restart_threshold: 100, ..Default::default() },
            queue.clone(),
            0,
        ));
        pool.register_handler("fail", Arc::new(FailingHandler));
        pool.start().await.unwrap();

        queue.enqueue(TaskPayload::new("fail", 5, Json::Null), None).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(pool.get_metrics().tasks_failed >= 1);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn health_check_reflects_worker_count() {
        let queue = Arc::new(QueueManager::new(1, PartitionStrategy::RoundRobin, 1000, 900));
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig { min_workers: 2, ..Default::default() }, queue, 0));
        pool.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.health_check(), HealthStatus::Healthy);
        pool.stop().await.unwrap();
    }
}

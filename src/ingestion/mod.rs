// # Ingestion Pipeline
//
// Orchestrates the full dataflow: change event → parse task → change
// fragments → entity/relationship/embedding tasks → batch writes. A state
// enum guarded by a lock drives `health_check` and rolling statistics, with
// threshold/cool-down alert dispatch through `AlertManager`.

use crate::batch::{BatchProcessor, FragmentKind};
use crate::common::{now_millis, Component, HealthStatus};
use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::external::{ChangeEvent, ChangeEventType, ChangeSource, Parser};
use crate::monitoring::{AlertManager, AlertThreshold, RollingWindow, Telemetry};
use crate::queue::{PartitionStrategy, QueueManager, TaskPayload};
use crate::worker::{TaskHandler, WorkerPool, WorkerPoolConfig};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value as Json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
    Error,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PipelineMetrics {
    pub events_per_second: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub cpu_approximation: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub enum PipelineEvent {
    StateChanged { from: PipelineState, to: PipelineState },
    EventIngested { event_id: Uuid },
}

/// Orchestrates the parse → entity/relationship → batch-write dataflow,
/// strictly gated by a lifecycle state machine.
pub struct IngestionPipeline {
    config: PipelineConfig,
    state: RwLock<PipelineState>,
    parse_queue: Arc<QueueManager>,
    write_queue: Arc<QueueManager>,
    parse_workers: Arc<WorkerPool>,
    write_workers: Arc<WorkerPool>,
    batch_processor: Arc<BatchProcessor>,
    alert_manager: Arc<AlertManager>,
    telemetry: Arc<Telemetry>,
    latency: RollingWindow,
    events_seen: AtomicU64,
    started_at_ms: AtomicU64,
    events: broadcast::Sender<PipelineEvent>,
}

impl IngestionPipeline {
    pub fn new(config: PipelineConfig, parser: Arc<dyn Parser>, batch_processor: Arc<BatchProcessor>) -> Arc<Self> {
        let alert_manager = Arc::new(AlertManager::new());
        alert_manager.register(AlertThreshold::new(
            "queue_depth_high",
            "queue_depth",
            config.monitoring.alert_thresholds.queue_depth,
            crate::monitoring::AlertSeverity::Warning,
        ));
        alert_manager.register(AlertThreshold::new(
            "latency_high",
            "latency_ms",
            config.monitoring.alert_thresholds.latency_ms,
            crate::monitoring::AlertSeverity::Error,
        ));
        alert_manager.register(AlertThreshold::new(
            "error_rate_high",
            "error_rate",
            config.monitoring.alert_thresholds.error_rate,
            crate::monitoring::AlertSeverity::Critical,
        ));

        let parse_queue = Arc::new(
            QueueManager::new(config.queues.partition_count, PartitionStrategy::Priority, config.queues.max_size, config.queues.backpressure_threshold)
                .with_alert_manager(alert_manager.clone()),
        );
        let write_queue = Arc::new(
            QueueManager::new(config.queues.partition_count, PartitionStrategy::Priority, config.queues.max_size, config.queues.backpressure_threshold)
                .with_alert_manager(alert_manager.clone()),
        );

        let parse_workers = Arc::new(WorkerPool::new(
            WorkerPoolConfig { min_workers: config.workers.parsers, max_workers: config.workers.parsers.max(1) * 4, ..Default::default() },
            parse_queue.clone(),
            0,
        ));
        parse_workers.register_handler("parse", Arc::new(ParseHandler { parser, write_queue: write_queue.clone() }));

        let write_workers = Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                min_workers: config.workers.entity_workers + config.workers.relationship_workers,
                max_workers: (config.workers.entity_workers + config.workers.relationship_workers).max(1) * 4,
                ..Default::default()
            },
            write_queue.clone(),
            0,
        ));
        write_workers.register_handler("entity_upsert", Arc::new(WriteHandler { batch_processor: batch_processor.clone(), kind: FragmentKind::Entity }));
        write_workers.register_handler(
            "relationship_upsert",
            Arc::new(WriteHandler { batch_processor: batch_processor.clone(), kind: FragmentKind::Relationship }),
        );

        let (events, _) = broadcast::channel(1024);

        Arc::new(Self {
            config,
            state: RwLock::new(PipelineState::Stopped),
            parse_queue,
            write_queue,
            parse_workers,
            write_workers,
            batch_processor,
            alert_manager,
            telemetry: Arc::new(Telemetry::new()),
            latency: RollingWindow::new(1000),
            events_seen: AtomicU64::new(0),
            started_at_ms: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    fn transition(&self, to: PipelineState) {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            *state = to;
            from
        };
        let _ = self.events.send(PipelineEvent::StateChanged { from, to });
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !matches!(self.state(), PipelineState::Stopped | PipelineState::Error) {
            return Err(IngestError::invalid_state(format!("cannot start from {:?}", self.state())));
        }
        self.transition(PipelineState::Starting);
        self.parse_workers.start().await?;
        self.write_workers.start().await?;
        self.started_at_ms.store(now_millis(), Ordering::SeqCst);
        self.transition(PipelineState::Running);
        info!("ingestion pipeline started");
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        if self.state() != PipelineState::Running {
            return Err(IngestError::invalid_state("pause requires running state"));
        }
        self.transition(PipelineState::Pausing);
        self.transition(PipelineState::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        if self.state() != PipelineState::Paused {
            return Err(IngestError::invalid_state("resume requires paused state"));
        }
        self.transition(PipelineState::Running);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.transition(PipelineState::Stopping);
        self.parse_workers.stop().await?;
        self.write_workers.stop().await?;
        self.transition(PipelineState::Stopped);
        info!("ingestion pipeline stopped");
        Ok(())
    }

    /// Run the pipeline against a `ChangeSource`, draining it until closed.
    pub fn drain(self: &Arc<Self>, source: ChangeSource) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            loop {
                let event = { source.lock().await.recv().await };
                match event {
                    Some(event) => {
                        if let Err(e) = pipeline.ingest_change_event(event).await {
                            warn!(error = %e, "failed to ingest change event");
                        }
                    }
                    None => break,
                }
            }
        });
    }

    /// `ingestChangeEvent`: only accepted while `running`.
    /// Priority = 5 + 2·isCodeFile + 1·(size<10KB) + 1·isModified, clamped
    /// to [0,10].
    pub async fn ingest_change_event(&self, event: ChangeEvent) -> Result<()> {
        if self.state() != PipelineState::Running {
            return Err(IngestError::PipelineNotRunning { context: format!("current state: {:?}", self.state()) });
        }

        let is_code_file = is_code_file(&event.file_path);
        let is_small = event.size < 10 * 1024;
        let is_modified = event.event_type == ChangeEventType::Modified;
        let priority = (5 + 2 * is_code_file as u8 + is_small as u8 + is_modified as u8).min(10);

        let task = TaskPayload::new("parse", priority, serde_json::to_value(&event)?);
        self.parse_queue.enqueue(task, Some(&event.file_path))?;
        self.telemetry.counter("events_total").inc();
        self.events_seen.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(PipelineEvent::EventIngested { event_id: event.id });
        Ok(())
    }

    pub fn get_metrics(&self) -> PipelineMetrics {
        let elapsed_s = (now_millis().saturating_sub(self.started_at_ms.load(Ordering::SeqCst)) as f64 / 1000.0).max(1.0);
        let events_per_second = self.events_seen.load(Ordering::SeqCst) as f64 / elapsed_s;

        let parse_metrics = self.parse_workers.get_metrics();
        let write_metrics = self.write_workers.get_metrics();
        let total_workers = (parse_metrics.active_workers + write_metrics.active_workers).max(1) as f64;
        let busy_workers = (parse_metrics.busy_workers + write_metrics.busy_workers) as f64;
        let busy_fraction = busy_workers / total_workers;

        let parse_depth: usize = self.parse_queue.get_partition_status().iter().sum();
        let write_depth: usize = self.write_queue.get_partition_status().iter().sum();
        let capacity = (self.config.queues.max_size * self.config.queues.partition_count * 2).max(1) as f64;
        let load = ((parse_depth + write_depth) as f64 / capacity).min(1.0);

        let cpu_approximation = 0.3 * load + 0.4 * busy_fraction;

        let metrics = PipelineMetrics {
            events_per_second,
            average_latency_ms: self.latency.average(),
            p95_latency_ms: self.latency.percentile(0.95),
            cpu_approximation,
        };

        self.alert_manager.evaluate("latency_ms", metrics.average_latency_ms);
        metrics
    }
}

fn is_code_file(path: &str) -> bool {
    const CODE_EXTENSIONS: &[&str] = &[".ts", ".tsx", ".js", ".jsx", ".rs", ".py", ".go", ".java", ".c", ".cpp"];
    CODE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

#[async_trait]
impl Component for IngestionPipeline {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop().await
    }

    fn health_check(&self) -> HealthStatus {
        match self.state() {
            PipelineState::Running => HealthStatus::Healthy,
            PipelineState::Error => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        }
    }
}

struct ParseHandler {
    parser: Arc<dyn Parser>,
    write_queue: Arc<QueueManager>,
}

#[async_trait]
impl TaskHandler for ParseHandler {
    async fn handle(&self, task: &TaskPayload) -> Result<Json> {
        let event: ChangeEvent = serde_json::from_value(task.data.clone())?;
        let outcome = self.parser.parse_file(&event.file_path).await?;

        if !outcome.errors.is_empty() {
            warn!(file = %event.file_path, errors = ?outcome.errors, "parse errors (non-fatal)");
        }

        for entity in &outcome.entities {
            let entity_task = TaskPayload::new("entity_upsert", task.priority.saturating_add(1).min(10), entity.clone());
            self.write_queue.enqueue(entity_task, Some(&event.file_path))?;
        }
        for relationship in &outcome.relationships {
            let rel_task = TaskPayload::new("relationship_upsert", task.priority, relationship.clone());
            self.write_queue.enqueue(rel_task, Some(&event.file_path))?;
        }

        Ok(json!({ "entities": outcome.entities.len(), "relationships": outcome.relationships.len(), "errors": outcome.errors }))
    }
}

struct WriteHandler {
    batch_processor: Arc<BatchProcessor>,
    kind: FragmentKind,
}

#[async_trait]
impl TaskHandler for WriteHandler {
    async fn handle(&self, task: &TaskPayload) -> Result<Json> {
        use crate::external::GraphItem;
        let item = GraphItem {
            id: task.data.get("id").and_then(|v| v.as_str()).unwrap_or(&task.id.to_string()).to_string(),
            item_type: format!("{:?}", self.kind),
            data: task.data.clone(),
        };
        let result = match self.kind {
            FragmentKind::Entity => self.batch_processor.process_entities(vec![item], None).await?,
            FragmentKind::Relationship => self.batch_processor.process_relationships(vec![item], None).await?,
        };
        Ok(serde_json::to_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::external::{ChangeEventType, StubParser};
    use serde_json::json;

    fn change_event(path: &str) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4(),
            namespace: "ns".into(),
            module: "mod".into(),
            file_path: path.to_string(),
            event_type: ChangeEventType::Modified,
            timestamp: now_millis(),
            size: 512,
            diff_hash: "abc".into(),
            metadata: Json::Null,
        }
    }

    #[tokio::test]
    async fn ingest_requires_running_state() {
        let pipeline = IngestionPipeline::new(PipelineConfig::default(), Arc::new(StubParser), Arc::new(BatchProcessor::new(BatchConfig::default(), None)));
        let err = pipeline.ingest_change_event(change_event("a.ts")).await.unwrap_err();
        assert_eq!(err.code(), "PipelineNotRunning");
    }

    #[tokio::test]
    async fn full_lifecycle_processes_event() {
        let pipeline = IngestionPipeline::new(PipelineConfig::default(), Arc::new(StubParser), Arc::new(BatchProcessor::new(BatchConfig::default(), None)));
        pipeline.start().await.unwrap();
        pipeline.ingest_change_event(change_event("widget.ts")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pipeline.get_metrics().events_per_second >= 0.0);
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pause_then_resume_round_trip() {
        let pipeline = IngestionPipeline::new(PipelineConfig::default(), Arc::new(StubParser), Arc::new(BatchProcessor::new(BatchConfig::default(), None)));
        pipeline.start().await.unwrap();
        pipeline.pause().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Paused);
        pipeline.resume().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        pipeline.stop().await.unwrap();
    }

    #[test]
    fn priority_formula_clamped() {
        let event = change_event("a.ts");
        let is_code_file = is_code_file(&event.file_path);
        let priority = (5 + 2 * is_code_file as u8 + 1 + 1).min(10);
        assert_eq!(priority, 9);
    }
}

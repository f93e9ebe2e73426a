// # Configuration
//
// Nested configuration consumed by the substrate. No file or env loader is
// implemented here (config-file ergonomics are the CLI's concern, out of
// scope for this crate); the struct is built programmatically or
// deserialized from an externally-sourced nested JSON/YAML object via
// `serde`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub parsers: usize,
    pub entity_workers: usize,
    pub relationship_workers: usize,
    pub embedding_workers: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { parsers: 4, entity_workers: 4, relationship_workers: 2, embedding_workers: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub entity_batch_size: usize,
    pub relationship_batch_size: usize,
    pub embedding_batch_size: usize,
    pub timeout_ms: u64,
    pub max_concurrent_batches: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            entity_batch_size: 100,
            relationship_batch_size: 100,
            embedding_batch_size: 50,
            timeout_ms: 5_000,
            max_concurrent_batches: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub max_size: usize,
    pub partition_count: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub backpressure_threshold: usize,
    pub enable_backpressure: bool,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            partition_count: 8,
            batch_size: 50,
            batch_timeout_ms: 1_000,
            retry_attempts: 5,
            retry_delay_ms: 500,
            backpressure_threshold: 5_000,
            enable_backpressure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub queue_depth: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self { queue_depth: 5_000.0, latency_ms: 2_000.0, error_rate: 0.1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub metrics_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub alert_thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { metrics_interval_ms: 5_000, health_check_interval_ms: 10_000, alert_thresholds: AlertThresholds::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: WorkersConfig,
    pub batching: BatchingConfig,
    pub queues: QueuesConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub health_check_interval: Duration,
    pub enable_load_balancing: bool,
    pub prefer_write_connections: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 20,
            acquire_timeout: secs(30),
            idle_timeout: secs(300),
            reap_interval: secs(60),
            health_check_interval: secs(30),
            enable_load_balancing: true,
            prefer_write_connections: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubChannels {
    pub global: String,
    pub session_prefix: String,
}

impl Default for PubSubChannels {
    fn default() -> Self {
        Self { global: "sessions:global".to_string(), session_prefix: "sessions:".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_ttl: Duration,
    pub checkpoint_interval: u64,
    pub max_events_per_session: usize,
    pub grace_ttl: Duration,
    pub enable_failure_snapshots: bool,
    pub pub_sub_channels: PubSubChannels,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl: secs(3_600),
            checkpoint_interval: 10,
            max_events_per_session: 10_000,
            grace_ttl: secs(300),
            enable_failure_snapshots: true,
            pub_sub_channels: PubSubChannels::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub retention_days: u32,
    pub sample_rate: f64,
    pub metrics_interval_ms: u64,
    pub enable_real_time_analytics: bool,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self { retention_days: 30, sample_rate: 1.0, metrics_interval_ms: 5_000, enable_real_time_analytics: true }
    }
}

/// Root configuration object. Consumed as a nested object; every field has
/// a default so partial JSON/YAML overrides deserialize cleanly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IngestConfig {
    pub pipeline: PipelineConfig,
    pub pool: PoolConfig,
    pub session: SessionConfig,
    pub analytics: AnalyticsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = IngestConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: IngestConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pool.max_connections, config.pool.max_connections);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let partial = r#"{"pool": {"max_connections": 50}}"#;
        let config: IngestConfig = serde_json::from_str(partial).unwrap();
        assert_eq!(config.pool.max_connections, 50);
        assert_eq!(config.pool.min_connections, 2);
        assert_eq!(config.pipeline.queues.partition_count, 8);
    }
}

// # Alerting and Telemetry
//
// Threshold-driven alerts and a lightweight counter/gauge registry shared by
// every component. Each component ticks its own metrics on a timer and hands
// `(name, value)` pairs to a shared `AlertManager`; breaches fire at most once
// per cool-down window.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A configured alert: `{name, threshold, severity}` plus the cool-down that
/// bounds notification rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub cooldown: Duration,
}

impl AlertThreshold {
    pub fn new(name: impl Into<String>, metric: impl Into<String>, threshold: f64, severity: AlertSeverity) -> Self {
        Self { name: name.into(), metric: metric.into(), threshold, severity, cooldown: Duration::from_secs(60) }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// An `alert:triggered` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub name: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub timestamp_ms: u64,
}

/// Shared alert dispatcher. Components register thresholds and feed metric
/// samples through `evaluate`; breaches are broadcast on `subscribe()` at
/// most once per threshold's cool-down window.
pub struct AlertManager {
    thresholds: DashMap<String, AlertThreshold>,
    last_fired_ms: DashMap<String, u64>,
    events: broadcast::Sender<AlertEvent>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { thresholds: DashMap::new(), last_fired_ms: DashMap::new(), events }
    }

    pub fn register(&self, threshold: AlertThreshold) {
        self.thresholds.insert(threshold.name.clone(), threshold);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    /// Feed a metric sample. Any registered threshold for `metric` whose
    /// value is breached fires, subject to its cool-down.
    pub fn evaluate(&self, metric: &str, value: f64) {
        let now = crate::common::now_millis();
        for entry in self.thresholds.iter() {
            let threshold = entry.value();
            if threshold.metric != metric || value < threshold.threshold {
                continue;
            }
            let last = self.last_fired_ms.get(&threshold.name).map(|v| *v).unwrap_or(0);
            if now.saturating_sub(last) < threshold.cooldown.as_millis() as u64 {
                continue;
            }
            self.last_fired_ms.insert(threshold.name.clone(), now);
            let event = AlertEvent {
                name: threshold.name.clone(),
                metric: metric.to_string(),
                value,
                threshold: threshold.threshold,
                severity: threshold.severity,
                timestamp_ms: now,
            };
            warn!(alert = %event.name, metric = %event.metric, value, threshold = event.threshold, "alert:triggered");
            let _ = self.events.send(event);
        }
    }
}

/// A monotonic counter.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A point-in-time gauge, stored as bits of an `f64`.
#[derive(Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// A bounded rolling sample window used for latency percentiles, e.g.
/// `averageLatency`/`p95Latency` over the last 1 000 samples.
pub struct RollingWindow {
    samples: RwLock<Vec<f64>>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self { samples: RwLock::new(Vec::with_capacity(capacity)), capacity }
    }

    pub fn record(&self, value: f64) {
        let mut samples = self.samples.write();
        if samples.len() == self.capacity {
            samples.remove(0);
        }
        samples.push(value);
    }

    pub fn average(&self) -> f64 {
        let samples = self.samples.read();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    pub fn percentile(&self, p: f64) -> f64 {
        let mut samples = self.samples.read().clone();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((samples.len() - 1) as f64 * p).round() as usize;
        samples[idx]
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-scoped registry of named counters/gauges a component can publish
/// without every metric needing its own struct field.
#[derive(Default)]
pub struct Telemetry {
    counters: DashMap<String, Arc<Counter>>,
    gauges: DashMap<String, Arc<Gauge>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.counters.entry(name.to_string()).or_insert_with(|| Arc::new(Counter::default())).clone()
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        self.gauges.entry(name.to_string()).or_insert_with(|| Arc::new(Gauge::default())).clone()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            counters: self.counters.iter().map(|e| (e.key().clone(), e.value().get())).collect(),
            gauges: self.gauges.iter().map(|e| (e.key().clone(), e.value().get())).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelemetrySnapshot {
    pub counters: Vec<(String, u64)>,
    pub gauges: Vec<(String, f64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_fires_once_within_cooldown() {
        let manager = AlertManager::new();
        manager.register(
            AlertThreshold::new("queue_depth_high", "queue_depth", 100.0, AlertSeverity::Warning)
                .with_cooldown(Duration::from_secs(3600)),
        );
        let mut rx = manager.subscribe();

        manager.evaluate("queue_depth", 150.0);
        manager.evaluate("queue_depth", 200.0);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "second breach within cooldown must not fire");
    }

    #[test]
    fn alert_does_not_fire_below_threshold() {
        let manager = AlertManager::new();
        manager.register(AlertThreshold::new("latency_high", "latency_ms", 2000.0, AlertSeverity::Error));
        let mut rx = manager.subscribe();

        manager.evaluate("latency_ms", 500.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rolling_window_percentile() {
        let window = RollingWindow::new(1000);
        for i in 1..=100 {
            window.record(i as f64);
        }
        assert_eq!(window.percentile(0.95), 96.0);
    }

    #[test]
    fn rolling_window_evicts_oldest_beyond_capacity() {
        let window = RollingWindow::new(3);
        window.record(1.0);
        window.record(2.0);
        window.record(3.0);
        window.record(4.0);
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), (2.0 + 3.0 + 4.0) / 3.0);
    }

    #[test]
    fn telemetry_counter_and_gauge() {
        let telemetry = Telemetry::new();
        telemetry.counter("events_total").inc();
        telemetry.counter("events_total").add(4);
        telemetry.gauge("cpu_percent").set(42.5);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.counters.iter().find(|(k, _)| k == "events_total").unwrap().1, 5);
        assert_eq!(snapshot.gauges.iter().find(|(k, _)| k == "cpu_percent").unwrap().1, 42.5);
    }
}

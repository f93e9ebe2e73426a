use crate::common::{now_millis, SessionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct SessionRecord {
    event_count: u64,
    per_agent_event_count: HashMap<String, u64>,
    processing_times_ms: Vec<f64>,
    peak_memory_bytes: u64,
    started_at_ms: u64,
    completed_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendWindow {
    Hour,
    Day,
    Week,
    Month,
}

impl TrendWindow {
    fn millis(&self) -> u64 {
        match self {
            TrendWindow::Hour => 3_600_000,
            TrendWindow::Day => 86_400_000,
            TrendWindow::Week => 7 * 86_400_000,
            TrendWindow::Month => 30 * 86_400_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrendReport {
    pub session_count: usize,
    pub average_duration_ms: f64,
    pub top_agents: Vec<(String, u64)>,
    pub top_event_types: Vec<(String, u64)>,
}

struct CompletionRecord {
    completed_at_ms: u64,
    duration_ms: f64,
    agents: Vec<String>,
    event_types: Vec<String>,
}

/// Per-session and global analytics: rolling counters behind a lock, plus a
/// `cleanup_old_data` retention sweep and formulas for collaboration score,
/// performance impact, and windowed trend reporting.
pub struct SessionAnalytics {
    retention: Duration,
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
    completions: RwLock<Vec<CompletionRecord>>,
    event_type_counts: RwLock<HashMap<String, u64>>,
}

impl SessionAnalytics {
    pub fn new(retention_days: u32) -> Self {
        Self {
            retention: Duration::from_secs(retention_days as u64 * 86_400),
            sessions: RwLock::new(HashMap::new()),
            completions: RwLock::new(Vec::new()),
            event_type_counts: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_event(&self, session_id: &str, agent: &str, event_type: &str, processing_time_ms: f64) {
        let mut sessions = self.sessions.write();
        let record = sessions.entry(session_id.to_string()).or_insert_with(|| SessionRecord {
            started_at_ms: now_millis(),
            ..Default::default()
        });
        record.event_count += 1;
        *record.per_agent_event_count.entry(agent.to_string()).or_insert(0) += 1;
        record.processing_times_ms.push(processing_time_ms);

        *self.event_type_counts.write().entry(event_type.to_string()).or_insert(0) += 1;
    }

    pub fn record_peak_memory(&self, session_id: &str, bytes: u64) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(session_id) {
            record.peak_memory_bytes = record.peak_memory_bytes.max(bytes);
        }
    }

    pub fn record_completion(&self, session_id: &str, event_types: Vec<String>) {
        let mut sessions = self.sessions.write();
        let Some(record) = sessions.get_mut(session_id) else { return };
        let now = now_millis();
        record.completed_at_ms = Some(now);
        let duration_ms = now.saturating_sub(record.started_at_ms) as f64;
        let agents: Vec<String> = record.per_agent_event_count.keys().cloned().collect();
        self.completions.write().push(CompletionRecord { completed_at_ms: now, duration_ms, agents, event_types });
    }

    /// `max(0, 1 - variance(perAgentEventCount) / mean^2)`. Zero when at
    /// most one agent has participated.
    pub fn collaboration_score(&self, session_id: &str) -> f64 {
        let sessions = self.sessions.read();
        let Some(record) = sessions.get(session_id) else { return 0.0 };
        let counts: Vec<f64> = record.per_agent_event_count.values().map(|v| *v as f64).collect();
        if counts.len() <= 1 {
            return 0.0;
        }
        let mean = counts.iter().sum::<f64>() / counts.len() as f64;
        if mean == 0.0 {
            return 0.0;
        }
        let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64;
        (1.0 - variance / mean.powi(2)).max(0.0)
    }

    /// Mean processing time across all recorded events for the session.
    pub fn performance_impact(&self, session_id: &str) -> f64 {
        let sessions = self.sessions.read();
        let Some(record) = sessions.get(session_id) else { return 0.0 };
        if record.processing_times_ms.is_empty() {
            return 0.0;
        }
        record.processing_times_ms.iter().sum::<f64>() / record.processing_times_ms.len() as f64
    }

    pub fn trend_analysis(&self, window: TrendWindow) -> TrendReport {
        let cutoff = now_millis().saturating_sub(window.millis());
        let completions = self.completions.read();
        let in_window: Vec<&CompletionRecord> = completions.iter().filter(|c| c.completed_at_ms >= cutoff).collect();

        if in_window.is_empty() {
            return TrendReport::default();
        }

        let average_duration_ms = in_window.iter().map(|c| c.duration_ms).sum::<f64>() / in_window.len() as f64;

        let mut agent_counts: HashMap<String, u64> = HashMap::new();
        let mut event_type_totals: HashMap<String, u64> = HashMap::new();
        for completion in &in_window {
            for agent in &completion.agents {
                *agent_counts.entry(agent.clone()).or_insert(0) += 1;
            }
            for event_type in &completion.event_types {
                *event_type_totals.entry(event_type.clone()).or_insert(0) += 1;
            }
        }

        let mut top_agents: Vec<(String, u64)> = agent_counts.into_iter().collect();
        top_agents.sort_by(|a, b| b.1.cmp(&a.1));
        top_agents.truncate(5);

        let mut top_event_types: Vec<(String, u64)> = event_type_totals.into_iter().collect();
        top_event_types.sort_by(|a, b| b.1.cmp(&a.1));
        top_event_types.truncate(10);

        TrendReport { session_count: in_window.len(), average_duration_ms, top_agents, top_event_types }
    }

    /// Removes rows older than `retentionDays`.
    pub fn cleanup_old_data(&self) {
        let cutoff = now_millis().saturating_sub(self.retention.as_millis() as u64);
        self.sessions.write().retain(|_, record| record.completed_at_ms.map(|t| t >= cutoff).unwrap_or(true));
        self.completions.write().retain(|c| c.completed_at_ms >= cutoff);
    }
}

use crate::common::SessionId;
use crate::error::{IngestError, Result};
use crate::external::KeyValueStore;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Working,
    Broken,
    Unknown,
}

impl SessionState {
    fn as_str(&self) -> &'static str {
        match self {
            SessionState::Working => "working",
            SessionState::Broken => "broken",
            SessionState::Unknown => "unknown",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "working" => SessionState::Working,
            "broken" => SessionState::Broken,
            _ => SessionState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    pub session_id: SessionId,
    pub agent_ids: Vec<String>,
    pub state: SessionState,
    pub event_count: u64,
    pub metadata: Json,
}

fn session_key(id: &str) -> String {
    format!("session:{id}")
}

fn events_key(id: &str) -> String {
    format!("events:{id}")
}

/// Two-key-per-session store atop the external `KeyValueStore`:
/// `session:<id>` holds attributes as a hash, `events:<id>` an ordered set
/// scored by `seq`. Both keys share a TTL.
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool> {
        self.kv.exists(&session_key(session_id)).await
    }

    pub async fn create(&self, session_id: &str, agent_id: &str, default_ttl: Duration) -> Result<()> {
        if self.exists(session_id).await? {
            return Err(IngestError::SessionExists { session_id: session_id.to_string() });
        }
        let key = session_key(session_id);
        self.kv.h_set(&key, "agentIds", &serde_json::to_string(&vec![agent_id])?).await?;
        self.kv.h_set(&key, "state", SessionState::Working.as_str()).await?;
        self.kv.h_set(&key, "metadata", "{}").await?;
        self.kv.h_set(&key, "eventCount", "0").await?;
        self.refresh_ttl(session_id, default_ttl).await?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionDocument>> {
        let key = session_key(session_id);
        if !self.kv.exists(&key).await? {
            return Ok(None);
        }
        let attrs = self.kv.h_get_all(&key).await?;
        let agent_ids: Vec<String> = attrs.get("agentIds").and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default();
        let state = attrs.get("state").map(|s| SessionState::parse(s)).unwrap_or(SessionState::Unknown);
        let metadata = attrs.get("metadata").and_then(|s| serde_json::from_str(s).ok()).unwrap_or(Json::Null);
        let event_count = attrs.get("eventCount").and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok(Some(SessionDocument { session_id: session_id.to_string(), agent_ids, state, event_count, metadata }))
    }

    pub async fn set_state(&self, session_id: &str, state: SessionState) -> Result<()> {
        self.kv.h_set(&session_key(session_id), "state", state.as_str()).await
    }

    pub async fn add_agent(&self, session_id: &str, agent_id: &str) -> Result<()> {
        let Some(doc) = self.get(session_id).await? else {
            return Err(IngestError::SessionNotFound { session_id: session_id.to_string() });
        };
        if doc.agent_ids.iter().any(|a| a == agent_id) {
            return Ok(());
        }
        let mut agents = doc.agent_ids;
        agents.push(agent_id.to_string());
        self.kv.h_set(&session_key(session_id), "agentIds", &serde_json::to_string(&agents)?).await
    }

    pub async fn remove_agent(&self, session_id: &str, agent_id: &str) -> Result<Vec<String>> {
        let Some(doc) = self.get(session_id).await? else {
            return Err(IngestError::SessionNotFound { session_id: session_id.to_string() });
        };
        let remaining: Vec<String> = doc.agent_ids.into_iter().filter(|a| a != agent_id).collect();
        self.kv.h_set(&session_key(session_id), "agentIds", &serde_json::to_string(&remaining)?).await?;
        Ok(remaining)
    }

    pub async fn next_seq(&self, session_id: &str) -> Result<u64> {
        let next = self.kv.h_incr_by(&session_key(session_id), "eventCount", 1).await?;
        Ok(next as u64)
    }

    pub async fn append_event(&self, session_id: &str, seq: u64, event_json: &str) -> Result<()> {
        self.kv.z_add(&events_key(session_id), seq as f64, event_json).await
    }

    pub async fn recent_events(&self, session_id: &str, n: i64) -> Result<Vec<String>> {
        self.kv.z_range(&events_key(session_id), -n, -1).await
    }

    pub async fn refresh_ttl(&self, session_id: &str, ttl: Duration) -> Result<()> {
        self.kv.expire(&session_key(session_id), ttl.as_secs()).await?;
        self.kv.expire(&events_key(session_id), ttl.as_secs()).await?;
        Ok(())
    }

    pub async fn publish(&self, session_id: &str, channel_prefix: &str, message: &str) -> Result<()> {
        self.kv.publish(&format!("{channel_prefix}{session_id}"), message).await
    }

    pub async fn ttl_remaining(&self, session_id: &str) -> Result<Option<u64>> {
        self.kv.ttl(&session_key(session_id)).await
    }

    pub async fn update_metadata(&self, session_id: &str, metadata: &Json) -> Result<()> {
        self.kv.h_set(&session_key(session_id), "metadata", &serde_json::to_string(metadata)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryKeyValueStore;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(InMemoryKeyValueStore::new()))
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = store();
        store.create("s1", "agentA", Duration::from_secs(60)).await.unwrap();
        let doc = store.get("s1").await.unwrap().unwrap();
        assert_eq!(doc.agent_ids, vec!["agentA".to_string()]);
        assert_eq!(doc.state, SessionState::Working);
    }

    #[tokio::test]
    async fn create_twice_fails_with_session_exists() {
        let store = store();
        store.create("s1", "agentA", Duration::from_secs(60)).await.unwrap();
        let err = store.create("s1", "agentB", Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(err.code(), "SessionExists");
    }

    #[tokio::test]
    async fn join_and_leave_updates_agent_set() {
        let store = store();
        store.create("s1", "agentA", Duration::from_secs(60)).await.unwrap();
        store.add_agent("s1", "agentB").await.unwrap();
        let doc = store.get("s1").await.unwrap().unwrap();
        assert!(doc.agent_ids.contains(&"agentA".to_string()));
        assert!(doc.agent_ids.contains(&"agentB".to_string()));

        let remaining = store.remove_agent("s1", "agentA").await.unwrap();
        assert_eq!(remaining, vec!["agentB".to_string()]);
    }
}

use crate::common::{now_millis, SessionId};
use crate::config::SessionConfig;
use crate::error::{IngestError, Result};
use crate::external::GraphBackend;
use crate::session::store::{SessionState, SessionStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEventType {
    Generic,
    Checkpoint,
    Handoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub seq: u64,
    pub event_type: SessionEventType,
    pub timestamp_ms: u64,
    pub actor: String,
    pub change_info: Json,
    pub state_transition: Option<StateTransition>,
    pub impact: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub to: SessionStateWire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStateWire {
    Working,
    Broken,
}

impl From<SessionStateWire> for SessionState {
    fn from(s: SessionStateWire) -> Self {
        match s {
            SessionStateWire::Working => SessionState::Working,
            SessionStateWire::Broken => SessionState::Broken,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAnchor {
    pub session_id: SessionId,
    pub checkpoint_id: String,
    pub outcome: String,
    pub key_impacts: Vec<String>,
    pub perf_delta: f64,
    pub actors: Vec<String>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EmitEventOpts {
    pub reset_ttl: Option<bool>,
    pub publish_update: Option<bool>,
    pub state_transition: Option<StateTransition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionManagerEvent {
    Created { session_id: SessionId },
    Resumed { session_id: SessionId },
    Handoff { session_id: SessionId, actor: String },
    Checkpointed { anchor: SessionAnchor },
    Cleaned { session_id: SessionId },
}

const ANCHOR_KEEP_LAST: usize = 5;
const CHECKPOINT_WINDOW: i64 = 20;

/// High-level session API: create/join/leave, emit-event, checkpoint,
/// cleanup. Anchors checkpoints into the knowledge graph via
/// `GraphBackend::append_session_anchor`.
pub struct SessionManager {
    store: SessionStore,
    config: SessionConfig,
    graph: Option<Arc<dyn GraphBackend>>,
    events: broadcast::Sender<SessionManagerEvent>,
}

impl SessionManager {
    pub fn new(store: SessionStore, config: SessionConfig, graph: Option<Arc<dyn GraphBackend>>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { store, config, graph, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionManagerEvent> {
        self.events.subscribe()
    }

    pub async fn create_session(&self, agent_id: &str) -> Result<SessionId> {
        let session_id: SessionId = Uuid::new_v4().to_string();
        self.store.create(&session_id, agent_id, self.config.default_ttl).await?;
        self.store.publish(&session_id, &self.config.pub_sub_channels.global, &format!("new:{session_id}")).await.ok();
        let _ = self.events.send(SessionManagerEvent::Created { session_id: session_id.clone() });
        info!(session_id = %session_id, agent_id, "session created");
        Ok(session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<crate::session::store::SessionDocument> {
        self.store.get(session_id).await?.ok_or_else(|| IngestError::SessionNotFound { session_id: session_id.to_string() })
    }

    pub async fn join_session(&self, session_id: &str, agent_id: &str) -> Result<()> {
        self.store.add_agent(session_id, agent_id).await?;
        self.emit_event(session_id, SessionEventType::Handoff, Json::Null, agent_id, EmitEventOpts::default()).await?;
        let _ = self.events.send(SessionManagerEvent::Handoff { session_id: session_id.to_string(), actor: agent_id.to_string() });
        Ok(())
    }

    pub async fn leave_session(&self, session_id: &str, agent_id: &str) -> Result<()> {
        let remaining = self.store.remove_agent(session_id, agent_id).await?;
        if remaining.is_empty() {
            self.store.refresh_ttl(session_id, self.config.grace_ttl).await?;
            self.schedule_cleanup(session_id, self.config.grace_ttl);
        }
        Ok(())
    }

    fn schedule_cleanup(&self, session_id: &str, after: std::time::Duration) {
        let session_id = session_id.to_string();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(SessionManagerEvent::Cleaned { session_id });
        });
    }

    /// `emitEvent`: assign seq, append to the ordered event
    /// set, apply any state transition, refresh TTL, publish an update, and
    /// trigger checkpoint every `checkpointInterval` events.
    pub async fn emit_event(
        &self,
        session_id: &str,
        event_type: SessionEventType,
        change_info: Json,
        actor: &str,
        opts: EmitEventOpts,
    ) -> Result<SessionEvent> {
        if !self.store.exists(session_id).await? {
            return Err(IngestError::SessionNotFound { session_id: session_id.to_string() });
        }

        let seq = self.store.next_seq(session_id).await?;
        let event = SessionEvent {
            seq,
            event_type,
            timestamp_ms: now_millis(),
            actor: actor.to_string(),
            change_info,
            state_transition: opts.state_transition.clone(),
            impact: None,
        };
        self.store.append_event(session_id, seq, &serde_json::to_string(&event)?).await?;

        if let Some(transition) = &opts.state_transition {
            self.store.set_state(session_id, transition.to.into()).await?;
        }

        if opts.reset_ttl.unwrap_or(true) {
            self.store.refresh_ttl(session_id, self.config.default_ttl).await?;
        }
        if opts.publish_update.unwrap_or(true) {
            self.store
                .publish(session_id, &self.config.pub_sub_channels.session_prefix, &format!("update:{seq}"))
                .await
                .ok();
        }

        let should_checkpoint = matches!(event.event_type, SessionEventType::Checkpoint)
            || (self.config.checkpoint_interval > 0 && seq % self.config.checkpoint_interval == 0);
        if should_checkpoint {
            if let Err(e) = self.checkpoint(session_id).await {
                warn!(session_id, error = %e, "checkpoint failed");
            }
        }

        Ok(event)
    }

    /// Aggregate the last 20 events into a `SessionAnchor` and attach it to
    /// every touched entity's `metadata.sessions`. Anchor-append
    /// failures are logged, never propagated.
    pub async fn checkpoint(&self, session_id: &str) -> Result<SessionAnchor> {
        let raw_events = self.store.recent_events(session_id, CHECKPOINT_WINDOW).await?;
        let events: Vec<SessionEvent> = raw_events.iter().filter_map(|s| serde_json::from_str(s).ok()).collect();

        let outcome = if events.iter().any(|e| matches!(e.state_transition, Some(ref t) if t.to == SessionStateWire::Broken)) {
            "broken"
        } else {
            "working"
        };

        let mut entity_ids: HashSet<String> = HashSet::new();
        for event in &events {
            if let Some(id) = event.change_info.get("entityId").and_then(|v| v.as_str()) {
                entity_ids.insert(id.to_string());
            }
        }

        let perf_delta = events.iter().filter_map(|e| e.impact).sum::<f64>() / events.len().max(1) as f64;
        let doc = self.get_session(session_id).await?;

        let anchor = SessionAnchor {
            session_id: session_id.to_string(),
            checkpoint_id: Uuid::new_v4().to_string(),
            outcome: outcome.to_string(),
            key_impacts: entity_ids.iter().cloned().collect(),
            perf_delta,
            actors: doc.agent_ids.clone(),
            timestamp_ms: now_millis(),
        };

        if let Some(graph) = &self.graph {
            for entity_id in &entity_ids {
                if let Err(e) = graph.append_session_anchor(entity_id, serde_json::to_value(&anchor)?, ANCHOR_KEEP_LAST).await {
                    warn!(entity_id, error = %e, "anchor append failed (non-critical)");
                }
            }
        }

        self.store.refresh_ttl(session_id, self.config.grace_ttl).await?;
        self.schedule_cleanup(session_id, self.config.grace_ttl);
        let _ = self.events.send(SessionManagerEvent::Checkpointed { anchor: anchor.clone() });
        Ok(anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InMemoryGraphBackend, InMemoryKeyValueStore};
    use serde_json::json;

    fn manager() -> SessionManager {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let graph = Arc::new(InMemoryGraphBackend::new());
        SessionManager::new(SessionStore::new(kv), SessionConfig::default(), Some(graph))
    }

    #[tokio::test]
    async fn create_join_leave_round_trip() {
        let manager = manager();
        let id = manager.create_session("agentA").await.unwrap();
        assert_eq!(manager.get_session(&id).await.unwrap().agent_ids, vec!["agentA".to_string()]);

        manager.join_session(&id, "agentB").await.unwrap();
        let doc = manager.get_session(&id).await.unwrap();
        assert!(doc.agent_ids.contains(&"agentA".to_string()));
        assert!(doc.agent_ids.contains(&"agentB".to_string()));

        manager.leave_session(&id, "agentA").await.unwrap();
        let doc = manager.get_session(&id).await.unwrap();
        assert_eq!(doc.agent_ids, vec!["agentB".to_string()]);
    }

    #[tokio::test]
    async fn tenth_event_triggers_automatic_checkpoint() {
        let manager = manager();
        let mut rx = manager.subscribe();
        let id = manager.create_session("agentA").await.unwrap();

        for i in 0..9 {
            manager.emit_event(&id, SessionEventType::Generic, json!({"i": i}), "agentA", EmitEventOpts::default()).await.unwrap();
        }
        manager
            .emit_event(&id, SessionEventType::Generic, json!({"entityId": "e1"}), "agentA", EmitEventOpts::default())
            .await
            .unwrap();

        let mut saw_checkpoint = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionManagerEvent::Checkpointed { .. }) {
                saw_checkpoint = true;
            }
        }
        assert!(saw_checkpoint);
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing() {
        let manager = manager();
        let id = manager.create_session("agentA").await.unwrap();
        let e1 = manager.emit_event(&id, SessionEventType::Generic, Json::Null, "agentA", EmitEventOpts::default()).await.unwrap();
        let e2 = manager.emit_event(&id, SessionEventType::Generic, Json::Null, "agentA", EmitEventOpts::default()).await.unwrap();
        assert!(e2.seq > e1.seq);
    }
}

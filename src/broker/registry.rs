//! Dual-indexed lookup of live agent sessions: by agent id and by public port.
//!
//! The registry owns no resources — it only tracks which session lives
//! under which keys. The broker's teardown path closes sockets and
//! releases the port; this type just keeps the two indexes consistent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::session::AgentSession;

/// Registry of live sessions, indexed both by `agent_id` and by
/// `public_port`. Both indexes are updated atomically together.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    by_agent_id: HashMap<String, Arc<AgentSession>>,
    port_to_agent: HashMap<u16, String>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, indexing it by both its `agent_id` and its
    /// `public_port`.
    pub fn insert(&self, session: Arc<AgentSession>) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.port_to_agent.insert(session.public_port, session.agent_id.clone());
        inner.by_agent_id.insert(session.agent_id.clone(), session);
    }

    /// Look up a session by agent id.
    pub fn get_by_id(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .by_agent_id
            .get(agent_id)
            .cloned()
    }

    /// Look up a session by its public port.
    pub fn get_by_port(&self, public_port: u16) -> Option<Arc<AgentSession>> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        let agent_id = inner.port_to_agent.get(&public_port)?;
        inner.by_agent_id.get(agent_id).cloned()
    }

    /// Remove a session from both indexes, returning it if it was present.
    pub fn remove(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let session = inner.by_agent_id.remove(agent_id)?;
        inner.port_to_agent.remove(&session.public_port);
        Some(session)
    }

    /// Snapshot of all live sessions.
    pub fn get_all(&self) -> Vec<Arc<AgentSession>> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .by_agent_id
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(agent_id: &str, public_port: u16) -> Arc<AgentSession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(AgentSession::new(
            agent_id.to_string(),
            "tok".to_string(),
            "127.0.0.1".to_string(),
            9,
            public_port,
            tx,
        ))
    }

    #[test]
    fn insert_and_lookup_both_indexes() {
        let registry = SessionRegistry::new();
        registry.insert(session("a1", 10100));
        assert!(registry.get_by_id("a1").is_some());
        assert!(registry.get_by_port(10100).is_some());
        assert!(registry.get_by_id("missing").is_none());
        assert!(registry.get_by_port(1).is_none());
    }

    #[test]
    fn remove_clears_both_indexes() {
        let registry = SessionRegistry::new();
        registry.insert(session("a1", 10100));
        assert!(registry.remove("a1").is_some());
        assert!(registry.get_by_id("a1").is_none());
        assert!(registry.get_by_port(10100).is_none());
    }

    #[test]
    fn get_all_returns_every_live_session() {
        let registry = SessionRegistry::new();
        registry.insert(session("a1", 10100));
        registry.insert(session("a2", 10101));
        let mut ids: Vec<String> = registry.get_all().iter().map(|s| s.agent_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a1".to_string(), "a2".to_string()]);
    }

    #[test]
    fn no_two_sessions_share_a_public_port_after_replace() {
        let registry = SessionRegistry::new();
        registry.insert(session("a1", 10100));
        registry.insert(session("a2", 10100));
        // Last insert under the same port wins the port index; only the
        // broker's registration path is responsible for not doing this for
        // two live agents (the allocator guarantees distinct ports).
        let by_port = registry.get_by_port(10100).unwrap();
        assert_eq!(by_port.agent_id, "a2");
    }
}

//! Session manager (C11): process-wide `client_id -> Session` registry
//! with serialized, idempotent creation.

use crate::mux::Multiplex;
use crate::session::Session;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Guards concurrent `get_or_create` calls for the same `client_id` so
/// exactly one `Session` is ever created per client.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: DashMap::new(),
            creation_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, client_id: &str) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Return the existing session for `client_id`, or build one from
    /// `mux` via `build` if none exists yet. Concurrent callers for the
    /// same `client_id` serialize on a per-key lock so only one session
    /// is ever created.
    pub async fn get_or_create(
        &self,
        client_id: &str,
        mux: Multiplex,
        version: &str,
    ) -> Arc<Session> {
        if let Some(existing) = self.sessions.get(client_id) {
            return existing.value().clone();
        }
        let lock = self.lock_for(client_id);
        let _guard = lock.lock().await;
        if let Some(existing) = self.sessions.get(client_id) {
            return existing.value().clone();
        }
        let session = Session::new(mux, version.to_string());
        self.sessions.insert(client_id.to_string(), session.clone());
        info!(client_id, "session created");
        session
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|r| r.value().clone())
    }

    pub async fn close_session(&self, client_id: &str) {
        if let Some((_, session)) = self.sessions.remove(client_id) {
            session.close().await;
            info!(client_id, "session closed");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn dummy_mux() -> Multiplex {
        let (a, _b) = duplex(1024);
        let (r, w) = tokio::io::split(a);
        Multiplex::new(r, w, false)
    }

    #[tokio::test]
    async fn one_session_per_client() {
        let manager = Arc::new(SessionManager::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get_or_create("client-a", dummy_mux(), "v1").await
            }));
        }
        let mut sessions = Vec::new();
        for h in handles {
            sessions.push(h.await.unwrap());
        }
        let first = Arc::as_ptr(&sessions[0]);
        for s in &sessions[1..] {
            assert_eq!(Arc::as_ptr(s), first);
        }
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn close_removes_session() {
        let manager = SessionManager::new();
        manager.get_or_create("client-b", dummy_mux(), "v1").await;
        assert_eq!(manager.len(), 1);
        manager.close_session("client-b").await;
        assert!(manager.is_empty());
    }
}

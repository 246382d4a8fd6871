//! Who is online.
//!
//! The registry is the only shared mutable structure in the relay. Every
//! operation takes the lock once, so check-and-insert in
//! [`Registry::register`] is atomic and snapshots never observe a
//! half-applied change. The registry performs no I/O; announcing joins and
//! leaves is the router's job.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::sync::Mutex;

use crate::{
    error::RegisterError,
    session::{SessionHandle, SessionId, fold_name},
};

struct Entry {
    joined: u64,
    session: SessionHandle,
}

#[derive(Default)]
struct Inner {
    sessions: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
    next_join: AtomicU64,
    /// Set by [`Registry::drain`]; only read or written under `sessions`.
    closed: AtomicBool,
}

/// Cheaply cloneable handle to the session table.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Inserts `session` unless a session with the same folded name exists or
    /// the registry has been drained.
    pub async fn register(&self, session: SessionHandle) -> Result<(), RegisterError> {
        let key = session.key();
        let mut sessions = self.inner.sessions.lock().await;
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(RegisterError::Closed);
        }
        if sessions.contains_key(&key) {
            return Err(RegisterError::NameTaken(session.name().to_string()));
        }
        let joined = self.inner.next_join.fetch_add(1, Ordering::Relaxed);
        sessions.insert(key, Entry { joined, session });
        Ok(())
    }

    /// Removes whatever session is registered under `name`. Idempotent.
    pub async fn unregister(&self, name: &str) -> Option<SessionHandle> {
        let mut sessions = self.inner.sessions.lock().await;
        sessions.remove(&fold_name(name)).map(|entry| entry.session)
    }

    /// Removes `session` only if it is still the registered holder of its
    /// name. Returns whether this call removed it.
    pub async fn release(&self, session: &SessionHandle) -> bool {
        let key = session.key();
        let mut sessions = self.inner.sessions.lock().await;
        match sessions.get(&key) {
            Some(entry) if entry.session.id() == session.id() => {
                sessions.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, name: &str) -> Option<SessionHandle> {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .get(&fold_name(name))
            .map(|entry| entry.session.clone())
    }

    /// Display names in join order.
    pub async fn snapshot_names(&self) -> Vec<String> {
        self.snapshot()
            .await
            .into_iter()
            .map(|session| session.name().to_string())
            .collect()
    }

    /// Live handles in join order.
    pub async fn snapshot(&self) -> Vec<SessionHandle> {
        let sessions = self.inner.sessions.lock().await;
        let mut entries: Vec<&Entry> = sessions.values().collect();
        entries.sort_by_key(|entry| entry.joined);
        entries
            .into_iter()
            .map(|entry| entry.session.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Empties the table for good and hands back every session that was in
    /// it. Later registrations fail with [`RegisterError::Closed`].
    pub async fn drain(&self) -> Vec<SessionHandle> {
        let mut sessions = self.inner.sessions.lock().await;
        self.inner.closed.store(true, Ordering::Relaxed);
        let mut entries: Vec<Entry> = sessions.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.joined);
        entries.into_iter().map(|entry| entry.session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(registry: &Registry, name: &str) -> SessionHandle {
        let (handle, _inbox) = SessionHandle::new(registry.next_id(), name, 8);
        handle
    }

    #[tokio::test]
    async fn rejects_duplicate_names() {
        let registry = Registry::new();
        registry
            .register(session(&registry, "alice"))
            .await
            .expect("first registration should pass");
        let result = registry.register(session(&registry, "alice")).await;
        assert_eq!(result, Err(RegisterError::NameTaken("alice".into())));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn names_are_unique_regardless_of_case() {
        let registry = Registry::new();
        registry.register(session(&registry, "Alice")).await.unwrap();
        assert!(registry.register(session(&registry, "ALICE")).await.is_err());

        let found = registry.lookup("alice").await.expect("case-insensitive lookup");
        assert_eq!(found.name(), "Alice");
    }

    #[tokio::test]
    async fn concurrent_registration_admits_exactly_one() {
        let registry = Registry::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, _inbox) = SessionHandle::new(registry.next_id(), "alice", 8);
                registry.register(handle).await
            }));
        }

        let mut admitted = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.expect("task panicked") {
                Ok(()) => admitted += 1,
                Err(RegisterError::NameTaken(_)) => rejected += 1,
                Err(other) => panic!("unexpected rejection: {other}"),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(rejected, 31);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn unregister_removes_lookup_and_snapshot_entry() {
        let registry = Registry::new();
        registry.register(session(&registry, "alice")).await.unwrap();
        registry.unregister("alice").await;

        assert!(registry.lookup("alice").await.is_none());
        assert!(!registry.snapshot_names().await.contains(&"alice".to_string()));
    }

    #[tokio::test]
    async fn unregister_twice_is_harmless() {
        let registry = Registry::new();
        registry.register(session(&registry, "alice")).await.unwrap();
        registry.register(session(&registry, "bob")).await.unwrap();

        assert!(registry.unregister("alice").await.is_some());
        assert!(registry.unregister("alice").await.is_none());
        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.snapshot_names().await, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_follows_join_order() {
        let registry = Registry::new();
        for name in ["carol", "alice", "bob"] {
            registry.register(session(&registry, name)).await.unwrap();
        }
        registry.unregister("alice").await;
        registry.register(session(&registry, "alice")).await.unwrap();

        assert_eq!(
            registry.snapshot_names().await,
            vec!["carol".to_string(), "bob".to_string(), "alice".to_string()]
        );
    }

    #[tokio::test]
    async fn stale_release_keeps_the_newer_session() {
        let registry = Registry::new();
        let old = session(&registry, "alice");
        registry.register(old.clone()).await.unwrap();
        assert!(registry.release(&old).await);

        let newer = session(&registry, "alice");
        registry.register(newer.clone()).await.unwrap();

        assert!(!registry.release(&old).await);
        let current = registry.lookup("alice").await.expect("newer session stays");
        assert_eq!(current.id(), newer.id());
    }

    #[tokio::test]
    async fn drain_empties_the_table() {
        let registry = Registry::new();
        registry.register(session(&registry, "alice")).await.unwrap();
        registry.register(session(&registry, "bob")).await.unwrap();

        let drained = registry.drain().await;
        let names: Vec<&str> = drained.iter().map(SessionHandle::name).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(registry.count().await, 0);
        assert!(registry.drain().await.is_empty());
    }

    #[tokio::test]
    async fn drained_registry_refuses_new_sessions() {
        let registry = Registry::new();
        registry.register(session(&registry, "alice")).await.unwrap();
        registry.drain().await;

        let result = registry.register(session(&registry, "bob")).await;
        assert_eq!(result, Err(RegisterError::Closed));
        assert_eq!(registry.count().await, 0);
    }
}

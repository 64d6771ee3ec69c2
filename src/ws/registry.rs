//! Connection registry: tracks the single active WebSocket connection per
//! user identity. No business logic lives here — the router decides who
//! gets what, the registry only answers "who is connected".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::ConnectionSender;

/// Process-wide counter for connection identities.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Non-owning reference to a live connection: a unique runtime identity plus
/// the sender half of the actor's outbound channel. The actor owns the
/// transport; the registry and router only hold clones of this handle.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: ConnectionSender,
}

impl ConnectionHandle {
    pub fn new(tx: ConnectionSender) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Unique runtime identity, stable for the life of the connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the transport side is still accepting frames.
    pub fn is_writable(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame for the writer task. Sending to a closed connection is
    /// a no-op that reports false, never an error.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Maps a user id to its single active connection.
/// At most one live handle per identity: the first connection wins and a
/// second register attempt for the same id is rejected.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Store the mapping unless the user already has a live handle.
    /// Returns false and leaves state unchanged on conflict.
    pub fn register(&self, user_id: &str, handle: ConnectionHandle) -> bool {
        match self.inner.entry(user_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(handle);
                true
            }
        }
    }

    /// Remove the entry whose handle matches, returning the freed user id.
    /// Unregistering a handle that was never registered (the connection
    /// closed before authenticating) is a no-op.
    pub fn unregister(&self, handle: &ConnectionHandle) -> Option<String> {
        let user_id = self
            .inner
            .iter()
            .find_map(|entry| (entry.value().id == handle.id).then(|| entry.key().clone()))?;

        self.inner
            .remove_if(&user_id, |_, registered| registered.id == handle.id)
            .map(|(user_id, _)| user_id)
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.inner.contains_key(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.inner.get(user_id).map(|entry| entry.value().clone())
    }

    /// Point-in-time copy of the live connection map. Fan-out iterates this
    /// snapshot so no shard lock is held while sending.
    pub fn snapshot(&self) -> HashMap<String, ConnectionHandle> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Push a server-originated frame to a specific connected user.
    /// Used by the HTTP layer to inject notifications out-of-band.
    /// Returns false when the user has no live, writable connection.
    pub fn push_to_user(&self, user_id: &str, frame: Message) -> bool {
        match self.get(user_id) {
            Some(handle) if handle.is_writable() => handle.send(frame),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    // Keep the returned receiver alive for the test's duration so the
    // channel stays open.
    fn test_conn() -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(tx), rx)
    }

    #[test]
    fn test_register_distinct_ids() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = test_conn();
        let (b, _b_rx) = test_conn();
        let (c, _c_rx) = test_conn();
        assert!(registry.register("u1", a));
        assert!(registry.register("u2", b));
        assert!(registry.register("u3", c));

        assert_eq!(registry.len(), 3);
        assert!(registry.is_connected("u1"));
        assert!(registry.is_connected("u2"));
        assert!(registry.is_connected("u3"));
        assert!(!registry.is_connected("u4"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ConnectionRegistry::new();
        let (first, _first_rx) = test_conn();
        let (second, _second_rx) = test_conn();
        let first_id = first.id();

        assert!(registry.register("u1", first));
        assert!(!registry.register("u1", second));

        // First registration is unaffected
        assert_eq!(registry.get("u1").unwrap().id(), first_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_by_handle() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = test_conn();
        let (b, _b_rx) = test_conn();
        registry.register("u1", a.clone());
        registry.register("u2", b);

        assert_eq!(registry.unregister(&a), Some("u1".to_string()));
        assert!(!registry.is_connected("u1"));
        assert!(registry.is_connected("u2"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_unknown_handle_is_noop() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = test_conn();
        registry.register("u1", a);

        let (stranger, _stranger_rx) = test_conn();
        assert_eq!(registry.unregister(&stranger), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = test_conn();
        registry.register("u1", a.clone());

        let snap = registry.snapshot();
        registry.unregister(&a);

        assert!(snap.contains_key("u1"));
        assert!(!registry.is_connected("u1"));
    }

    #[test]
    fn test_push_to_user() {
        let registry = ConnectionRegistry::new();
        let (h, mut rx) = test_conn();
        registry.register("u1", h);

        assert!(registry.push_to_user("u1", Message::Text("{\"type\":\"notice\"}".into())));
        assert!(matches!(rx.try_recv(), Ok(Message::Text(_))));

        assert!(!registry.push_to_user("u2", Message::Text("{}".into())));
    }

    #[test]
    fn test_send_to_closed_handle_is_noop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let h = ConnectionHandle::new(tx);
        drop(rx);

        assert!(!h.is_writable());
        assert!(!h.send(Message::Text("{}".into())));
    }
}

//! Event router: turns decoded inbound events into registry lookups,
//! persistence calls, and fan-out sends.
//!
//! One flat dispatch function over the tagged union, one free function per
//! variant. Every error is scoped to the originating connection and reported
//! back to it only; nothing here is fatal to the process.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};

use crate::gateway::{NewMessage, PersistenceGateway};
use crate::ws::protocol::{
    self, InboundEvent, MessageEvent, MessageFrame, OutboundEvent, PresenceStatus, TypingEvent,
    UserStatusEvent,
};
use crate::ws::registry::{ConnectionHandle, ConnectionRegistry};

/// Per-connection authentication state machine. Closed is implicit: the
/// lifecycle actor stops dispatching once the transport goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    Unauthenticated,
    Authenticated { user_id: String },
}

impl ConnState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, ConnState::Authenticated { .. })
    }
}

/// Decode a raw text frame and dispatch it. Decode failures are reported to
/// the originating connection only; the connection survives.
pub async fn handle_frame(
    raw: &str,
    conn: &ConnectionHandle,
    conn_state: &mut ConnState,
    registry: &ConnectionRegistry,
    gateway: &Arc<dyn PersistenceGateway>,
) {
    let event = match protocol::decode(raw) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(
                connection_id = conn.id(),
                error = %err,
                "Rejected undecodable frame"
            );
            let reply = match err.received_type() {
                Some(token) => OutboundEvent::Error {
                    error: "unknown message type".to_string(),
                    details: None,
                    received_type: Some(token.to_string()),
                },
                None => OutboundEvent::Error {
                    error: "malformed frame".to_string(),
                    details: Some(err.to_string()),
                    received_type: None,
                },
            };
            send_event(conn, &reply);
            return;
        }
    };

    dispatch(event, conn, conn_state, registry, gateway).await;
}

/// Dispatch one decoded event according to the connection's auth state.
/// Only `authenticate` may transition out of `Unauthenticated`; everything
/// else is rejected (not silently dropped) until then, so the client can
/// retry after authenticating.
pub async fn dispatch(
    event: InboundEvent,
    conn: &ConnectionHandle,
    conn_state: &mut ConnState,
    registry: &ConnectionRegistry,
    gateway: &Arc<dyn PersistenceGateway>,
) {
    match event {
        InboundEvent::Authenticate { user_id } => {
            handle_authenticate(user_id, conn, conn_state, registry);
        }
        _ if !conn_state.is_authenticated() => {
            tracing::debug!(connection_id = conn.id(), "Event rejected: not authenticated");
            send_event(conn, &OutboundEvent::error("authentication required"));
        }
        InboundEvent::Typing(event) => handle_typing(event, registry),
        InboundEvent::Message(event) => handle_message(event, conn, registry, gateway).await,
        InboundEvent::UserStatus(event) => handle_user_status(event, conn, gateway).await,
    }
}

fn handle_authenticate(
    user_id: String,
    conn: &ConnectionHandle,
    conn_state: &mut ConnState,
    registry: &ConnectionRegistry,
) {
    if let ConnState::Authenticated { user_id: current } = conn_state {
        // One identity per connection. Re-binding a live connection to a
        // different id would leave a stale registry entry behind.
        tracing::debug!(
            connection_id = conn.id(),
            user_id = %current,
            "Repeated authenticate rejected"
        );
        send_event(conn, &OutboundEvent::error("already authenticated"));
        return;
    }

    if registry.register(&user_id, conn.clone()) {
        tracing::info!(
            user_id = %user_id,
            connection_id = conn.id(),
            connections = registry.len(),
            "Connection authenticated"
        );
        *conn_state = ConnState::Authenticated { user_id };
    } else {
        // First connection wins; the existing registration keeps running.
        tracing::debug!(
            user_id = %user_id,
            connection_id = conn.id(),
            "Duplicate registration rejected"
        );
        send_event(conn, &OutboundEvent::error("registration failed"));
    }
}

/// Relay a typing indicator to every connected participant except the
/// sender. The sender is never echoed, even if listed in `participants`.
fn handle_typing(event: TypingEvent, registry: &ConnectionRegistry) {
    let connected = registry.snapshot();
    let frame = OutboundEvent::Typing(event.clone());

    for participant in &event.participants {
        if participant.id == event.sender.id {
            continue;
        }
        if let Some(handle) = connected.get(&participant.id) {
            send_event(handle, &frame);
        }
    }
}

/// Persist a chat message, then fan it out. A message the store did not
/// accept is never delivered; a saved message reaches every connected
/// participant exactly once, the sender included.
async fn handle_message(
    event: MessageEvent,
    conn: &ConnectionHandle,
    registry: &ConnectionRegistry,
    gateway: &Arc<dyn PersistenceGateway>,
) {
    let record = match gateway
        .save_message(NewMessage {
            sender_id: event.sender.id.clone(),
            conversation_id: event.conversation.clone(),
            content: event.content.clone(),
            content_type: event.content_type,
        })
        .await
    {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(
                sender = %event.sender.id,
                conversation = %event.conversation,
                error = %err,
                "Message persistence failed"
            );
            send_event(
                conn,
                &OutboundEvent::Error {
                    error: "failed to save message".to_string(),
                    details: Some(err.to_string()),
                    received_type: None,
                },
            );
            return;
        }
    };

    tracing::debug!(
        message_id = %record.id,
        conversation = %event.conversation,
        "Message persisted"
    );

    let frame = OutboundEvent::Message(MessageFrame {
        id: record.id,
        sender: event.sender.clone(),
        participants: event.participants.clone(),
        conversation: event.conversation,
        content: event.content,
        content_type: event.content_type,
        timestamp: record.created_at,
    });

    // Echo to the originating connection first: the sender needs the
    // server-assigned id to reconcile its optimistic local copy.
    send_event(conn, &frame);

    let connected = registry.snapshot();
    let mut delivered: HashSet<&str> = HashSet::new();
    delivered.insert(event.sender.id.as_str());

    for participant in &event.participants {
        if !delivered.insert(participant.id.as_str()) {
            continue;
        }
        // Offline participants are skipped: delivery is best-effort,
        // online-only. No queuing, no retry.
        if let Some(handle) = connected.get(&participant.id) {
            send_event(handle, &frame);
        }
    }
}

/// Apply a presence update to the user directory. An update that matches
/// the stored status and last-seen exactly is a no-op.
async fn handle_user_status(
    event: UserStatusEvent,
    conn: &ConnectionHandle,
    gateway: &Arc<dyn PersistenceGateway>,
) {
    let user = match gateway.get_user(&event.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            send_event(conn, &OutboundEvent::error("user not found"));
            return;
        }
        Err(err) => {
            tracing::warn!(user_id = %event.user_id, error = %err, "User lookup failed");
            send_event(
                conn,
                &OutboundEvent::Error {
                    error: "failed to update user".to_string(),
                    details: Some(err.to_string()),
                    received_type: None,
                },
            );
            return;
        }
    };

    // Redundant updates short-circuit without a directory write.
    if user.status == event.status && user.last_seen == event.last_seen {
        return;
    }

    let last_seen = match event.last_seen {
        Some(ts) => Some(ts),
        None if event.status == PresenceStatus::Offline => Some(Utc::now()),
        None => user.last_seen,
    };

    if let Err(err) = gateway
        .update_user_presence(&event.user_id, event.status, last_seen)
        .await
    {
        tracing::warn!(user_id = %event.user_id, error = %err, "Presence update failed");
        send_event(
            conn,
            &OutboundEvent::Error {
                error: "failed to update user".to_string(),
                details: Some(err.to_string()),
                received_type: None,
            },
        );
    }

    // Fan-out of the new status to the user's contacts would go here; see
    // broadcast_user_status.
}

/// Presence-change fan-out to other connected users. Deliberately not wired
/// into the user-status path until a contact model exists.
#[allow(dead_code)]
pub fn broadcast_user_status(
    registry: &ConnectionRegistry,
    user_id: &str,
    status: PresenceStatus,
    last_seen: Option<DateTime<Utc>>,
) {
    let frame = OutboundEvent::UserStatus {
        user_id: user_id.to_string(),
        status,
        last_seen,
    };
    for handle in registry.snapshot().values() {
        send_event(handle, &frame);
    }
}

/// Encode and queue an outbound event. Send failures (connection already
/// closed) are logged and discarded, never propagated.
pub(crate) fn send_event(conn: &ConnectionHandle, event: &OutboundEvent) {
    match protocol::encode(event) {
        Ok(text) => {
            if !conn.send(Message::Text(text.into())) {
                tracing::debug!(connection_id = conn.id(), "Dropped frame for closed connection");
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "Failed to encode outbound event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MessageRecord, PersistError, UserPresence};
    use crate::ws::protocol::Peer;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// In-memory gateway capturing calls, so dispatch rules can be checked
    /// without a database.
    #[derive(Default)]
    struct MockGateway {
        fail_save: bool,
        fail_get_user: bool,
        fail_presence: bool,
        users: Mutex<Vec<UserPresence>>,
        presence_writes: Mutex<Vec<(String, PresenceStatus, Option<DateTime<Utc>>)>>,
    }

    #[async_trait]
    impl PersistenceGateway for MockGateway {
        async fn save_message(&self, message: NewMessage) -> Result<MessageRecord, PersistError> {
            if self.fail_save {
                return Err(PersistError::Unavailable("store offline".to_string()));
            }
            Ok(MessageRecord {
                id: "m1".to_string(),
                sender_id: message.sender_id,
                conversation_id: message.conversation_id,
                content: message.content,
                content_type: message.content_type,
                created_at: Utc.with_ymd_and_hms(2025, 1, 5, 10, 0, 0).unwrap(),
            })
        }

        async fn get_user(&self, user_id: &str) -> Result<Option<UserPresence>, PersistError> {
            if self.fail_get_user {
                return Err(PersistError::Unavailable("store offline".to_string()));
            }
            Ok(self
                .users
                .lock()
                .unwrap()
                .iter()
                .find(|u| u.user_id == user_id)
                .cloned())
        }

        async fn update_user_presence(
            &self,
            user_id: &str,
            status: PresenceStatus,
            last_seen: Option<DateTime<Utc>>,
        ) -> Result<(), PersistError> {
            if self.fail_presence {
                return Err(PersistError::Unavailable("store offline".to_string()));
            }
            self.presence_writes
                .lock()
                .unwrap()
                .push((user_id.to_string(), status, last_seen));
            Ok(())
        }
    }

    fn test_conn() -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(tx), rx)
    }

    fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        match rx.try_recv().expect("Expected a frame") {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("Expected text frame, got: {:?}", other),
        }
    }

    fn assert_no_frame(rx: &mut mpsc::UnboundedReceiver<Message>) {
        assert!(rx.try_recv().is_err(), "Expected no frame");
    }

    fn peer(id: &str) -> Peer {
        Peer { id: id.to_string() }
    }

    fn message_event(sender: &str, participants: &[&str]) -> InboundEvent {
        InboundEvent::Message(MessageEvent {
            sender: peer(sender),
            participants: participants.iter().map(|p| peer(p)).collect(),
            conversation: "c1".to_string(),
            content: "hi".to_string(),
            content_type: crate::ws::protocol::ContentType::Text,
        })
    }

    fn gateway(mock: MockGateway) -> Arc<dyn PersistenceGateway> {
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_authenticate_transitions_and_registers() {
        let registry = ConnectionRegistry::new();
        let gw = gateway(MockGateway::default());
        let (conn, mut rx) = test_conn();
        let mut state = ConnState::Unauthenticated;

        dispatch(
            InboundEvent::Authenticate {
                user_id: "u1".to_string(),
            },
            &conn,
            &mut state,
            &registry,
            &gw,
        )
        .await;

        assert_eq!(
            state,
            ConnState::Authenticated {
                user_id: "u1".to_string()
            }
        );
        assert!(registry.is_connected("u1"));
        assert_no_frame(&mut rx);
    }

    #[tokio::test]
    async fn test_duplicate_registration_first_wins() {
        let registry = ConnectionRegistry::new();
        let gw = gateway(MockGateway::default());

        let (first, mut first_rx) = test_conn();
        let mut first_state = ConnState::Unauthenticated;
        dispatch(
            InboundEvent::Authenticate {
                user_id: "u1".to_string(),
            },
            &first,
            &mut first_state,
            &registry,
            &gw,
        )
        .await;

        let (second, mut second_rx) = test_conn();
        let mut second_state = ConnState::Unauthenticated;
        dispatch(
            InboundEvent::Authenticate {
                user_id: "u1".to_string(),
            },
            &second,
            &mut second_state,
            &registry,
            &gw,
        )
        .await;

        // Second connection gets the error; first is untouched
        let frame = recv_frame(&mut second_rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error"], "registration failed");
        assert_eq!(second_state, ConnState::Unauthenticated);

        assert_eq!(registry.get("u1").unwrap().id(), first.id());
        assert_no_frame(&mut first_rx);
    }

    #[tokio::test]
    async fn test_unauthenticated_events_rejected() {
        let registry = ConnectionRegistry::new();
        let gw = gateway(MockGateway::default());
        let (conn, mut rx) = test_conn();
        let mut state = ConnState::Unauthenticated;

        dispatch(message_event("u1", &["u2"]), &conn, &mut state, &registry, &gw).await;

        let frame = recv_frame(&mut rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error"], "authentication required");
        assert_eq!(state, ConnState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_message_persist_failure_no_fanout() {
        let registry = ConnectionRegistry::new();
        let gw = gateway(MockGateway {
            fail_save: true,
            ..Default::default()
        });

        let (sender, mut sender_rx) = test_conn();
        let (recipient, mut recipient_rx) = test_conn();
        registry.register("u1", sender.clone());
        registry.register("u2", recipient.clone());
        let mut state = ConnState::Authenticated {
            user_id: "u1".to_string(),
        };

        dispatch(message_event("u1", &["u2"]), &sender, &mut state, &registry, &gw).await;

        // Exactly one error to the sender, zero message frames anywhere
        let frame = recv_frame(&mut sender_rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error"], "failed to save message");
        assert!(frame["details"].is_string());
        assert_no_frame(&mut sender_rx);
        assert_no_frame(&mut recipient_rx);
    }

    #[tokio::test]
    async fn test_message_fanout_sender_receives_one_copy() {
        let registry = ConnectionRegistry::new();
        let gw = gateway(MockGateway::default());

        let (sender, mut sender_rx) = test_conn();
        let (recipient, mut recipient_rx) = test_conn();
        registry.register("u1", sender.clone());
        registry.register("u2", recipient.clone());
        let mut state = ConnState::Authenticated {
            user_id: "u1".to_string(),
        };

        // Sender lists itself in participants; u3 is not connected
        dispatch(
            message_event("u1", &["u1", "u2", "u3"]),
            &sender,
            &mut state,
            &registry,
            &gw,
        )
        .await;

        let sender_frame = recv_frame(&mut sender_rx);
        let recipient_frame = recv_frame(&mut recipient_rx);

        assert_eq!(sender_frame["type"], "message");
        assert_eq!(sender_frame["_id"], "m1");
        assert_eq!(sender_frame["content"], "hi");
        assert_eq!(recipient_frame["_id"], sender_frame["_id"]);

        // No duplicate echo to the sender
        assert_no_frame(&mut sender_rx);
        assert_no_frame(&mut recipient_rx);
    }

    #[tokio::test]
    async fn test_typing_never_echoed_to_sender() {
        let registry = ConnectionRegistry::new();
        let gw = gateway(MockGateway::default());

        let (sender, mut sender_rx) = test_conn();
        let (recipient, mut recipient_rx) = test_conn();
        registry.register("u1", sender.clone());
        registry.register("u2", recipient.clone());
        let mut state = ConnState::Authenticated {
            user_id: "u1".to_string(),
        };

        // Sender listed in participants on purpose
        dispatch(
            InboundEvent::Typing(TypingEvent {
                is_typing: true,
                sender: peer("u1"),
                participants: vec![peer("u1"), peer("u2")],
                conversation: "c1".to_string(),
            }),
            &sender,
            &mut state,
            &registry,
            &gw,
        )
        .await;

        let frame = recv_frame(&mut recipient_rx);
        assert_eq!(frame["type"], "typing");
        assert_eq!(frame["isTyping"], true);
        assert_no_frame(&mut sender_rx);
    }

    #[tokio::test]
    async fn test_user_status_identical_update_is_noop() {
        let last_seen = Some(Utc.with_ymd_and_hms(2025, 1, 5, 9, 0, 0).unwrap());
        let mock = MockGateway::default();
        mock.users.lock().unwrap().push(UserPresence {
            user_id: "u9".to_string(),
            status: PresenceStatus::Online,
            last_seen,
        });
        let registry = ConnectionRegistry::new();
        let gw = gateway(mock);
        let (conn, mut rx) = test_conn();
        let mut state = ConnState::Authenticated {
            user_id: "u1".to_string(),
        };

        dispatch(
            InboundEvent::UserStatus(UserStatusEvent {
                user_id: "u9".to_string(),
                status: PresenceStatus::Online,
                last_seen,
            }),
            &conn,
            &mut state,
            &registry,
            &gw,
        )
        .await;

        assert_no_frame(&mut rx);
    }

    #[tokio::test]
    async fn test_user_status_offline_stamps_last_seen() {
        let mock = MockGateway::default();
        mock.users.lock().unwrap().push(UserPresence {
            user_id: "u9".to_string(),
            status: PresenceStatus::Online,
            last_seen: None,
        });
        let registry = ConnectionRegistry::new();
        let gw = Arc::new(mock);
        let gw_dyn: Arc<dyn PersistenceGateway> = gw.clone();
        let (conn, mut rx) = test_conn();
        let mut state = ConnState::Authenticated {
            user_id: "u1".to_string(),
        };

        dispatch(
            InboundEvent::UserStatus(UserStatusEvent {
                user_id: "u9".to_string(),
                status: PresenceStatus::Offline,
                last_seen: None,
            }),
            &conn,
            &mut state,
            &registry,
            &gw_dyn,
        )
        .await;

        let writes = gw.presence_writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "u9");
        assert_eq!(writes[0].1, PresenceStatus::Offline);
        assert!(writes[0].2.is_some(), "Offline transition stamps last_seen");
        assert_no_frame(&mut rx);
    }

    #[tokio::test]
    async fn test_user_status_unknown_user() {
        let registry = ConnectionRegistry::new();
        let gw = gateway(MockGateway::default());
        let (conn, mut rx) = test_conn();
        let mut state = ConnState::Authenticated {
            user_id: "u1".to_string(),
        };

        dispatch(
            InboundEvent::UserStatus(UserStatusEvent {
                user_id: "ghost".to_string(),
                status: PresenceStatus::Online,
                last_seen: None,
            }),
            &conn,
            &mut state,
            &registry,
            &gw,
        )
        .await;

        let frame = recv_frame(&mut rx);
        assert_eq!(frame["error"], "user not found");
    }

    #[tokio::test]
    async fn test_user_status_lookup_failure_reports_error() {
        let registry = ConnectionRegistry::new();
        let gw = gateway(MockGateway {
            fail_get_user: true,
            ..Default::default()
        });
        let (conn, mut rx) = test_conn();
        let mut state = ConnState::Authenticated {
            user_id: "u1".to_string(),
        };

        dispatch(
            InboundEvent::UserStatus(UserStatusEvent {
                user_id: "u9".to_string(),
                status: PresenceStatus::Online,
                last_seen: None,
            }),
            &conn,
            &mut state,
            &registry,
            &gw,
        )
        .await;

        // Exactly one error frame to the sender
        let frame = recv_frame(&mut rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error"], "failed to update user");
        assert!(frame["details"].is_string());
        assert_no_frame(&mut rx);
    }

    #[tokio::test]
    async fn test_user_status_write_failure_reports_error() {
        let mock = MockGateway {
            fail_presence: true,
            ..Default::default()
        };
        mock.users.lock().unwrap().push(UserPresence {
            user_id: "u9".to_string(),
            status: PresenceStatus::Online,
            last_seen: None,
        });
        let registry = ConnectionRegistry::new();
        let gw = gateway(mock);
        let (conn, mut rx) = test_conn();
        let mut state = ConnState::Authenticated {
            user_id: "u1".to_string(),
        };

        // Status differs from the stored one, so the write path runs
        dispatch(
            InboundEvent::UserStatus(UserStatusEvent {
                user_id: "u9".to_string(),
                status: PresenceStatus::Offline,
                last_seen: None,
            }),
            &conn,
            &mut state,
            &registry,
            &gw,
        )
        .await;

        let frame = recv_frame(&mut rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error"], "failed to update user");
        assert!(frame["details"].is_string());
        assert_no_frame(&mut rx);
    }

    #[tokio::test]
    async fn test_unknown_type_replies_error_without_state_change() {
        let registry = ConnectionRegistry::new();
        let gw = gateway(MockGateway::default());
        let (conn, mut rx) = test_conn();
        let mut state = ConnState::Unauthenticated;

        handle_frame(r#"{"type":"dance"}"#, &conn, &mut state, &registry, &gw).await;

        let frame = recv_frame(&mut rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error"], "unknown message type");
        assert_eq!(frame["receivedType"], "dance");
        assert_eq!(state, ConnState::Unauthenticated);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_authenticate_rejected() {
        let registry = ConnectionRegistry::new();
        let gw = gateway(MockGateway::default());
        let (conn, mut rx) = test_conn();
        let mut state = ConnState::Authenticated {
            user_id: "u1".to_string(),
        };
        registry.register("u1", conn.clone());

        dispatch(
            InboundEvent::Authenticate {
                user_id: "u2".to_string(),
            },
            &conn,
            &mut state,
            &registry,
            &gw,
        )
        .await;

        let frame = recv_frame(&mut rx);
        assert_eq!(frame["error"], "already authenticated");
        assert!(registry.is_connected("u1"));
        assert!(!registry.is_connected("u2"));
    }
}

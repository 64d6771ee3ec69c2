//! Persistence gateway: thin async adapter over the durable message store
//! and the user directory.
//!
//! The event router only ever sees this trait — store failures surface as a
//! uniform `PersistError` and are reported back to the originating
//! connection, never fanned out.

pub mod sqlite;

pub use sqlite::SqliteGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ws::protocol::{ContentType, PresenceStatus};

/// Any failure talking to the durable store. The router treats all causes
/// uniformly, so the variants exist for logging only.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Fields the router supplies when creating a message record.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub conversation_id: String,
    pub content: String,
    pub content_type: ContentType,
}

/// A persisted message with its server-assigned id and timestamp.
/// Never mutated by the relay after creation.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub sender_id: String,
    pub conversation_id: String,
    pub content: String,
    pub content_type: ContentType,
    pub created_at: DateTime<Utc>,
}

/// Presence fields read from the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPresence {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Async seam between the router and the durable store. All calls suspend
/// only the issuing connection's task; implementations must not block the
/// shared dispatch path.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Single atomic create. The persisted record carries the
    /// server-assigned id and timestamp the relay echoes back to the sender.
    async fn save_message(&self, message: NewMessage) -> Result<MessageRecord, PersistError>;

    /// Read a user's presence fields. `Ok(None)` means the user does not
    /// exist in the directory.
    async fn get_user(&self, user_id: &str) -> Result<Option<UserPresence>, PersistError>;

    /// Write status and last-seen for a user.
    async fn update_user_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<(), PersistError>;
}

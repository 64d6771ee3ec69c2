use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::DbPool;
use crate::ws::protocol::{ContentType, PresenceStatus};

use super::{MessageRecord, NewMessage, PersistError, PersistenceGateway, UserPresence};

/// Gateway backed by the shared SQLite connection.
/// rusqlite is synchronous, so every call runs under spawn_blocking and
/// holds the connection lock only for the duration of its own statements.
pub struct SqliteGateway {
    db: DbPool,
}

impl SqliteGateway {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn lock_poisoned() -> PersistError {
    PersistError::Unavailable("connection lock poisoned".to_string())
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn save_message(&self, message: NewMessage) -> Result<MessageRecord, PersistError> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_poisoned())?;

            let id = Uuid::now_v7().to_string();
            let created_at = Utc::now();

            conn.execute(
                "INSERT INTO messages (id, sender_id, conversation_id, content, content_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id,
                    message.sender_id,
                    message.conversation_id,
                    message.content,
                    message.content_type.as_str(),
                    created_at.to_rfc3339(),
                ],
            )?;

            Ok(MessageRecord {
                id,
                sender_id: message.sender_id,
                conversation_id: message.conversation_id,
                content: message.content,
                content_type: message.content_type,
                created_at,
            })
        })
        .await
        .map_err(|e| PersistError::Unavailable(e.to_string()))?
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserPresence>, PersistError> {
        let db = self.db.clone();
        let uid = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_poisoned())?;

            let row: Option<(String, String, Option<String>)> = conn
                .query_row(
                    "SELECT id, status, last_seen FROM users WHERE id = ?1",
                    rusqlite::params![uid],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            Ok(row.map(|(id, status, last_seen)| UserPresence {
                user_id: id,
                // Rows predating the relay may carry values outside the
                // presence enum; treat them as offline.
                status: PresenceStatus::from_str(&status).unwrap_or(PresenceStatus::Offline),
                last_seen: last_seen
                    .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
                    .map(|ts| ts.with_timezone(&Utc)),
            }))
        })
        .await
        .map_err(|e| PersistError::Unavailable(e.to_string()))?
    }

    async fn update_user_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<(), PersistError> {
        let db = self.db.clone();
        let uid = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_poisoned())?;

            conn.execute(
                "UPDATE users SET status = ?2, last_seen = ?3, updated_at = ?4 WHERE id = ?1",
                rusqlite::params![
                    uid,
                    status.as_str(),
                    last_seen.map(|ts| ts.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                ],
            )?;

            Ok(())
        })
        .await
        .map_err(|e| PersistError::Unavailable(e.to_string()))?
    }
}

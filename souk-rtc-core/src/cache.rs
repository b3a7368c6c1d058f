//! Local message cache
//!
//! SQLite-backed read-through cache so a conversation renders
//! instantly on open while the authoritative fetch is in flight. The
//! cache is bounded: least-recently-opened conversations are evicted
//! first, and each conversation keeps only its newest messages. The
//! conversation currently on screen is never evicted.

use crate::types::{ConversationId, Message, MessageId, MessageStatus, MessageType, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

/// Cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Underlying database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row did not decode back into a message
    #[error("corrupt cache row: {0}")]
    Corrupt(String),
}

/// Cache capacity bounds
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of conversations kept
    pub max_conversations: usize,
    /// Maximum messages kept per conversation
    pub max_messages_per_conversation: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_conversations: 32,
            max_messages_per_conversation: 200,
        }
    }
}

/// SQLite message cache
pub struct MessageCache {
    conn: Mutex<Connection>,
    config: CacheConfig,
}

impl MessageCache {
    /// Open (creating if needed) a cache database at `path`
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] when the file cannot be opened
    /// or the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>, config: CacheConfig) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        Self::init(conn, config)
    }

    /// Open an in-memory cache, used by tests and ephemeral sessions
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] when the schema cannot be
    /// applied.
    pub fn open_in_memory(config: CacheConfig) -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, config)
    }

    fn init(conn: Connection, config: CacheConfig) -> Result<Self, CacheError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id          TEXT PRIMARY KEY,
                last_opened INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                sender_id       TEXT NOT NULL,
                message_type    TEXT NOT NULL,
                content         TEXT NOT NULL,
                timestamp       TEXT NOT NULL,
                status          TEXT NOT NULL,
                PRIMARY KEY (conversation_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_convo_ts
                ON messages (conversation_id, timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// Record that a conversation was opened and evict over capacity
    ///
    /// The conversation being opened is exempt from eviction by
    /// construction: it carries the newest `last_opened` stamp.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on write failure.
    pub fn touch_conversation(&self, id: &ConversationId) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations (id, last_opened) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET last_opened = ?2",
            params![id.as_str(), Utc::now().timestamp_millis()],
        )?;

        let excess: i64 = conn.query_row(
            "SELECT MAX(COUNT(*) - ?1, 0) FROM conversations",
            params![self.config.max_conversations as i64],
            |row| row.get(0),
        )?;
        if excess > 0 {
            conn.execute(
                "DELETE FROM messages WHERE conversation_id IN (
                    SELECT id FROM conversations ORDER BY last_opened ASC LIMIT ?1
                 )",
                params![excess],
            )?;
            conn.execute(
                "DELETE FROM conversations WHERE id IN (
                    SELECT id FROM conversations ORDER BY last_opened ASC LIMIT ?1
                 )",
                params![excess],
            )?;
        }
        Ok(())
    }

    /// Replace a conversation's cached messages with a fresh snapshot
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on write failure.
    pub fn replace_messages(
        &self,
        id: &ConversationId,
        messages: &[Message],
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![id.as_str()],
        )?;
        for message in messages {
            Self::insert_row(&tx, message)?;
        }
        tx.commit()?;
        drop(conn);
        self.trim_conversation(id)
    }

    /// Insert or update a single message
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on write failure.
    pub fn upsert_message(&self, message: &Message) -> Result<(), CacheError> {
        {
            let conn = self.conn.lock();
            Self::insert_row(&conn, message)?;
        }
        self.trim_conversation(&message.conversation_id)
    }

    /// Remove a single message, used when a failed send is retried
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on write failure.
    pub fn remove_message(
        &self,
        conversation_id: &ConversationId,
        id: &MessageId,
    ) -> Result<(), CacheError> {
        self.conn.lock().execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND id = ?2",
            params![conversation_id.as_str(), id.to_string()],
        )?;
        Ok(())
    }

    /// Load a conversation's cached messages, oldest first
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on read failure or when a row fails to
    /// decode.
    pub fn load_messages(&self, id: &ConversationId) -> Result<Vec<Message>, CacheError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sender_id, message_type, content, timestamp, status
             FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![id.as_str()], Self::row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row??);
        }
        Ok(messages)
    }

    /// Number of cached messages in a conversation
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on read failure.
    pub fn message_count(&self, id: &ConversationId) -> Result<usize, CacheError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Number of conversations currently cached
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] on read failure.
    pub fn conversation_count(&self) -> Result<usize, CacheError> {
        let count: i64 =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn trim_conversation(&self, id: &ConversationId) -> Result<(), CacheError> {
        self.conn.lock().execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND (timestamp, id) NOT IN (
                SELECT timestamp, id FROM messages WHERE conversation_id = ?1
                ORDER BY timestamp DESC, id DESC LIMIT ?2
             )",
            params![id.as_str(), self.config.max_messages_per_conversation as i64],
        )?;
        Ok(())
    }

    fn insert_row(conn: &Connection, message: &Message) -> Result<(), rusqlite::Error> {
        conn.execute(
            "INSERT INTO messages
                (id, conversation_id, sender_id, message_type, content, timestamp, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(conversation_id, id) DO UPDATE SET
                content = ?5, timestamp = ?6, status = ?7",
            params![
                message.id.to_string(),
                message.conversation_id.as_str(),
                message.sender_id.as_str(),
                type_tag(message.message_type),
                message.content,
                message.timestamp.to_rfc3339(),
                status_tag(message.status),
            ],
        )?;
        Ok(())
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Message, CacheError>> {
        let id: String = row.get(0)?;
        let conversation_id: String = row.get(1)?;
        let sender_id: String = row.get(2)?;
        let message_type: String = row.get(3)?;
        let content: String = row.get(4)?;
        let timestamp: String = row.get(5)?;
        let status: String = row.get(6)?;
        Ok(decode_message(
            id,
            conversation_id,
            sender_id,
            message_type,
            content,
            timestamp,
            status,
        ))
    }
}

fn decode_message(
    id: String,
    conversation_id: String,
    sender_id: String,
    message_type: String,
    content: String,
    timestamp: String,
    status: String,
) -> Result<Message, CacheError> {
    Ok(Message {
        id: MessageId::try_from(id).map_err(|e| CacheError::Corrupt(e.to_string()))?,
        conversation_id: ConversationId::new(conversation_id),
        sender_id: UserId::new(sender_id),
        message_type: parse_type(&message_type)?,
        content,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| CacheError::Corrupt(e.to_string()))?
            .with_timezone(&Utc),
        status: parse_status(&status)?,
    })
}

fn status_tag(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sending => "sending",
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Failed => "failed",
    }
}

fn parse_status(tag: &str) -> Result<MessageStatus, CacheError> {
    match tag {
        "sending" => Ok(MessageStatus::Sending),
        "sent" => Ok(MessageStatus::Sent),
        "delivered" => Ok(MessageStatus::Delivered),
        "read" => Ok(MessageStatus::Read),
        "failed" => Ok(MessageStatus::Failed),
        other => Err(CacheError::Corrupt(format!("unknown status {other}"))),
    }
}

fn type_tag(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Text => "text",
        MessageType::Image => "image",
    }
}

fn parse_type(tag: &str) -> Result<MessageType, CacheError> {
    match tag {
        "text" => Ok(MessageType::Text),
        "image" => Ok(MessageType::Image),
        other => Err(CacheError::Corrupt(format!("unknown message type {other}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(convo: &str, id: &str, ts_ms: i64) -> Message {
        Message {
            id: MessageId::Server(id.to_string()),
            conversation_id: ConversationId::from(convo),
            sender_id: UserId::from("alice"),
            message_type: MessageType::Text,
            content: format!("msg {id}"),
            timestamp: Utc.timestamp_millis_opt(ts_ms).single().unwrap(),
            status: MessageStatus::Sent,
        }
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let cache = MessageCache::open_in_memory(CacheConfig::default()).unwrap();
        let convo = ConversationId::from("c1");
        cache
            .replace_messages(
                &convo,
                &[
                    message("c1", "m2", 2_000),
                    message("c1", "m1", 1_000),
                    message("c1", "m3", 3_000),
                ],
            )
            .unwrap();

        let loaded = cache.load_messages(&convo).unwrap();
        let ids: Vec<String> = loaded.iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_upsert_updates_status() {
        let cache = MessageCache::open_in_memory(CacheConfig::default()).unwrap();
        let mut m = message("c1", "m1", 1_000);
        cache.upsert_message(&m).unwrap();
        m.status = MessageStatus::Read;
        cache.upsert_message(&m).unwrap();

        let loaded = cache.load_messages(&m.conversation_id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, MessageStatus::Read);
    }

    #[test]
    fn test_local_ids_survive_round_trip() {
        let cache = MessageCache::open_in_memory(CacheConfig::default()).unwrap();
        let mut m = message("c1", "ignored", 1_000);
        m.id = MessageId::new_local();
        m.status = MessageStatus::Sending;
        cache.upsert_message(&m).unwrap();

        let loaded = cache.load_messages(&m.conversation_id).unwrap();
        assert_eq!(loaded[0].id, m.id);
        assert!(loaded[0].id.is_local());
    }

    #[test]
    fn test_per_conversation_trim_keeps_newest() {
        let config = CacheConfig {
            max_conversations: 8,
            max_messages_per_conversation: 3,
        };
        let cache = MessageCache::open_in_memory(config).unwrap();
        let convo = ConversationId::from("c1");
        for i in 0..5 {
            cache
                .upsert_message(&message("c1", &format!("m{i}"), 1_000 * (i + 1)))
                .unwrap();
        }

        let loaded = cache.load_messages(&convo).unwrap();
        let ids: Vec<String> = loaded.iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_lru_conversation_eviction() {
        let config = CacheConfig {
            max_conversations: 2,
            max_messages_per_conversation: 10,
        };
        let cache = MessageCache::open_in_memory(config).unwrap();
        for (i, convo) in ["c1", "c2", "c3"].iter().enumerate() {
            cache.touch_conversation(&ConversationId::from(*convo)).unwrap();
            cache
                .upsert_message(&message(convo, "m1", 1_000 * (i as i64 + 1)))
                .unwrap();
        }

        assert_eq!(cache.conversation_count().unwrap(), 2);
        // c1 was the least recently opened.
        assert!(cache
            .load_messages(&ConversationId::from("c1"))
            .unwrap()
            .is_empty());
        assert_eq!(
            cache
                .load_messages(&ConversationId::from("c3"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.db");
        {
            let cache = MessageCache::open(&path, CacheConfig::default()).unwrap();
            cache.upsert_message(&message("c1", "m1", 1_000)).unwrap();
        }
        let cache = MessageCache::open(&path, CacheConfig::default()).unwrap();
        let loaded = cache.load_messages(&ConversationId::from("c1")).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "msg m1");
    }

    #[test]
    fn test_remove_message() {
        let cache = MessageCache::open_in_memory(CacheConfig::default()).unwrap();
        let m = message("c1", "m1", 1_000);
        cache.upsert_message(&m).unwrap();
        cache.remove_message(&m.conversation_id, &m.id).unwrap();
        assert!(cache.load_messages(&m.conversation_id).unwrap().is_empty());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable message store contract and the two bundled implementations.
//!
//! Ordering is by stored timestamp; ties are broken by role priority with
//! assistant before user, matching the session chronology invariant.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;

use maestro_model::{Message, Role, ToolCall, Usage};

/// Partial update applied to an existing message row.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub model: Option<String>,
    pub token_usage: Option<Usage>,
    /// Merged into the stored metadata map key-by-key.
    pub metadata: Option<serde_json::Map<String, Value>>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message; returns the stored id.
    async fn add_message(&self, session_id: &str, msg: &Message) -> anyhow::Result<String>;

    async fn update_message(&self, message_id: &str, update: MessageUpdate) -> anyhow::Result<()>;

    /// Messages of a session in chronological order.
    async fn list_messages(&self, session_id: &str) -> anyhow::Result<Vec<Message>>;
}

fn sort_chronological(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.role.tie_rank().cmp(&b.role.tie_rank()))
    });
}

fn apply_update(msg: &mut Message, update: MessageUpdate) {
    if let Some(content) = update.content {
        msg.body = maestro_model::MessageBody::Text(content);
    }
    if let Some(calls) = update.tool_calls {
        msg.tool_calls = calls;
    }
    if let Some(model) = update.model {
        msg.model = Some(model);
    }
    if let Some(usage) = update.token_usage {
        msg.token_usage = Some(usage);
    }
    if let Some(meta) = update.metadata {
        for (k, v) in meta {
            msg.metadata.insert(k, v);
        }
    }
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// Volatile store used by tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryMessageStore {
    sessions: Mutex<HashMap<String, Vec<Message>>>,
    /// When set, writes fail — used to exercise the optimistic fallback path.
    fail_writes: std::sync::atomic::AtomicBool,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn failing(&self) -> bool {
        self.fail_writes.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Direct lookup by message id (tests).
    pub fn get(&self, message_id: &str) -> Option<Message> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|m| m.id == message_id)
            .cloned()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn add_message(&self, session_id: &str, msg: &Message) -> anyhow::Result<String> {
        if self.failing() {
            anyhow::bail!("store unavailable");
        }
        self.sessions
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push(msg.clone());
        Ok(msg.id.clone())
    }

    async fn update_message(&self, message_id: &str, update: MessageUpdate) -> anyhow::Result<()> {
        if self.failing() {
            anyhow::bail!("store unavailable");
        }
        let mut sessions = self.sessions.lock().unwrap();
        for messages in sessions.values_mut() {
            if let Some(msg) = messages.iter_mut().find(|m| m.id == message_id) {
                apply_update(msg, update);
                return Ok(());
            }
        }
        anyhow::bail!("message {message_id} not found")
    }

    async fn list_messages(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        let mut messages = self
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        sort_chronological(&mut messages);
        Ok(messages)
    }
}

// ─── SQLite store ────────────────────────────────────────────────────────────

/// Durable store backed by a single SQLite file.  Rows hold the serialized
/// message; list order is `(timestamp, role priority)` computed in SQL so
/// readers in other processes agree with this one.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id         TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role       TEXT NOT NULL,
                timestamp  TEXT NOT NULL,
                body       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON messages (session_id, timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn role_rank(role: Role) -> i64 {
        role.tie_rank() as i64
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn add_message(&self, session_id: &str, msg: &Message) -> anyhow::Result<String> {
        let body = serde_json::to_string(msg)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (id, session_id, role, timestamp, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                msg.id,
                session_id,
                format!("{}", Self::role_rank(msg.role)),
                msg.timestamp.to_rfc3339(),
                body,
            ],
        )?;
        Ok(msg.id.clone())
    }

    async fn update_message(&self, message_id: &str, update: MessageUpdate) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let body: String = conn
            .query_row(
                "SELECT body FROM messages WHERE id = ?1",
                [message_id],
                |row| row.get(0),
            )
            .map_err(|_| anyhow::anyhow!("message {message_id} not found"))?;
        let mut msg: Message = serde_json::from_str(&body)?;
        apply_update(&mut msg, update);
        conn.execute(
            "UPDATE messages SET body = ?1 WHERE id = ?2",
            rusqlite::params![serde_json::to_string(&msg)?, message_id],
        )?;
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT body FROM messages WHERE session_id = ?1
             ORDER BY timestamp ASC, role ASC",
        )?;
        let rows = stmt.query_map([session_id], |row| row.get::<_, String>(0))?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(serde_json::from_str(&row?)?);
        }
        Ok(messages)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

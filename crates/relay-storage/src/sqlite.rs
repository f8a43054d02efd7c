//! SQLite storage adapter.
//!
//! Durability settings applied at open: WAL, synchronous=NORMAL,
//! foreign_keys=ON. `PRAGMA integrity_check` runs at open; open fails if it
//! does not report `ok`.

use crate::error::{Result, StorageError};
use crate::store::MessageStore;
use crate::types::{
    MessageQuery, MessageRecord, MessageStatus, Session, SessionCloseReason, SortOrder,
    StoredMessage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id                  TEXT PRIMARY KEY,
    ts                  INTEGER NOT NULL,
    from_agent          TEXT NOT NULL,
    to_agent            TEXT NOT NULL,
    topic               TEXT,
    kind                TEXT NOT NULL,
    body                TEXT NOT NULL,
    data                TEXT,
    thread              TEXT,
    delivery_seq        INTEGER,
    delivery_session_id TEXT,
    session_id          TEXT,
    status              TEXT NOT NULL DEFAULT 'unread',
    is_urgent           INTEGER NOT NULL DEFAULT 0,
    is_broadcast        INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_to ON messages(to_agent);
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread);
CREATE INDEX IF NOT EXISTS idx_messages_session_status
    ON messages(delivery_session_id, status);

CREATE TABLE IF NOT EXISTS sessions (
    id            TEXT PRIMARY KEY,
    agent_name    TEXT NOT NULL,
    cli           TEXT,
    project_id    TEXT,
    started_at    INTEGER NOT NULL,
    ended_at      INTEGER,
    message_count INTEGER NOT NULL DEFAULT 0,
    summary       TEXT,
    resume_token  TEXT,
    closed_by     TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_resume ON sessions(resume_token);
";

const MESSAGE_COLUMNS: &str = "id, ts, from_agent, to_agent, topic, kind, body, data, thread, \
     delivery_seq, delivery_session_id, session_id, status, is_urgent, is_broadcast";

/// A durable SQLite-backed message store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the store at the given path.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened, the integrity check does not
    /// pass, or the schema cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory database; handy for tests that want SQL semantics.
    ///
    /// # Errors
    ///
    /// Fails when the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;

        let check: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if check != "ok" {
            return Err(StorageError::IntegrityCheck(check));
        }

        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert_one(conn: &Connection, m: &StoredMessage) -> Result<()> {
        let data = m
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let kind = serde_json::to_value(m.kind)?
            .as_str()
            .unwrap_or("message")
            .to_string();

        conn.execute(
            "INSERT OR IGNORE INTO messages
                 (id, ts, from_agent, to_agent, topic, kind, body, data, thread,
                  delivery_seq, delivery_session_id, session_id, status, is_urgent, is_broadcast)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                m.id.to_string(),
                m.ts as i64,
                m.from,
                m.to,
                m.topic,
                kind,
                m.body,
                data,
                m.thread,
                m.delivery_seq.map(|s| s as i64),
                m.delivery_session_id,
                m.session_id,
                m.status.to_string(),
                m.is_urgent as i64,
                m.is_broadcast as i64,
            ],
        )?;
        Ok(())
    }

    fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
        let id: String = row.get(0)?;
        let kind: String = row.get(5)?;
        let data: Option<String> = row.get(7)?;
        let status: String = row.get(12)?;

        Ok(StoredMessage {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            ts: row.get::<_, i64>(1)? as u64,
            from: row.get(2)?,
            to: row.get(3)?,
            topic: row.get(4)?,
            kind: serde_json::from_value(serde_json::Value::String(kind)).unwrap_or_default(),
            body: row.get(6)?,
            data: data.and_then(|d| serde_json::from_str(&d).ok()),
            thread: row.get(8)?,
            delivery_seq: row.get::<_, Option<i64>>(9)?.map(|s| s as u64),
            delivery_session_id: row.get(10)?,
            session_id: row.get(11)?,
            status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Unread),
            is_urgent: row.get::<_, i64>(13)? != 0,
            is_broadcast: row.get::<_, i64>(14)? != 0,
        })
    }

    fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
        Ok(MessageRecord {
            message: Self::map_message(row)?,
            reply_count: row.get::<_, i64>(15)? as u64,
        })
    }

    fn map_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
        let closed_by: Option<String> = row.get(9)?;
        Ok(Session {
            id: row.get(0)?,
            agent_name: row.get(1)?,
            cli: row.get(2)?,
            project_id: row.get(3)?,
            started_at: row.get::<_, i64>(4)? as u64,
            ended_at: row.get::<_, Option<i64>>(5)?.map(|t| t as u64),
            message_count: row.get::<_, i64>(6)? as u64,
            summary: row.get(7)?,
            resume_token: row.get(8)?,
            closed_by: closed_by.as_deref().and_then(SessionCloseReason::parse),
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn save_message(&self, message: StoredMessage) -> Result<()> {
        let conn = self.conn.lock();
        Self::insert_one(&conn, &message)
    }

    async fn save_batch(&self, messages: Vec<StoredMessage>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StorageError::from)?;
        for message in &messages {
            Self::insert_one(&tx, message)?;
        }
        tx.commit().map_err(StorageError::from)
    }

    async fn get_message_by_id(&self, id: Uuid) -> Result<Option<MessageRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS},
                    (SELECT COUNT(*) FROM messages r WHERE r.thread = m.id) AS reply_count
             FROM messages m WHERE id = ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id.to_string()], Self::map_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn get_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(from) = &query.from {
            args.push(Box::new(from.clone()));
            conditions.push(format!("from_agent = ?{}", args.len()));
        }
        if let Some(to) = &query.to {
            args.push(Box::new(to.clone()));
            conditions.push(format!("to_agent = ?{}", args.len()));
        }
        if let Some(topic) = &query.topic {
            args.push(Box::new(topic.clone()));
            conditions.push(format!("topic = ?{}", args.len()));
        }
        if let Some(thread) = &query.thread {
            args.push(Box::new(thread.clone()));
            conditions.push(format!("thread = ?{}", args.len()));
        }
        if let Some(since) = query.since_ts {
            args.push(Box::new(since as i64));
            conditions.push(format!("ts >= ?{}", args.len()));
        }
        if query.unread_only {
            conditions.push("status = 'unread'".to_string());
        }
        if query.urgent_only {
            conditions.push("is_urgent = 1".to_string());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let order = match query.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let limit = query
            .limit
            .map(|l| format!("LIMIT {l}"))
            .unwrap_or_default();

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS},
                    (SELECT COUNT(*) FROM messages r WHERE r.thread = m.id) AS reply_count
             FROM messages m {where_clause} ORDER BY ts {order} {limit}"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), Self::map_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<()> {
        let conn = self.conn.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM messages WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::from(other)),
            })?;

        let Some(current) = current else {
            return Err(StorageError::NotFound(id.to_string()));
        };
        let current = MessageStatus::parse(&current).unwrap_or(MessageStatus::Unread);

        if status.rank() < current.rank() {
            return Err(StorageError::StatusRegression {
                id: id.to_string(),
                current: current.to_string(),
                requested: status.to_string(),
            });
        }
        conn.execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.to_string()],
        )?;
        Ok(())
    }

    async fn get_pending_messages_for_session(
        &self,
        agent: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             WHERE to_agent = ?1 AND delivery_session_id = ?2 AND status = 'unread'
             ORDER BY delivery_seq ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![agent, session_id], Self::map_message)?;
        let mut pending = Vec::new();
        for row in rows {
            pending.push(row?);
        }
        Ok(pending)
    }

    async fn start_session(&self, session: Session) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sessions
                 (id, agent_name, cli, project_id, started_at, ended_at,
                  message_count, summary, resume_token, closed_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id,
                session.agent_name,
                session.cli,
                session.project_id,
                session.started_at as i64,
                session.ended_at.map(|t| t as i64),
                session.message_count as i64,
                session.summary,
                session.resume_token,
                session.closed_by.map(|c| c.to_string()),
            ],
        )?;
        Ok(())
    }

    async fn end_session(&self, id: &str, closed_by: SessionCloseReason) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE sessions SET ended_at = ?2, closed_by = ?3
             WHERE id = ?1 AND ended_at IS NULL",
            params![
                id,
                relay_protocol::now_ms() as i64,
                closed_by.to_string()
            ],
        )?;
        // Closing an already-closed session is a no-op; an unknown id is
        // an error.
        if updated == 0 {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(StorageError::NotFound(id.to_string()));
            }
        }
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_name, cli, project_id, started_at, ended_at,
                    message_count, summary, resume_token, closed_by
             FROM sessions WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], Self::map_session)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn get_session_by_resume_token(&self, token: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_name, cli, project_id, started_at, ended_at,
                    message_count, summary, resume_token, closed_by
             FROM sessions WHERE resume_token = ?1",
        )?;
        let mut rows = stmt.query_map(params![token], Self::map_session)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_name, cli, project_id, started_at, ended_at,
                    message_count, summary, resume_token, closed_by
             FROM sessions ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::map_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    async fn increment_session_message_count(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET message_count = message_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

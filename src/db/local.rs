//! SQLite-backed store
//!
//! Strongly consistent: `put` is a single immediate transaction whose
//! `UPDATE ... WHERE last_applied_seq = ?` is the compare-and-swap.

use super::schema::{
    decode_attributes, decode_kind, decode_tag, decode_time, encode_attributes, encode_time,
    LogEntry, SCHEMA,
};
use super::{within, StateStore, StoreError, StoreResult};
use crate::state_machine::{ConversationState, Event};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(e.to_string()),
            other => StoreError::BackendUnavailable(other.to_string()),
        }
    }
}

/// Thread-safe SQLite handle
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        // Other processes on the same file wait instead of failing immediately
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::BackendUnavailable("connection lock poisoned".to_string()))
    }

    /// Run blocking SQLite work off the async executor
    async fn blocking<T, F>(&self, op: &'static str, deadline: Instant, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                StoreError::BackendUnavailable("connection lock poisoned".to_string())
            })?;
            f(&mut guard)
        });
        within(deadline, op, async move {
            task.await
                .map_err(|e| StoreError::BackendUnavailable(format!("{op} task failed: {e}")))?
        })
        .await
    }
}

fn get_state(conn: &Connection, id: &str) -> StoreResult<Option<ConversationState>> {
    let row = conn
        .query_row(
            "SELECT conversation_id, state_tag, attributes, last_applied_seq, updated_at
             FROM conversations WHERE conversation_id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((conversation_id, tag, attrs, last_applied_seq, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(ConversationState {
        conversation_id,
        state_tag: decode_tag(&tag)?,
        attributes: decode_attributes(&attrs)?,
        last_applied_seq,
        updated_at: decode_time(&updated_at)?,
    }))
}

fn put_state(
    conn: &mut Connection,
    id: &str,
    state: &ConversationState,
    expected: Option<i64>,
) -> StoreResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let actual: Option<i64> = tx
        .query_row(
            "SELECT last_applied_seq FROM conversations WHERE conversation_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    let tag = state.state_tag.as_str();
    let attrs = encode_attributes(&state.attributes);
    let updated_at = encode_time(&state.updated_at);

    match (expected, actual) {
        (None, None) => {
            tx.execute(
                "INSERT INTO conversations (conversation_id, state_tag, attributes, last_applied_seq, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, tag, attrs, state.last_applied_seq, updated_at],
            )?;
        }
        (Some(expected_seq), Some(actual_seq)) if expected_seq == actual_seq => {
            let updated = tx.execute(
                "UPDATE conversations
                 SET state_tag = ?1, attributes = ?2, last_applied_seq = ?3, updated_at = ?4
                 WHERE conversation_id = ?5 AND last_applied_seq = ?6",
                params![tag, attrs, state.last_applied_seq, updated_at, id, expected_seq],
            )?;
            if updated == 0 {
                return Err(StoreError::Conflict { expected, actual });
            }
        }
        _ => return Err(StoreError::Conflict { expected, actual }),
    }

    tx.commit()?;
    Ok(())
}

fn read_log(conn: &Connection, id: &str) -> StoreResult<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT conversation_id, source_seq, event_type, payload, received_at, logged_at
         FROM event_log WHERE conversation_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(conversation_id, source_seq, kind, payload, received_at, logged_at)| {
            Ok(LogEntry {
                conversation_id,
                source_seq,
                kind: decode_kind(&kind)?,
                payload,
                received_at: decode_time(&received_at)?,
                logged_at: decode_time(&logged_at)?,
            })
        })
        .collect()
}

#[async_trait]
impl StateStore for LocalStore {
    async fn get(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Option<ConversationState>> {
        let id = conversation_id.to_string();
        self.blocking("get", deadline, move |conn| get_state(conn, &id))
            .await
    }

    async fn put(
        &self,
        conversation_id: &str,
        state: &ConversationState,
        expected_last_applied_seq: Option<i64>,
        deadline: Instant,
    ) -> StoreResult<()> {
        let id = conversation_id.to_string();
        let state = state.clone();
        self.blocking("put", deadline, move |conn| {
            put_state(conn, &id, &state, expected_last_applied_seq)
        })
        .await
    }

    async fn append_log(
        &self,
        conversation_id: &str,
        event: &Event,
        deadline: Instant,
    ) -> StoreResult<()> {
        let id = conversation_id.to_string();
        let entry = LogEntry::for_event(event, Utc::now());
        self.blocking("append_log", deadline, move |conn| {
            conn.execute(
                "INSERT INTO event_log (conversation_id, source_seq, event_type, payload, received_at, logged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    entry.source_seq,
                    entry.kind.as_str(),
                    entry.payload,
                    encode_time(&entry.received_at),
                    encode_time(&entry.logged_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn read_log(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Vec<LogEntry>> {
        let id = conversation_id.to_string();
        self.blocking("read_log", deadline, move |conn| read_log(conn, &id))
            .await
    }
}

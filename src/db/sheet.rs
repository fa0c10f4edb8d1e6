//! Spreadsheet-backed store
//!
//! The spreadsheet has no conditional write, so `put` re-reads the row and
//! compares `lastAppliedSeq` before rewriting it. The read and the write run
//! under a per-conversation lock, which closes the race inside this process.
//!
//! Writers in other processes are not locked out. After writing, `put` reads
//! back what it wrote:
//! - on insert, the first row for the conversation wins; a later duplicate
//!   row is blanked and its writer gets [`StoreError::Conflict`]
//! - on update, a row that no longer holds our cells means another writer
//!   overwrote it, which is also a `Conflict`
//!
//! Two rival updates whose write and read-back do not overlap still both
//! succeed, so a single writer process per spreadsheet is the supported
//! deployment.

use super::schema::{
    log_to_row, row_seq, row_to_log, row_to_state, state_to_row, LogEntry, LOG_SHEET,
    STATE_SHEET,
};
use super::{within, SheetClient, StateStore, StoreError, StoreResult};
use crate::state_machine::{ConversationState, Event};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

// ============================================================================
// Per-conversation lock table
// ============================================================================

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Async locks keyed by conversation id. Entries are dropped once unused.
#[derive(Default)]
pub(crate) struct LockTable {
    locks: Mutex<HashMap<String, KeyLock>>,
}

impl LockTable {
    pub(crate) async fn acquire(&self, key: &str) -> ConversationLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        ConversationLock {
            table: self,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[allow(dead_code)] // Used in tests
    pub(crate) fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Held lock on one conversation
pub(crate) struct ConversationLock<'a> {
    table: &'a LockTable,
    key: String,
    lock: KeyLock,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.table.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the table and this handle left: nobody is waiting
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct SheetStore<C: SheetClient> {
    client: C,
    locks: LockTable,
}

impl<C: SheetClient> SheetStore<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            locks: LockTable::default(),
        }
    }

    #[allow(dead_code)] // Used in tests
    pub fn client(&self) -> &C {
        &self.client
    }

    #[allow(dead_code)] // Used in tests
    pub(crate) fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Append a new row, then make sure it is the only one for the conversation
    async fn insert(&self, conversation_id: &str, cells: Vec<String>) -> StoreResult<()> {
        let width = cells.len();
        let ours = self.client.append_row(STATE_SHEET, cells).await?;
        tracing::debug!(conv_id = %conversation_id, row_number = ours, "Created sheet row");

        let rows = self.client.find_rows(STATE_SHEET, conversation_id).await?;
        let Some(first) = rows.iter().min_by_key(|row| row.row_number) else {
            return Err(StoreError::Conflict {
                expected: None,
                actual: None,
            });
        };
        if first.row_number == ours {
            return Ok(());
        }

        // Another writer inserted first; take our row back out of lookups
        tracing::warn!(
            conv_id = %conversation_id,
            row_number = ours,
            winner = first.row_number,
            "Lost insert race"
        );
        let actual = row_seq(&first.cells).ok();
        self.client
            .update_row(STATE_SHEET, ours, vec![String::new(); width])
            .await?;
        Err(StoreError::Conflict {
            expected: None,
            actual,
        })
    }

    /// Rewrite the row, then check that it still holds our state
    async fn update(
        &self,
        row_number: usize,
        state: &ConversationState,
    ) -> StoreResult<()> {
        let conversation_id = state.conversation_id.as_str();
        self.client
            .update_row(STATE_SHEET, row_number, state_to_row(state))
            .await?;

        let current = self
            .client
            .find_row(STATE_SHEET, conversation_id)
            .await?
            .map(|row| row_to_state(&row.cells).map(|s| (row.row_number, s)))
            .transpose()?;
        match current {
            Some((n, current)) if n == row_number && current.same_content(state) => Ok(()),
            current => {
                tracing::warn!(conv_id = %conversation_id, row_number, "Row overwritten by another writer");
                Err(StoreError::Conflict {
                    expected: Some(state.last_applied_seq),
                    actual: current.map(|(_, s)| s.last_applied_seq),
                })
            }
        }
    }
}

#[async_trait]
impl<C: SheetClient> StateStore for SheetStore<C> {
    async fn get(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Option<ConversationState>> {
        within(deadline, "get", async {
            let _lock = self.locks.acquire(conversation_id).await;
            match self.client.find_row(STATE_SHEET, conversation_id).await? {
                Some(row) => row_to_state(&row.cells).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(
        &self,
        conversation_id: &str,
        state: &ConversationState,
        expected_last_applied_seq: Option<i64>,
        deadline: Instant,
    ) -> StoreResult<()> {
        within(deadline, "put", async {
            let _lock = self.locks.acquire(conversation_id).await;

            let existing = self.client.find_row(STATE_SHEET, conversation_id).await?;
            let actual = existing
                .as_ref()
                .map(|row| row_seq(&row.cells))
                .transpose()?;
            if actual != expected_last_applied_seq {
                return Err(StoreError::Conflict {
                    expected: expected_last_applied_seq,
                    actual,
                });
            }

            match existing {
                Some(row) => self.update(row.row_number, state).await,
                None => self.insert(conversation_id, state_to_row(state)).await,
            }
        })
        .await
    }

    async fn append_log(
        &self,
        conversation_id: &str,
        event: &Event,
        deadline: Instant,
    ) -> StoreResult<()> {
        debug_assert_eq!(conversation_id, event.conversation_id);
        let row = log_to_row(&LogEntry::for_event(event, Utc::now()));
        within(deadline, "append_log", async {
            self.client.append_row(LOG_SHEET, row).await?;
            Ok(())
        })
        .await
    }

    async fn read_log(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Vec<LogEntry>> {
        within(deadline, "read_log", async {
            self.client
                .find_rows(LOG_SHEET, conversation_id)
                .await?
                .iter()
                .map(|row| row_to_log(&row.cells))
                .collect()
        })
        .await
    }
}

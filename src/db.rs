//! Conversation state persistence
//!
//! One trait, [`StateStore`], with two independent implementations:
//! [`LocalStore`] (SQLite, native compare-and-swap) and [`SheetStore`]
//! (row-oriented spreadsheet behind a scripting-host web app). The process
//! picks one at startup through [`Backend`].

mod local;
mod schema;
mod sheet;
mod sheet_client;

#[cfg(test)]
mod contract;
#[cfg(test)]
pub mod testing;

pub use local::LocalStore;
pub use schema::LogEntry;
pub use sheet::SheetStore;
pub use sheet_client::{HttpSheetClient, SheetClient};

use crate::config::BackendConfig;
use crate::state_machine::{ConversationState, Event};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Stored `last_applied_seq` moved since it was read; re-read and retry
    #[error("Conflict: expected last_applied_seq {expected:?}, found {actual:?}")]
    Conflict {
        expected: Option<i64>,
        actual: Option<i64>,
    },
    /// Timed out or could not reach the backend; retryable
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Backend answered but refused the request
    #[error("Backend rejected request: {0}")]
    Rejected(String),
    /// Stored record could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage adapter for conversation state and the audit log.
///
/// Every call is bounded by the caller's `deadline`; running past it yields
/// [`StoreError::BackendUnavailable`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state, or `None` if the conversation has never been written
    async fn get(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Option<ConversationState>>;

    /// Conditional write.
    ///
    /// Succeeds only if the stored `last_applied_seq` still equals
    /// `expected_last_applied_seq`; `None` means the conversation must not
    /// exist yet.
    async fn put(
        &self,
        conversation_id: &str,
        state: &ConversationState,
        expected_last_applied_seq: Option<i64>,
        deadline: Instant,
    ) -> StoreResult<()>;

    /// Append an audit row for an applied event. Duplicates are tolerated.
    async fn append_log(&self, conversation_id: &str, event: &Event, deadline: Instant)
        -> StoreResult<()>;

    /// Audit rows for one conversation, oldest first
    async fn read_log(&self, conversation_id: &str, deadline: Instant)
        -> StoreResult<Vec<LogEntry>>;
}

/// Run a store operation against a deadline
pub(crate) async fn within<T>(
    deadline: Instant,
    op: &str,
    fut: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .unwrap_or_else(|_| Err(StoreError::BackendUnavailable(format!("{op} timed out"))))
}

// ============================================================================
// Arc implementation for shared stores
// ============================================================================

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn get(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Option<ConversationState>> {
        (**self).get(conversation_id, deadline).await
    }

    async fn put(
        &self,
        conversation_id: &str,
        state: &ConversationState,
        expected_last_applied_seq: Option<i64>,
        deadline: Instant,
    ) -> StoreResult<()> {
        (**self)
            .put(conversation_id, state, expected_last_applied_seq, deadline)
            .await
    }

    async fn append_log(
        &self,
        conversation_id: &str,
        event: &Event,
        deadline: Instant,
    ) -> StoreResult<()> {
        (**self).append_log(conversation_id, event, deadline).await
    }

    async fn read_log(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Vec<LogEntry>> {
        (**self).read_log(conversation_id, deadline).await
    }
}

// ============================================================================
// Backend selection
// ============================================================================

/// The store chosen for this process
pub enum Backend {
    Local(LocalStore),
    Sheet(SheetStore<HttpSheetClient>),
}

impl Backend {
    pub fn open(config: &BackendConfig) -> StoreResult<Self> {
        match config {
            BackendConfig::Local { path } => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
                }
                Ok(Backend::Local(LocalStore::open(path)?))
            }
            BackendConfig::Sheet { url, token } => {
                let client = HttpSheetClient::new(url.clone(), token.clone())?;
                Ok(Backend::Sheet(SheetStore::new(client)))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Local(_) => "local",
            Backend::Sheet(_) => "sheet",
        }
    }
}

#[async_trait]
impl StateStore for Backend {
    async fn get(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Option<ConversationState>> {
        match self {
            Backend::Local(store) => store.get(conversation_id, deadline).await,
            Backend::Sheet(store) => store.get(conversation_id, deadline).await,
        }
    }

    async fn put(
        &self,
        conversation_id: &str,
        state: &ConversationState,
        expected_last_applied_seq: Option<i64>,
        deadline: Instant,
    ) -> StoreResult<()> {
        match self {
            Backend::Local(store) => {
                store
                    .put(conversation_id, state, expected_last_applied_seq, deadline)
                    .await
            }
            Backend::Sheet(store) => {
                store
                    .put(conversation_id, state, expected_last_applied_seq, deadline)
                    .await
            }
        }
    }

    async fn append_log(
        &self,
        conversation_id: &str,
        event: &Event,
        deadline: Instant,
    ) -> StoreResult<()> {
        match self {
            Backend::Local(store) => store.append_log(conversation_id, event, deadline).await,
            Backend::Sheet(store) => store.append_log(conversation_id, event, deadline).await,
        }
    }

    async fn read_log(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Vec<LogEntry>> {
        match self {
            Backend::Local(store) => store.read_log(conversation_id, deadline).await,
            Backend::Sheet(store) => store.read_log(conversation_id, deadline).await,
        }
    }
}

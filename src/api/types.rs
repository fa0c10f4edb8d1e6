//! API request and response types

use crate::db::LogEntry;
use crate::runtime::DispatchOutcome;
use crate::state_machine::{Action, ConversationState, StateTag};
use serde::Serialize;

/// Result of one inbound event
#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    /// `applied`, `duplicate` or `unchanged`
    pub status: &'static str,
    pub conversation_id: String,
    pub state_tag: StateTag,
    pub last_applied_seq: i64,
    pub actions: Vec<Action>,
}

impl From<DispatchOutcome> for DispatchResponse {
    fn from(outcome: DispatchOutcome) -> Self {
        let status = outcome.status();
        let (state, actions) = match outcome {
            DispatchOutcome::Applied { state, actions, .. }
            | DispatchOutcome::Duplicate { state, actions }
            | DispatchOutcome::Unchanged { state, actions } => (state, actions),
        };
        Self {
            status,
            conversation_id: state.conversation_id,
            state_tag: state.state_tag,
            last_applied_seq: state.last_applied_seq,
            actions,
        }
    }
}

/// Response with a single conversation
#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation: ConversationState,
}

/// Audit trail of one conversation
#[derive(Debug, Serialize)]
pub struct LogResponse {
    pub conversation_id: String,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub delivery: &'static str,
    pub active_conversations: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_seq: Option<i64>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            conversation_id: None,
            source_seq: None,
        }
    }
}

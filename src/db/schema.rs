//! Persisted layout and record encoding shared by both stores

use super::{StoreError, StoreResult};
use crate::state_machine::state::Attributes;
use crate::state_machine::{ConversationState, Event, EventKind, StateTag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    conversation_id TEXT PRIMARY KEY,
    state_tag TEXT NOT NULL,
    attributes TEXT NOT NULL DEFAULT '{}',
    last_applied_seq INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    source_seq INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    received_at TEXT NOT NULL,
    logged_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_event_log_conversation ON event_log(conversation_id, id);
";

/// Sheet holding one row per conversation
pub const STATE_SHEET: &str = "conversations";
/// Append-only audit sheet
pub const LOG_SHEET: &str = "event_log";

/// Column order of [`STATE_SHEET`]
pub const STATE_COLUMNS: [&str; 5] = [
    "conversationId",
    "stateTag",
    "attributes",
    "lastAppliedSeq",
    "updatedAt",
];

/// Column order of [`LOG_SHEET`]
pub const LOG_COLUMNS: [&str; 6] = [
    "conversationId",
    "sourceSeq",
    "eventType",
    "payload",
    "receivedAt",
    "loggedAt",
];

/// One audit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub conversation_id: String,
    pub source_seq: i64,
    pub kind: EventKind,
    pub payload: String,
    pub received_at: DateTime<Utc>,
    pub logged_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn for_event(event: &Event, logged_at: DateTime<Utc>) -> Self {
        Self {
            conversation_id: event.conversation_id.clone(),
            source_seq: event.source_seq,
            kind: event.kind,
            payload: event.payload.clone(),
            received_at: event.received_at,
            logged_at,
        }
    }
}

// ============================================================================
// Field encoding
// ============================================================================

pub fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub fn decode_time(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp `{s}`: {e}")))
}

pub fn encode_attributes(attrs: &Attributes) -> String {
    // BTreeMap keys and scalar values always serialize
    serde_json::to_string(attrs).unwrap_or_else(|_| "{}".to_string())
}

pub fn decode_attributes(s: &str) -> StoreResult<Attributes> {
    if s.is_empty() {
        return Ok(Attributes::new());
    }
    serde_json::from_str(s).map_err(|e| StoreError::Corrupt(format!("bad attributes: {e}")))
}

pub fn decode_tag(s: &str) -> StoreResult<StateTag> {
    StateTag::parse(s).ok_or_else(|| StoreError::Corrupt(format!("unknown state tag `{s}`")))
}

pub fn decode_kind(s: &str) -> StoreResult<EventKind> {
    EventKind::parse(s).ok_or_else(|| StoreError::Corrupt(format!("unknown event type `{s}`")))
}

pub fn decode_seq(s: &str) -> StoreResult<i64> {
    // Spreadsheets hand integers back as "12" or "12.0"
    let trimmed = s.trim();
    let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    trimmed
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("bad sequence number `{s}`")))
}

// ============================================================================
// Sheet rows
// ============================================================================

pub fn state_to_row(state: &ConversationState) -> Vec<String> {
    vec![
        state.conversation_id.clone(),
        state.state_tag.as_str().to_string(),
        encode_attributes(&state.attributes),
        state.last_applied_seq.to_string(),
        encode_time(&state.updated_at),
    ]
}

pub fn row_to_state(cells: &[String]) -> StoreResult<ConversationState> {
    let [id, tag, attrs, seq, updated_at] = cells else {
        return Err(StoreError::Corrupt(format!(
            "state row has {} cells, expected {}",
            cells.len(),
            STATE_COLUMNS.len()
        )));
    };
    Ok(ConversationState {
        conversation_id: id.clone(),
        state_tag: decode_tag(tag)?,
        attributes: decode_attributes(attrs)?,
        last_applied_seq: decode_seq(seq)?,
        updated_at: decode_time(updated_at)?,
    })
}

/// `lastAppliedSeq` of a state row without decoding the rest
pub fn row_seq(cells: &[String]) -> StoreResult<i64> {
    cells
        .get(3)
        .ok_or_else(|| StoreError::Corrupt("state row is missing lastAppliedSeq".to_string()))
        .and_then(|s| decode_seq(s))
}

pub fn log_to_row(entry: &LogEntry) -> Vec<String> {
    vec![
        entry.conversation_id.clone(),
        entry.source_seq.to_string(),
        entry.kind.as_str().to_string(),
        entry.payload.clone(),
        encode_time(&entry.received_at),
        encode_time(&entry.logged_at),
    ]
}

pub fn row_to_log(cells: &[String]) -> StoreResult<LogEntry> {
    let [id, seq, kind, payload, received_at, logged_at] = cells else {
        return Err(StoreError::Corrupt(format!(
            "log row has {} cells, expected {}",
            cells.len(),
            LOG_COLUMNS.len()
        )));
    };
    Ok(LogEntry {
        conversation_id: id.clone(),
        source_seq: decode_seq(seq)?,
        kind: decode_kind(kind)?,
        payload: payload.clone(),
        received_at: decode_time(received_at)?,
        logged_at: decode_time(logged_at)?,
    })
}

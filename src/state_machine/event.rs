//! Inbound events in canonical form

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Free-form text from the user
    Message,
    /// Slash command (`/start`, `/ask name`, ...)
    Command,
    /// Signal from the platform or a scheduler, never typed by a user
    System,
    /// Explicit request to reopen a closed conversation
    Reopen,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Command => "command",
            EventKind::System => "system",
            EventKind::Reopen => "reopen",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(EventKind::Message),
            "command" => Some(EventKind::Command),
            "system" => Some(EventKind::System),
            "reopen" => Some(EventKind::Reopen),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized inbound event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub conversation_id: String,
    pub kind: EventKind,
    pub payload: String,
    pub received_at: DateTime<Utc>,
    /// Monotonically increasing per source; always >= 1
    pub source_seq: i64,
}

impl Event {
    pub fn new(
        conversation_id: impl Into<String>,
        kind: EventKind,
        payload: impl Into<String>,
        received_at: DateTime<Utc>,
        source_seq: i64,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            kind,
            payload: payload.into(),
            received_at,
            source_seq,
        }
    }

    /// Identity used in logs and errors
    pub fn identity(&self) -> EventId<'_> {
        EventId {
            conversation_id: &self.conversation_id,
            source_seq: self.source_seq,
        }
    }
}

/// Borrowed `(conversation_id, source_seq)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId<'a> {
    pub conversation_id: &'a str,
    pub source_seq: i64,
}

impl fmt::Display for EventId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.conversation_id, self.source_seq)
    }
}

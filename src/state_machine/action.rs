//! Actions produced by state transitions

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Message back to the conversation
    Reply,
    /// Out-of-band notification (operators, other systems)
    Notify,
    /// Nothing to deliver
    Noop,
}

/// Outbound action. Transient: never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub conversation_id: String,
    pub kind: ActionKind,
    pub payload: String,
}

impl Action {
    pub fn reply(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            kind: ActionKind::Reply,
            payload: text.into(),
        }
    }

    #[allow(clippy::needless_pass_by_value)] // data is consumed by json! macro
    pub fn notify(conversation_id: impl Into<String>, event_type: &str, data: serde_json::Value) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            kind: ActionKind::Notify,
            payload: serde_json::json!({
                "event": event_type,
                "data": data
            })
            .to_string(),
        }
    }

    pub fn noop(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            kind: ActionKind::Noop,
            payload: String::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind == ActionKind::Noop
    }
}

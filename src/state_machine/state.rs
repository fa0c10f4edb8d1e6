//! Conversation state types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// State Tag
// ============================================================================

/// Conversation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StateTag {
    /// Created, no event applied yet
    #[default]
    New,
    /// Open and idle
    Active,
    /// A `/ask` prompt is outstanding; the next message answers it
    AwaitingInput,
    /// Terminal until an explicit reopen event
    Closed,
}

impl StateTag {
    pub fn as_str(self) -> &'static str {
        match self {
            StateTag::New => "new",
            StateTag::Active => "active",
            StateTag::AwaitingInput => "awaiting_input",
            StateTag::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(StateTag::New),
            "active" => Some(StateTag::Active),
            "awaiting_input" => Some(StateTag::AwaitingInput),
            "closed" => Some(StateTag::Closed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StateTag::Closed)
    }
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// Scalar attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl AttrValue {
    /// Parse user input: integer, then boolean, then text
    pub fn parse_loose(raw: &str) -> Self {
        if let Ok(n) = raw.parse::<i64>() {
            return AttrValue::Int(n);
        }
        match raw {
            "true" => AttrValue::Bool(true),
            "false" => AttrValue::Bool(false),
            _ => AttrValue::Text(raw.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(n) => write!(f, "{n}"),
            AttrValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::Int(n)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// Reserved attribute keys maintained by the engine
pub mod keys {
    pub const MESSAGES: &str = "messages";
    pub const LAST_MESSAGE: &str = "last_message";
    pub const AWAITING: &str = "awaiting";
    pub const REOPENED: &str = "reopened";
}

// ============================================================================
// Conversation State
// ============================================================================

/// Authoritative state of one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    pub state_tag: StateTag,
    #[serde(default)]
    pub attributes: Attributes,
    pub last_applied_seq: i64,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    /// Default state for a conversation seen for the first time
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            state_tag: StateTag::New,
            attributes: Attributes::new(),
            last_applied_seq: 0,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// True if `source_seq` has already been applied
    pub fn has_applied(&self, source_seq: i64) -> bool {
        source_seq <= self.last_applied_seq
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// Equality ignoring `updated_at`
    pub fn same_content(&self, other: &Self) -> bool {
        self.conversation_id == other.conversation_id
            && self.state_tag == other.state_tag
            && self.attributes == other.attributes
            && self.last_applied_seq == other.last_applied_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loose() {
        assert_eq!(AttrValue::parse_loose("42"), AttrValue::Int(42));
        assert_eq!(AttrValue::parse_loose("-7"), AttrValue::Int(-7));
        assert_eq!(AttrValue::parse_loose("true"), AttrValue::Bool(true));
        assert_eq!(
            AttrValue::parse_loose("Berlin"),
            AttrValue::Text("Berlin".to_string())
        );
    }

    #[test]
    fn test_attributes_serialize_as_plain_scalars() {
        let mut attrs = Attributes::new();
        attrs.insert("a".into(), AttrValue::Int(1));
        attrs.insert("b".into(), AttrValue::Bool(false));
        attrs.insert("c".into(), AttrValue::Text("x".into()));

        let json = serde_json::to_string(&attrs).unwrap();
        assert_eq!(json, r#"{"a":1,"b":false,"c":"x"}"#);

        let back: Attributes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, attrs);
    }

    #[test]
    fn test_state_tag_strings() {
        for tag in [
            StateTag::New,
            StateTag::Active,
            StateTag::AwaitingInput,
            StateTag::Closed,
        ] {
            assert_eq!(StateTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(StateTag::parse("archived"), None);
    }

    #[test]
    fn test_default_state() {
        let state = ConversationState::new("c1");
        assert_eq!(state.state_tag, StateTag::New);
        assert_eq!(state.last_applied_seq, 0);
        assert!(state.has_applied(0));
        assert!(!state.has_applied(1));
    }
}

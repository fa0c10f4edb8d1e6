//! Pure state transition function
//!
//! `apply` never touches the network or the clock: the only time it knows
//! about is `event.received_at`, so replaying an event log reproduces the
//! exact same states.

use super::state::{keys, AttrValue, ConversationState, StateTag};
use super::{Action, Event, EventKind};
use serde_json::json;

const WELCOME: &str = "Hi! Send me a message, or try /ask, /set, /status or /close.";

/// Result of a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub new_state: ConversationState,
    pub actions: Vec<Action>,
}

impl TransitionResult {
    pub fn new(state: ConversationState) -> Self {
        Self {
            new_state: state,
            actions: vec![],
        }
    }

    /// State untouched, a single NOOP
    fn unchanged(state: &ConversationState) -> Self {
        Self::new(state.clone()).with_action(Action::noop(&state.conversation_id))
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    fn reply(self, text: impl Into<String>) -> Self {
        let id = self.new_state.conversation_id.clone();
        self.with_action(Action::reply(id, text))
    }

    fn noop(self) -> Self {
        let id = self.new_state.conversation_id.clone();
        self.with_action(Action::noop(id))
    }
}

/// Apply one event to a conversation.
///
/// Callers filter duplicates (`event.source_seq <= state.last_applied_seq`)
/// before calling; this function trusts that the event is new.
pub fn apply(state: &ConversationState, event: &Event) -> TransitionResult {
    debug_assert_eq!(state.conversation_id, event.conversation_id);

    // ============================================================
    // Closed conversations: only an explicit reopen gets through
    // ============================================================
    if state.state_tag.is_terminal() {
        return match event.kind {
            EventKind::Reopen => reopen(advance(state, event)),
            _ => TransitionResult::unchanged(state),
        };
    }

    let next = advance(state, event);
    match event.kind {
        EventKind::Message => on_message(next, &event.payload),
        EventKind::Command => on_command(next, &event.payload),
        EventKind::System => on_system(next, &event.payload),
        // Nothing to reopen
        EventKind::Reopen => TransitionResult::new(next).noop(),
    }
}

/// Copy of `state` with the event's sequence and timestamp recorded
fn advance(state: &ConversationState, event: &Event) -> ConversationState {
    let mut next = state.clone();
    next.last_applied_seq = event.source_seq;
    next.updated_at = event.received_at;
    next
}

fn activate(state: &mut ConversationState) {
    if state.state_tag == StateTag::New {
        state.state_tag = StateTag::Active;
    }
}

fn bump(state: &mut ConversationState, key: &str) -> i64 {
    let n = state.attr(key).and_then(AttrValue::as_int).unwrap_or(0) + 1;
    state.attributes.insert(key.to_string(), AttrValue::Int(n));
    n
}

fn is_reserved(key: &str) -> bool {
    matches!(
        key,
        keys::MESSAGES | keys::LAST_MESSAGE | keys::AWAITING | keys::REOPENED
    )
}

// ============================================================
// Messages
// ============================================================

fn on_message(mut next: ConversationState, text: &str) -> TransitionResult {
    let text = text.trim();
    let count = bump(&mut next, keys::MESSAGES);
    next.attributes
        .insert(keys::LAST_MESSAGE.to_string(), AttrValue::from(text));

    if next.state_tag == StateTag::AwaitingInput {
        // The message answers the outstanding /ask
        let key = next
            .attributes
            .remove(keys::AWAITING)
            .and_then(|v| v.as_text().map(str::to_string));
        next.state_tag = StateTag::Active;
        if let Some(key) = key {
            next.attributes.insert(key.clone(), AttrValue::from(text));
            return TransitionResult::new(next).reply(format!("Thanks, saved {key}."));
        }
        return TransitionResult::new(next).reply(format!("Noted (message #{count})."));
    }

    activate(&mut next);
    TransitionResult::new(next).reply(format!("Noted (message #{count})."))
}

// ============================================================
// Commands
// ============================================================

/// `/name@bot arg1 arg2` -> ("name", ["arg1", "arg2"])
fn parse_command(payload: &str) -> (String, Vec<&str>) {
    let mut parts = payload.trim().trim_start_matches('/').split_whitespace();
    let name = parts
        .next()
        .and_then(|head| head.split('@').next())
        .unwrap_or_default()
        .to_ascii_lowercase();
    (name, parts.collect())
}

fn on_command(mut next: ConversationState, payload: &str) -> TransitionResult {
    let (name, args) = parse_command(payload);
    let id = next.conversation_id.clone();

    match name.as_str() {
        "start" => {
            next.state_tag = StateTag::Active;
            next.attributes.remove(keys::AWAITING);
            TransitionResult::new(next).reply(WELCOME)
        }

        "ask" => {
            let Some((key, prompt)) = args.split_first() else {
                activate(&mut next);
                return TransitionResult::new(next).reply("Usage: /ask <key> [prompt]");
            };
            if is_reserved(key) {
                activate(&mut next);
                return TransitionResult::new(next).reply(format!("{key} is reserved."));
            }
            let prompt = if prompt.is_empty() {
                format!("Please send your {key}.")
            } else {
                prompt.join(" ")
            };
            next.state_tag = StateTag::AwaitingInput;
            next.attributes
                .insert(keys::AWAITING.to_string(), AttrValue::from(*key));
            TransitionResult::new(next).reply(prompt)
        }

        "set" => {
            activate(&mut next);
            let Some((key, value)) = args.split_first().filter(|(_, v)| !v.is_empty()) else {
                return TransitionResult::new(next).reply("Usage: /set <key> <value>");
            };
            if is_reserved(key) {
                return TransitionResult::new(next).reply(format!("{key} is reserved."));
            }
            let value = AttrValue::parse_loose(&value.join(" "));
            let text = format!("Set {key} = {value}.");
            next.attributes.insert((*key).to_string(), value);
            TransitionResult::new(next).reply(text)
        }

        "unset" => {
            activate(&mut next);
            let Some(key) = args.first() else {
                return TransitionResult::new(next).reply("Usage: /unset <key>");
            };
            if is_reserved(key) {
                return TransitionResult::new(next).reply(format!("{key} is reserved."));
            }
            let text = if next.attributes.remove(*key).is_some() {
                format!("Removed {key}.")
            } else {
                format!("{key} was not set.")
            };
            TransitionResult::new(next).reply(text)
        }

        "cancel" => {
            activate(&mut next);
            if next.state_tag == StateTag::AwaitingInput {
                next.state_tag = StateTag::Active;
                next.attributes.remove(keys::AWAITING);
                TransitionResult::new(next).reply("Cancelled.")
            } else {
                TransitionResult::new(next).reply("Nothing to cancel.")
            }
        }

        "status" => {
            activate(&mut next);
            let summary = status_summary(&next);
            TransitionResult::new(next).reply(summary)
        }

        "close" | "end" => {
            next.state_tag = StateTag::Closed;
            next.attributes.remove(keys::AWAITING);
            let seq = next.last_applied_seq;
            TransitionResult::new(next)
                .reply("Goodbye! This conversation is now closed.")
                .with_action(Action::notify(
                    id,
                    "closed",
                    json!({ "reason": "user", "seq": seq }),
                ))
        }

        _ => {
            activate(&mut next);
            TransitionResult::new(next).reply(format!("Unknown command: /{name}"))
        }
    }
}

fn status_summary(state: &ConversationState) -> String {
    if state.attributes.is_empty() {
        return format!("State: {}.", state.state_tag);
    }
    let attrs: Vec<String> = state
        .attributes
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    format!("State: {}. {}", state.state_tag, attrs.join(", "))
}

// ============================================================
// System signals
// ============================================================

fn on_system(mut next: ConversationState, signal: &str) -> TransitionResult {
    match signal.trim() {
        "close" | "expire" => {
            next.state_tag = StateTag::Closed;
            next.attributes.remove(keys::AWAITING);
            let id = next.conversation_id.clone();
            let seq = next.last_applied_seq;
            TransitionResult::new(next).with_action(Action::notify(
                id,
                "closed",
                json!({ "reason": signal.trim(), "seq": seq }),
            ))
        }
        _ => TransitionResult::new(next).noop(),
    }
}

// ============================================================
// Reopen
// ============================================================

fn reopen(mut next: ConversationState) -> TransitionResult {
    next.state_tag = StateTag::Active;
    let times = bump(&mut next, keys::REOPENED);
    let id = next.conversation_id.clone();
    let seq = next.last_applied_seq;
    TransitionResult::new(next)
        .reply("Welcome back! This conversation is open again.")
        .with_action(Action::notify(
            id,
            "reopened",
            json!({ "times": times, "seq": seq }),
        ))
}

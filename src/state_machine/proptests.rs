//! Property-based tests for the conversation engine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::state::keys;
use super::*;
use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(offset_secs)
}

/// Feed events in order, skipping duplicates the way the dispatcher does
fn replay(events: &[Event]) -> ConversationState {
    let mut state = ConversationState::new("conv");
    for event in events {
        if state.has_applied(event.source_seq) {
            continue;
        }
        state = apply(&state, event).new_state;
    }
    state
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_command() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("/start".to_string()),
        Just("/status".to_string()),
        Just("/cancel".to_string()),
        Just("/close".to_string()),
        Just("/end".to_string()),
        "[a-z]{1,6}".prop_map(|k| format!("/ask {k}")),
        ("[a-z]{1,6}", "[a-z0-9]{1,6}").prop_map(|(k, v)| format!("/set {k} {v}")),
        "[a-z]{1,6}".prop_map(|k| format!("/unset {k}")),
        "[a-z]{1,8}".prop_map(|c| format!("/{c}")),
    ]
}

fn arb_system() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("close".to_string()),
        Just("expire".to_string()),
        Just("ping".to_string()),
        "[a-z]{1,8}",
    ]
}

fn arb_kind_and_payload() -> impl Strategy<Value = (EventKind, String)> {
    prop_oneof![
        4 => "[a-zA-Z ]{0,30}".prop_map(|t| (EventKind::Message, t)),
        3 => arb_command().prop_map(|c| (EventKind::Command, c)),
        1 => arb_system().prop_map(|s| (EventKind::System, s)),
        1 => Just((EventKind::Reopen, String::new())),
    ]
}

/// Events with strictly increasing sequence numbers
fn arb_event_stream() -> impl Strategy<Value = Vec<Event>> {
    proptest::collection::vec((arb_kind_and_payload(), 1i64..4), 0..30).prop_map(|items| {
        let mut seq = 0;
        items
            .into_iter()
            .map(|((kind, payload), gap)| {
                seq += gap;
                Event::new("conv", kind, payload, at(seq), seq)
            })
            .collect()
    })
}

fn arb_state() -> impl Strategy<Value = ConversationState> {
    arb_event_stream().prop_map(|events| replay(&events))
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // Invariant 1: apply is a pure function of its inputs
    #[test]
    fn prop_apply_is_deterministic(state in arb_state(), (kind, payload) in arb_kind_and_payload()) {
        let event = Event::new("conv", kind, payload, at(10_000), state.last_applied_seq + 1);
        prop_assert_eq!(apply(&state, &event), apply(&state, &event));
    }

    // Invariant 2: last_applied_seq never decreases
    #[test]
    fn prop_sequence_is_monotonic(events in arb_event_stream()) {
        let mut state = ConversationState::new("conv");
        for event in &events {
            let before = state.last_applied_seq;
            state = apply(&state, event).new_state;
            prop_assert!(state.last_applied_seq >= before);
        }
    }

    // Invariant 3: a closed conversation is frozen except for Reopen
    #[test]
    fn prop_closed_is_terminal(
        state in arb_state(),
        (kind, payload) in arb_kind_and_payload()
    ) {
        prop_assume!(kind != EventKind::Reopen);
        let mut closed = state;
        closed.state_tag = StateTag::Closed;
        let event = Event::new("conv", kind, payload, at(20_000), closed.last_applied_seq + 1);

        let result = apply(&closed, &event);
        prop_assert_eq!(&result.new_state, &closed);
        prop_assert_eq!(result.actions.len(), 1);
        prop_assert!(result.actions[0].is_noop());
    }

    // Invariant 4: nothing ever moves back to NEW once activated
    #[test]
    fn prop_never_returns_to_new(events in arb_event_stream()) {
        let mut state = ConversationState::new("conv");
        let mut left_new = false;
        for event in &events {
            state = apply(&state, event).new_state;
            if state.state_tag != StateTag::New {
                left_new = true;
            }
            prop_assert!(!(left_new && state.state_tag == StateTag::New));
        }
    }

    // Invariant 5: AWAITING_INPUT always knows which key it is waiting for
    #[test]
    fn prop_awaiting_has_key(events in arb_event_stream()) {
        let state = replay(&events);
        prop_assert_eq!(
            state.state_tag == StateTag::AwaitingInput,
            state.attr(keys::AWAITING).is_some()
        );
    }

    // Invariant 6: every transition produces at least one action, all for this conversation
    #[test]
    fn prop_actions_target_conversation(state in arb_state(), (kind, payload) in arb_kind_and_payload()) {
        let event = Event::new("conv", kind, payload, at(30_000), state.last_applied_seq + 1);
        let result = apply(&state, &event);
        prop_assert!(!result.actions.is_empty());
        prop_assert!(result.actions.iter().all(|a| a.conversation_id == "conv"));
    }

    // Invariant 7: replaying an already-applied prefix changes nothing
    #[test]
    fn prop_replay_is_idempotent(events in arb_event_stream()) {
        let once = replay(&events);
        let mut doubled = events.clone();
        doubled.extend(events.iter().cloned());
        prop_assert_eq!(replay(&doubled), once);
    }
}

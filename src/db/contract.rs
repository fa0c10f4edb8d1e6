//! Contract tests every `StateStore` must pass
//!
//! The same test bodies run unmodified against each backend.

use super::{StateStore, StoreError};
use crate::state_machine::{AttrValue, ConversationState, Event, EventKind, StateTag};
use chrono::{TimeZone, Utc};
use std::time::Duration;
use tokio::time::Instant;

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

fn state(id: &str, seq: i64, tag: StateTag) -> ConversationState {
    let mut s = ConversationState::new(id);
    s.state_tag = tag;
    s.last_applied_seq = seq;
    s.updated_at = Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(seq);
    s
}

pub async fn missing_conversation_is_none<S: StateStore>(store: &S) {
    assert_eq!(store.get("nobody", deadline()).await.unwrap(), None);
}

pub async fn insert_then_get_round_trips<S: StateStore>(store: &S) {
    let mut s = state("c1", 1, StateTag::Active);
    s.attributes.insert("name".into(), AttrValue::from("Ada"));
    s.attributes.insert("age".into(), AttrValue::Int(36));
    s.attributes.insert("vip".into(), AttrValue::Bool(true));

    store.put("c1", &s, None, deadline()).await.unwrap();
    assert_eq!(store.get("c1", deadline()).await.unwrap(), Some(s));
}

pub async fn update_with_matching_seq_succeeds<S: StateStore>(store: &S) {
    store
        .put("c1", &state("c1", 1, StateTag::Active), None, deadline())
        .await
        .unwrap();
    let next = state("c1", 5, StateTag::AwaitingInput);
    store.put("c1", &next, Some(1), deadline()).await.unwrap();

    assert_eq!(store.get("c1", deadline()).await.unwrap(), Some(next));
}

pub async fn stale_update_conflicts<S: StateStore>(store: &S) {
    store
        .put("c1", &state("c1", 1, StateTag::Active), None, deadline())
        .await
        .unwrap();
    store
        .put("c1", &state("c1", 2, StateTag::Active), Some(1), deadline())
        .await
        .unwrap();

    let err = store
        .put("c1", &state("c1", 3, StateTag::Closed), Some(1), deadline())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::Conflict {
            expected: Some(1),
            actual: Some(2)
        }
    );
    // The losing write left no trace
    let stored = store.get("c1", deadline()).await.unwrap().unwrap();
    assert_eq!(stored.last_applied_seq, 2);
    assert_eq!(stored.state_tag, StateTag::Active);
}

pub async fn second_insert_conflicts<S: StateStore>(store: &S) {
    store
        .put("c1", &state("c1", 1, StateTag::Active), None, deadline())
        .await
        .unwrap();
    let err = store
        .put("c1", &state("c1", 2, StateTag::Active), None, deadline())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::Conflict {
            expected: None,
            actual: Some(1)
        }
    );
}

pub async fn update_of_missing_conflicts<S: StateStore>(store: &S) {
    let err = store
        .put("c1", &state("c1", 2, StateTag::Active), Some(1), deadline())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::Conflict {
            expected: Some(1),
            actual: None
        }
    );
    assert_eq!(store.get("c1", deadline()).await.unwrap(), None);
}

pub async fn conversations_are_independent<S: StateStore>(store: &S) {
    store
        .put("a", &state("a", 3, StateTag::Active), None, deadline())
        .await
        .unwrap();
    store
        .put("b", &state("b", 7, StateTag::Closed), None, deadline())
        .await
        .unwrap();

    assert_eq!(
        store.get("a", deadline()).await.unwrap().unwrap().last_applied_seq,
        3
    );
    assert_eq!(
        store.get("b", deadline()).await.unwrap().unwrap().state_tag,
        StateTag::Closed
    );
}

pub async fn append_log_keeps_order_and_duplicates<S: StateStore>(store: &S) {
    let at = Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap();
    let first = Event::new("c1", EventKind::Message, "hello", at, 1);
    let second = Event::new("c1", EventKind::Command, "/status", at, 2);
    let other = Event::new("c2", EventKind::System, "expire", at, 1);

    store.append_log("c1", &first, deadline()).await.unwrap();
    store.append_log("c2", &other, deadline()).await.unwrap();
    store.append_log("c1", &second, deadline()).await.unwrap();
    store.append_log("c1", &second, deadline()).await.unwrap();

    let log = store.read_log("c1", deadline()).await.unwrap();
    let seqs: Vec<i64> = log.iter().map(|e| e.source_seq).collect();
    assert_eq!(seqs, vec![1, 2, 2]);
    assert_eq!(log[0].kind, EventKind::Message);
    assert_eq!(log[0].payload, "hello");
    assert_eq!(log[0].received_at, at);
    assert!(store.read_log("nobody", deadline()).await.unwrap().is_empty());
}

macro_rules! store_contract_tests {
    ($name:ident, $make:expr) => {
        mod $name {
            #[tokio::test]
            async fn missing_conversation_is_none() {
                super::missing_conversation_is_none(&$make).await;
            }

            #[tokio::test]
            async fn insert_then_get_round_trips() {
                super::insert_then_get_round_trips(&$make).await;
            }

            #[tokio::test]
            async fn update_with_matching_seq_succeeds() {
                super::update_with_matching_seq_succeeds(&$make).await;
            }

            #[tokio::test]
            async fn stale_update_conflicts() {
                super::stale_update_conflicts(&$make).await;
            }

            #[tokio::test]
            async fn second_insert_conflicts() {
                super::second_insert_conflicts(&$make).await;
            }

            #[tokio::test]
            async fn update_of_missing_conflicts() {
                super::update_of_missing_conflicts(&$make).await;
            }

            #[tokio::test]
            async fn conversations_are_independent() {
                super::conversations_are_independent(&$make).await;
            }

            #[tokio::test]
            async fn append_log_keeps_order_and_duplicates() {
                super::append_log_keeps_order_and_duplicates(&$make).await;
            }
        }
    };
}

store_contract_tests!(local, crate::db::LocalStore::open_in_memory().unwrap());
store_contract_tests!(
    sheet,
    crate::db::SheetStore::new(crate::db::testing::MemorySheetClient::new())
);

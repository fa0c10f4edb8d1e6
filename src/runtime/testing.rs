//! Test doubles for the runtime
//!
//! Wrap a real store to inject faults, and capture deliveries instead of
//! sending them.

use super::traits::{Delivery, DeliveryError};
use crate::db::{LogEntry, StateStore, StoreError, StoreResult};
use crate::state_machine::{Action, ConversationState, Event};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Fault-injecting store
// ============================================================================

/// Any store, with scripted conflicts and outages
pub struct FaultyStore<S> {
    inner: S,
    conflicts: AtomicU32,
    outages: AtomicU32,
    lost_acks: AtomicU32,
    log_down: AtomicBool,
    pub gets: AtomicU32,
    pub puts: AtomicU32,
}

impl<S: StateStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            conflicts: AtomicU32::new(0),
            outages: AtomicU32::new(0),
            lost_acks: AtomicU32::new(0),
            log_down: AtomicBool::new(false),
            gets: AtomicU32::new(0),
            puts: AtomicU32::new(0),
        }
    }

    /// Reject the next `n` puts as if another writer got there first
    pub fn conflict_next(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` gets as unreachable
    pub fn fail_next(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    /// Commit the next `n` puts but report them as timed out
    pub fn lose_ack_next(&self, n: u32) {
        self.lost_acks.store(n, Ordering::SeqCst);
    }

    /// Make every `append_log` fail
    pub fn break_log(&self) {
        self.log_down.store(true, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl<S: StateStore> StateStore for FaultyStore<S> {
    async fn get(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Option<ConversationState>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.outages) {
            return Err(StoreError::BackendUnavailable("injected outage".to_string()));
        }
        self.inner.get(conversation_id, deadline).await
    }

    async fn put(
        &self,
        conversation_id: &str,
        state: &ConversationState,
        expected_last_applied_seq: Option<i64>,
        deadline: Instant,
    ) -> StoreResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.conflicts) {
            return Err(StoreError::Conflict {
                expected: expected_last_applied_seq,
                actual: expected_last_applied_seq.map(|seq| seq + 1).or(Some(0)),
            });
        }
        self.inner
            .put(conversation_id, state, expected_last_applied_seq, deadline)
            .await?;
        if take_one(&self.lost_acks) {
            return Err(StoreError::BackendUnavailable("put timed out".to_string()));
        }
        Ok(())
    }

    async fn append_log(
        &self,
        conversation_id: &str,
        event: &Event,
        deadline: Instant,
    ) -> StoreResult<()> {
        if self.log_down.load(Ordering::SeqCst) {
            return Err(StoreError::BackendUnavailable("log sheet offline".to_string()));
        }
        self.inner.append_log(conversation_id, event, deadline).await
    }

    async fn read_log(
        &self,
        conversation_id: &str,
        deadline: Instant,
    ) -> StoreResult<Vec<LogEntry>> {
        self.inner.read_log(conversation_id, deadline).await
    }
}

// ============================================================================
// Deliveries
// ============================================================================

/// Keeps every delivered action
#[derive(Default)]
pub struct RecordingDelivery {
    delivered: Mutex<Vec<Action>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Action> {
        self.delivered.lock().unwrap().clone()
    }

    /// Wait until at least `n` actions arrived (deliveries run on spawned tasks)
    pub async fn wait_for(&self, n: usize) -> Vec<Action> {
        let give_up = Instant::now() + Duration::from_secs(2);
        loop {
            let delivered = self.delivered();
            if delivered.len() >= n || Instant::now() >= give_up {
                return delivered;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(&self, action: &Action) -> Result<(), DeliveryError> {
        self.delivered.lock().unwrap().push(action.clone());
        Ok(())
    }
}

/// Refuses everything, counting attempts
#[derive(Default)]
pub struct FailingDelivery {
    pub attempts: AtomicU32,
}

#[async_trait]
impl Delivery for FailingDelivery {
    async fn deliver(&self, _action: &Action) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError::Refused(502))
    }
}

//! Event dispatch with optimistic concurrency
//!
//! One call to [`Dispatcher::process`] reads the stored state, applies the
//! event and writes the result back conditioned on the `last_applied_seq` it
//! read. A conflicting write re-reads and re-applies; nothing is ever merged.

use super::traits::Delivery;
use crate::config::RetryConfig;
use crate::db::{StateStore, StoreError};
use crate::state_machine::{apply, Action, ConversationState, Event};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Longest single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Conversation {conversation_id} contended: gave up on seq {source_seq} after {attempts} attempts")]
    Contended {
        conversation_id: String,
        source_seq: i64,
        attempts: u32,
    },
    #[error("Backend unavailable for {conversation_id} seq {source_seq}: {reason}")]
    BackendUnavailable {
        conversation_id: String,
        source_seq: i64,
        reason: String,
    },
    #[error("Storage error for {conversation_id} seq {source_seq}: {error}")]
    Storage {
        conversation_id: String,
        source_seq: i64,
        #[source]
        error: StoreError,
    },
    #[error("Shutting down; {conversation_id} seq {source_seq} not processed")]
    Shutdown {
        conversation_id: String,
        source_seq: i64,
    },
}

impl DispatchError {
    /// Conversation and sequence number of the failed event
    pub fn identity(&self) -> (&str, i64) {
        match self {
            DispatchError::Contended {
                conversation_id,
                source_seq,
                ..
            }
            | DispatchError::BackendUnavailable {
                conversation_id,
                source_seq,
                ..
            }
            | DispatchError::Storage {
                conversation_id,
                source_seq,
                ..
            }
            | DispatchError::Shutdown {
                conversation_id,
                source_seq,
            } => (conversation_id, *source_seq),
        }
    }

    pub(crate) fn shutdown(event: &Event) -> Self {
        DispatchError::Shutdown {
            conversation_id: event.conversation_id.clone(),
            source_seq: event.source_seq,
        }
    }
}

/// What happened to one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Transition committed
    Applied {
        state: ConversationState,
        actions: Vec<Action>,
        attempts: u32,
    },
    /// Already applied (`source_seq <= last_applied_seq`); nothing written
    Duplicate {
        state: ConversationState,
        actions: Vec<Action>,
    },
    /// Closed conversation ignored the event; nothing written
    Unchanged {
        state: ConversationState,
        actions: Vec<Action>,
    },
}

impl DispatchOutcome {
    pub fn state(&self) -> &ConversationState {
        match self {
            DispatchOutcome::Applied { state, .. }
            | DispatchOutcome::Duplicate { state, .. }
            | DispatchOutcome::Unchanged { state, .. } => state,
        }
    }

    pub fn actions(&self) -> &[Action] {
        match self {
            DispatchOutcome::Applied { actions, .. }
            | DispatchOutcome::Duplicate { actions, .. }
            | DispatchOutcome::Unchanged { actions, .. } => actions,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            DispatchOutcome::Applied { .. } => "applied",
            DispatchOutcome::Duplicate { .. } => "duplicate",
            DispatchOutcome::Unchanged { .. } => "unchanged",
        }
    }
}

/// Retry budgets. Conflicts and outages are counted separately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unavailable_max_attempts: u32,
    pub backoff: Duration,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            unavailable_max_attempts: config.unavailable_max_attempts,
            backoff: config.backoff,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry number `retry` (1-based), with jitter
    fn delay(&self, retry: u32) -> Duration {
        let exp = self
            .backoff
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16))
            .min(MAX_BACKOFF);
        let jitter_cap = u64::try_from(self.backoff.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Transition whose put may or may not have committed
struct Written {
    state: ConversationState,
    actions: Vec<Action>,
}

/// Applies events against a store and hands actions to delivery
pub struct Dispatcher<S, D> {
    store: Arc<S>,
    delivery: Arc<D>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl<S, D> Dispatcher<S, D>
where
    S: StateStore + 'static,
    D: Delivery + 'static,
{
    pub fn new(store: Arc<S>, delivery: Arc<D>, policy: RetryPolicy, request_timeout: Duration) -> Self {
        Self {
            store,
            delivery,
            policy,
            request_timeout,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub(crate) fn deadline(&self) -> Instant {
        Instant::now() + self.request_timeout
    }

    /// Apply one event, retrying on conflict and outage
    pub async fn process(&self, event: &Event) -> Result<DispatchOutcome, DispatchError> {
        let conv_id = event.conversation_id.as_str();
        let source_seq = event.source_seq;
        let mut attempts = 0u32;
        let mut conflicts = 0u32;
        let mut outages = 0u32;
        let mut in_doubt = None;

        loop {
            attempts += 1;
            let error = match self.attempt(event, attempts, &mut in_doubt).await {
                Ok(outcome) => {
                    self.finish(event, &outcome).await;
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            match error {
                StoreError::Conflict { expected, actual } => {
                    conflicts += 1;
                    if conflicts >= self.policy.max_attempts {
                        tracing::warn!(conv_id, source_seq, attempts, "Giving up on contended conversation");
                        return Err(DispatchError::Contended {
                            conversation_id: conv_id.to_string(),
                            source_seq,
                            attempts,
                        });
                    }
                    tracing::debug!(conv_id, source_seq, attempt = attempts, ?expected, ?actual, "Write conflict, retrying");
                    tokio::time::sleep(self.policy.delay(conflicts)).await;
                }
                StoreError::BackendUnavailable(reason) => {
                    outages += 1;
                    if outages >= self.policy.unavailable_max_attempts {
                        tracing::error!(conv_id, source_seq, attempts, reason = %reason, "Backend unavailable");
                        return Err(DispatchError::BackendUnavailable {
                            conversation_id: conv_id.to_string(),
                            source_seq,
                            reason,
                        });
                    }
                    tracing::warn!(conv_id, source_seq, attempt = attempts, reason = %reason, "Backend unavailable, retrying");
                    tokio::time::sleep(self.policy.delay(outages)).await;
                }
                error => {
                    tracing::error!(conv_id, source_seq, error = %error, "Storage error");
                    return Err(DispatchError::Storage {
                        conversation_id: conv_id.to_string(),
                        source_seq,
                        error,
                    });
                }
            }
        }
    }

    /// Read, apply, conditionally write.
    ///
    /// `in_doubt` holds the transition of a put that timed out: the write may
    /// still have landed, and if the stored state is exactly that write the
    /// event counts as applied.
    async fn attempt(
        &self,
        event: &Event,
        attempts: u32,
        in_doubt: &mut Option<Written>,
    ) -> Result<DispatchOutcome, StoreError> {
        let conv_id = event.conversation_id.as_str();
        let stored = self.store.get(conv_id, self.deadline()).await?;
        let expected = stored.as_ref().map(|s| s.last_applied_seq);
        let current = stored.unwrap_or_else(|| ConversationState::new(conv_id));

        if let Some(written) = in_doubt.take() {
            if current.same_content(&written.state) {
                tracing::info!(
                    conv_id,
                    source_seq = event.source_seq,
                    "Timed-out write landed"
                );
                return Ok(DispatchOutcome::Applied {
                    state: current,
                    actions: written.actions,
                    attempts,
                });
            }
        }

        if current.has_applied(event.source_seq) {
            let actions = vec![Action::noop(conv_id)];
            return Ok(DispatchOutcome::Duplicate {
                state: current,
                actions,
            });
        }

        let result = apply(&current, event);
        if result.new_state == current {
            return Ok(DispatchOutcome::Unchanged {
                state: current,
                actions: result.actions,
            });
        }

        match self
            .store
            .put(conv_id, &result.new_state, expected, self.deadline())
            .await
        {
            Ok(()) => {}
            Err(e @ StoreError::BackendUnavailable(_)) => {
                *in_doubt = Some(Written {
                    state: result.new_state,
                    actions: result.actions,
                });
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        Ok(DispatchOutcome::Applied {
            state: result.new_state,
            actions: result.actions,
            attempts,
        })
    }

    /// Audit and deliver after the outcome is final
    async fn finish(&self, event: &Event, outcome: &DispatchOutcome) {
        let conv_id = event.conversation_id.as_str();
        let source_seq = event.source_seq;

        match outcome {
            DispatchOutcome::Applied { state, attempts, .. } => {
                tracing::info!(
                    conv_id,
                    source_seq,
                    attempts,
                    state = %state.state_tag,
                    "Event applied"
                );
                if let Err(e) = self.store.append_log(conv_id, event, self.deadline()).await {
                    tracing::warn!(conv_id, source_seq, error = %e, "Failed to append audit log");
                }
            }
            DispatchOutcome::Duplicate { state, .. } => {
                tracing::warn!(
                    conv_id,
                    source_seq,
                    last_applied_seq = state.last_applied_seq,
                    "Dropping already-applied event"
                );
                return;
            }
            DispatchOutcome::Unchanged { .. } => {
                tracing::info!(conv_id, source_seq, "Conversation closed, event ignored");
                return;
            }
        }

        let actions: Vec<Action> = outcome
            .actions()
            .iter()
            .filter(|a| !a.is_noop())
            .cloned()
            .collect();
        if actions.is_empty() {
            return;
        }

        let delivery = Arc::clone(&self.delivery);
        let identity = event.identity().to_string();
        tokio::spawn(async move {
            for action in actions {
                if let Err(e) = delivery.deliver(&action).await {
                    tracing::error!(
                        conv_id = %action.conversation_id,
                        event = %identity,
                        kind = ?action.kind,
                        error = %e,
                        "Failed to deliver action"
                    );
                }
            }
        });
    }
}

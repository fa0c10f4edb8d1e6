//! Runtime for processing conversation events
//!
//! Each active conversation gets one worker task fed by an mpsc mailbox.
//! The worker collects whatever arrives within a short reorder window and
//! dispatches it in `source_seq` order, so events submitted concurrently
//! for one conversation are applied as if they had arrived sequentially.
//! Different conversations never wait on each other.

mod dispatcher;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher, RetryPolicy};
pub use traits::*;

use crate::db::{Backend, LogEntry, StateStore, StoreResult};
use crate::state_machine::{ConversationState, Event};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Type alias for the production manager with concrete implementations
pub type ProductionManager = ConversationManager<Backend, DeliveryTarget>;

const MAILBOX_CAPACITY: usize = 64;

type Reply = oneshot::Sender<Result<DispatchOutcome, DispatchError>>;

struct Submission {
    event: Event,
    reply: Reply,
}

/// Mailbox of a running worker
struct WorkerHandle {
    tx: mpsc::Sender<Submission>,
    generation: u64,
}

type WorkerMap = Arc<RwLock<HashMap<String, WorkerHandle>>>;

/// Timing knobs for conversation workers
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub reorder_window: Duration,
    pub idle_timeout: Duration,
}

/// Routes events to per-conversation workers
pub struct ConversationManager<S, D> {
    dispatcher: Arc<Dispatcher<S, D>>,
    workers: WorkerMap,
    config: WorkerConfig,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl<S, D> ConversationManager<S, D>
where
    S: StateStore + 'static,
    D: Delivery + 'static,
{
    pub fn new(dispatcher: Dispatcher<S, D>, config: WorkerConfig) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            workers: Arc::new(RwLock::new(HashMap::new())),
            config,
            next_generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        self.dispatcher.store()
    }

    /// Process one event and wait for its outcome
    pub async fn submit(&self, event: Event) -> Result<DispatchOutcome, DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::shutdown(&event));
        }
        let refused = DispatchError::shutdown(&event);
        let (reply, outcome) = oneshot::channel();
        let mut submission = Submission { event, reply };

        // A worker may retire between lookup and send; the second round
        // finds the map entry gone and starts a fresh one.
        for _ in 0..2 {
            let tx = self.mailbox(&submission.event.conversation_id).await;
            match tx.send(submission).await {
                Ok(()) => return outcome.await.unwrap_or(Err(refused)),
                Err(mpsc::error::SendError(back)) => {
                    tracing::debug!(conv_id = %back.event.conversation_id, "Worker retired, respawning");
                    submission = back;
                }
            }
        }
        Err(refused)
    }

    /// Stored state, read outside the conversation's worker
    pub async fn lookup(&self, conversation_id: &str) -> StoreResult<Option<ConversationState>> {
        self.store()
            .get(conversation_id, self.dispatcher.deadline())
            .await
    }

    /// Audit rows for one conversation, oldest first
    pub async fn audit_log(&self, conversation_id: &str) -> StoreResult<Vec<LogEntry>> {
        self.store()
            .read_log(conversation_id, self.dispatcher.deadline())
            .await
    }

    /// Stop accepting events. In-flight dispatches finish; queued ones fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of conversations with a live worker
    pub async fn active_conversations(&self) -> usize {
        self.workers.read().await.len()
    }

    async fn mailbox(&self, conversation_id: &str) -> mpsc::Sender<Submission> {
        {
            let workers = self.workers.read().await;
            if let Some(handle) = workers.get(conversation_id) {
                if !handle.tx.is_closed() {
                    return handle.tx.clone();
                }
            }
        }

        let mut workers = self.workers.write().await;
        if let Some(handle) = workers.get(conversation_id) {
            if !handle.tx.is_closed() {
                return handle.tx.clone();
            }
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        workers.insert(
            conversation_id.to_string(),
            WorkerHandle {
                tx: tx.clone(),
                generation,
            },
        );

        let worker = Worker {
            conversation_id: conversation_id.to_string(),
            generation,
            rx,
            dispatcher: Arc::clone(&self.dispatcher),
            workers: Arc::clone(&self.workers),
            config: self.config,
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(worker.run());
        tracing::debug!(conv_id = %conversation_id, generation, "Started conversation worker");
        tx
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker<S, D> {
    conversation_id: String,
    generation: u64,
    rx: mpsc::Receiver<Submission>,
    dispatcher: Arc<Dispatcher<S, D>>,
    workers: WorkerMap,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

/// What a worker found in its mailbox when it tried to stop
enum Handoff {
    /// Entry removed; leftovers only exist when shutting down
    Retired(Vec<Submission>),
    /// Events slipped in while stopping; the worker stays on a fresh mailbox
    Kept(Vec<Submission>),
}

impl<S, D> Worker<S, D>
where
    S: StateStore + 'static,
    D: Delivery + 'static,
{
    async fn run(mut self) {
        loop {
            self.serve().await;
            match self.hand_off().await {
                Handoff::Retired(leftover) => {
                    self.dispatch(leftover).await;
                    break;
                }
                Handoff::Kept(leftover) => {
                    tracing::debug!(conv_id = %self.conversation_id, count = leftover.len(), "Late events, worker kept");
                    self.dispatch(leftover).await;
                }
            }
        }
        tracing::debug!(conv_id = %self.conversation_id, "Conversation worker stopped");
    }

    /// Dispatch batches until idle or cancelled
    async fn serve(&mut self) {
        loop {
            let first = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return,
                next = tokio::time::timeout(self.config.idle_timeout, self.rx.recv()) => match next {
                    Ok(Some(submission)) => submission,
                    // Idle too long, or every sender is gone
                    Ok(None) | Err(_) => return,
                },
            };

            let mut batch = vec![first];
            let window_end = Instant::now() + self.config.reorder_window;
            while let Ok(Some(more)) = tokio::time::timeout_at(window_end, self.rx.recv()).await {
                batch.push(more);
            }
            self.dispatch(batch).await;
        }
    }

    async fn dispatch(&self, mut batch: Vec<Submission>) {
        // Stable: equal sequence numbers keep arrival order
        batch.sort_by_key(|s| s.event.source_seq);
        for submission in batch {
            let result = if self.shutdown.is_cancelled() {
                Err(DispatchError::shutdown(&submission.event))
            } else {
                self.dispatcher.process(&submission.event).await
            };
            // The submitter may have gone away; the outcome is already durable
            let _ = submission.reply.send(result);
        }
    }

    /// Close the mailbox and give up the map entry, all under the map's write
    /// lock. A new worker can only start once the entry is gone, so this
    /// worker never runs alongside its successor.
    async fn hand_off(&mut self) -> Handoff {
        let mut workers = self.workers.write().await;
        self.rx.close();
        let mut leftover = Vec::new();
        while let Ok(submission) = self.rx.try_recv() {
            leftover.push(submission);
        }

        let owned = workers
            .get(&self.conversation_id)
            .is_some_and(|h| h.generation == self.generation);
        if leftover.is_empty() || self.shutdown.is_cancelled() || !owned {
            if owned {
                workers.remove(&self.conversation_id);
            }
            return Handoff::Retired(leftover);
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.rx = rx;
        workers.insert(
            self.conversation_id.clone(),
            WorkerHandle {
                tx,
                generation: self.generation,
            },
        );
        Handoff::Kept(leftover)
    }
}

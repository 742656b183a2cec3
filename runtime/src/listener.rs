//! Background transaction listener.
//!
//! Subscribes to the storefront's live transaction stream and feeds every
//! event through the [`TransactionProcessor`], one at a time, in stream order.
//!
//! # States
//!
//! ```text
//!            start()                  transient error
//! Stopped ───────────► Listening ─────────────────────► Reconnecting
//!    ▲                  │    ▲                              │
//!    │ stop() / fatal   │    └───── resubscribed ───────────┘
//!    └──────────────────┘           (backoff per RetryPolicy)
//! ```
//!
//! A transient failure (stream error, stream end, failed subscription)
//! triggers a resubscription after an exponential backoff. The attempt
//! counter resets once an event has been processed. When retries run out or
//! a fatal error arrives the listener stops, publishes exactly one
//! [`StoreChange::ListenerFatal`], and leaves the cache as it was.

use crate::notifications::{ChangeNotifier, StoreChange};
use crate::processor::TransactionProcessor;
use crate::retry::RetryPolicy;
use futures::StreamExt;
use purchase_state_core::{ListenerError, Storefront, TransactionStream};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle state of the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerState {
    /// Not running.
    Stopped,
    /// Subscribed and processing events.
    Listening,
    /// Backing off before resubscribing.
    Reconnecting,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Listening => write!(f, "listening"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

struct Inner {
    storefront: Arc<dyn Storefront>,
    processor: TransactionProcessor,
    notifier: ChangeNotifier,
    policy: RetryPolicy,
    state: watch::Sender<ListenerState>,
    last_error: Mutex<Option<ListenerError>>,
}

struct RunningTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

enum Consumed {
    Shutdown,
    Failed(ListenerError),
}

/// Keeps the entitlement cache in sync with transactions made elsewhere.
pub struct TransactionListener {
    inner: Arc<Inner>,
    task: Mutex<Option<RunningTask>>,
}

impl TransactionListener {
    /// Create a stopped listener.
    #[must_use]
    pub fn new(
        storefront: Arc<dyn Storefront>,
        processor: TransactionProcessor,
        notifier: ChangeNotifier,
        policy: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Stopped);
        Self {
            inner: Arc::new(Inner {
                storefront,
                processor,
                notifier,
                policy,
                state,
                last_error: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the listening task. No-op while it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            tracing::debug!("Transaction listener already running");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.inner.state.send_replace(ListenerState::Listening);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(shutdown_rx).await });

        tracing::info!("Transaction listener started");
        *task = Some(RunningTask { shutdown, handle });
    }

    /// Signal shutdown and wait for the task to finish.
    ///
    /// An event that was already taken off the stream is processed first.
    pub async fn stop(&self) {
        let running = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(err) = running.handle.await {
                tracing::error!(error = %err, "Transaction listener task failed");
            }
            tracing::info!("Transaction listener stopped");
        }
        self.inner.state.send_replace(ListenerState::Stopped);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.inner.state.subscribe()
    }

    /// The error that last stopped or interrupted the listener.
    #[must_use]
    pub fn last_error(&self) -> Option<ListenerError> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for TransactionListener {
    fn drop(&mut self) {
        let running = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
        }
    }
}

impl std::fmt::Debug for TransactionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionListener")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let subscribed = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.storefront.transaction_stream() => result,
            };

            let failure = match subscribed {
                Ok(mut stream) => {
                    self.set_state(ListenerState::Listening);
                    match self.consume(&mut stream, &mut shutdown, &mut attempt).await {
                        Consumed::Shutdown => break,
                        Consumed::Failed(err) => err,
                    }
                }
                Err(err) => ListenerError::from(err),
            };

            self.record_error(&failure);
            let reason = match failure {
                ListenerError::Fatal(_) => {
                    self.fail(failure);
                    return;
                }
                ListenerError::Transient(reason) => reason,
            };

            if !self.policy.should_retry(attempt) {
                self.fail(ListenerError::Fatal(format!(
                    "gave up after {attempt} reconnection attempts: {reason}"
                )));
                return;
            }

            let delay = self.policy.delay_for_attempt(attempt);
            attempt += 1;
            self.set_state(ListenerState::Reconnecting);
            metrics::counter!("store_listener_reconnects_total").increment(1);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis(),
                %reason,
                "Transaction stream interrupted, resubscribing"
            );

            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ListenerState::Stopped);
    }

    async fn consume(
        &self,
        stream: &mut TransactionStream,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> Consumed {
        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => return Consumed::Shutdown,
                next = stream.next() => next,
            };

            match next {
                // Outside the select so a dequeued event always completes.
                Some(Ok(transaction)) => {
                    self.processor.process(transaction).await;
                    *attempt = 0;
                }
                Some(Err(err)) => return Consumed::Failed(ListenerError::from(err)),
                None => {
                    return Consumed::Failed(ListenerError::Transient(
                        "transaction stream ended".to_string(),
                    ));
                }
            }
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn record_error(&self, err: &ListenerError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
    }

    fn fail(&self, err: ListenerError) {
        tracing::error!(error = %err, "Transaction listener stopped on unrecoverable error");
        metrics::counter!("store_listener_fatal_total").increment(1);
        self.record_error(&err);
        self.notifier.publish(StoreChange::ListenerFatal(err));
        self.set_state(ListenerState::Stopped);
    }
}

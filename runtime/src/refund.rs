//! Refund request coordination.
//!
//! Each request runs the storefront's refund flow on its own task and hands
//! the caller a [`RefundTicket`]. Exactly one terminal state is delivered
//! per request, whichever comes first of the storefront's outcome and the
//! host's [`RefundCoordinator::dismiss`]. It reaches both the ticket and a
//! [`StoreChange::RefundResolved`] notification.

use crate::notifications::{ChangeNotifier, StoreChange};
use futures::StreamExt;
use purchase_state_core::{
    RefundError, RefundRequest, RefundState, Storefront, TransactionId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Handle to a refund request.
#[derive(Debug)]
pub struct RefundTicket {
    request: RefundRequest,
    resolved: oneshot::Receiver<RefundRequest>,
}

impl RefundTicket {
    /// The request as it was created (always `Pending`).
    #[must_use]
    pub const fn request(&self) -> &RefundRequest {
        &self.request
    }

    /// Transaction being refunded.
    #[must_use]
    pub const fn transaction_id(&self) -> &TransactionId {
        &self.request.transaction_id
    }

    /// Wait for the terminal state.
    pub async fn outcome(self) -> RefundRequest {
        let transaction_id = self.request.transaction_id;
        self.resolved.await.unwrap_or(RefundRequest {
            transaction_id,
            state: RefundState::Failed(RefundError::UserDismissed),
        })
    }
}

/// One pending request; the sender is taken by whoever resolves it first.
struct Slot {
    resolve: Mutex<Option<oneshot::Sender<RefundRequest>>>,
    task: Mutex<Option<AbortHandle>>,
}

struct Shared {
    pending: Mutex<HashMap<TransactionId, Arc<Slot>>>,
    notifier: ChangeNotifier,
}

impl Shared {
    /// Deliver `state` unless the request was already resolved.
    fn resolve(&self, transaction_id: &TransactionId, slot: &Slot, state: RefundState) -> bool {
        let Some(sender) = slot
            .resolve
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return false;
        };

        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending
                .get(transaction_id)
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), slot))
            {
                pending.remove(transaction_id);
            }
        }

        let request = RefundRequest {
            transaction_id: transaction_id.clone(),
            state,
        };
        tracing::info!(%transaction_id, state = ?request.state, "Refund request resolved");
        metrics::counter!("store_refunds_resolved_total").increment(1);

        // The ticket may have been dropped; the notification still goes out.
        let _ = sender.send(request.clone());
        self.notifier.publish(StoreChange::RefundResolved(request));
        true
    }
}

/// Coordinates refund requests.
pub struct RefundCoordinator {
    storefront: Arc<dyn Storefront>,
    shared: Arc<Shared>,
}

impl RefundCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(storefront: Arc<dyn Storefront>, notifier: ChangeNotifier) -> Self {
        Self {
            storefront,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                notifier,
            }),
        }
    }

    /// Start the storefront refund flow for `transaction_id`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RefundError::AlreadyPending`] when a request for the same
    /// transaction has not resolved yet.
    #[tracing::instrument(skip(self))]
    pub fn request_refund(&self, transaction_id: &TransactionId) -> Result<RefundTicket, RefundError> {
        let (sender, resolved) = oneshot::channel();
        let slot = Arc::new(Slot {
            resolve: Mutex::new(Some(sender)),
            task: Mutex::new(None),
        });

        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if pending.contains_key(transaction_id) {
                return Err(RefundError::AlreadyPending(transaction_id.clone()));
            }
            pending.insert(transaction_id.clone(), Arc::clone(&slot));
        }

        metrics::counter!("store_refunds_requested_total").increment(1);
        tracing::info!("Refund requested");

        let storefront = Arc::clone(&self.storefront);
        let shared = Arc::clone(&self.shared);
        let task_slot = Arc::clone(&slot);
        let id = transaction_id.clone();
        let handle = tokio::spawn(async move {
            let state = run_refund_flow(storefront.as_ref(), &id).await;
            shared.resolve(&id, &task_slot, state);
        });
        *slot.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.abort_handle());

        Ok(RefundTicket {
            request: RefundRequest::pending(transaction_id.clone()),
            resolved,
        })
    }

    /// Resolve a pending request as [`RefundError::UserDismissed`].
    ///
    /// Returns `false` if there is no pending request for `transaction_id`.
    pub fn dismiss(&self, transaction_id: &TransactionId) -> bool {
        let slot = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(transaction_id)
            .cloned();
        let Some(slot) = slot else {
            return false;
        };

        let resolved = self.shared.resolve(
            transaction_id,
            &slot,
            RefundState::Failed(RefundError::UserDismissed),
        );
        if resolved {
            if let Some(task) = slot.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
                task.abort();
            }
        }
        resolved
    }

    /// Dismiss every pending request.
    pub fn dismiss_all(&self) {
        for transaction_id in self.pending() {
            self.dismiss(&transaction_id);
        }
    }

    /// Transactions with a refund request awaiting its outcome.
    #[must_use]
    pub fn pending(&self) -> Vec<TransactionId> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for RefundCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefundCoordinator")
            .field("pending", &self.pending().len())
            .finish_non_exhaustive()
    }
}

async fn run_refund_flow(storefront: &dyn Storefront, transaction_id: &TransactionId) -> RefundState {
    let mut outcomes = match storefront.request_refund(transaction_id).await {
        Ok(outcomes) => outcomes,
        Err(err) => {
            tracing::warn!(%transaction_id, error = %err, "Refund flow failed to start");
            return RefundState::Failed(RefundError::SubmissionFailed(err.to_string()));
        }
    };

    match outcomes.next().await {
        Some(Ok(outcome)) => RefundState::from(outcome),
        Some(Err(err)) => RefundState::Failed(RefundError::SubmissionFailed(err.to_string())),
        None => RefundState::Failed(RefundError::UserDismissed),
    }
}

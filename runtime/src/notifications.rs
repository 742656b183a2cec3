//! Change notification fan-out.
//!
//! Every state change the engine makes is published as a [`StoreChange`] on a
//! broadcast channel. Presentation layers subscribe instead of polling.
//!
//! # Delivery
//!
//! Each subscriber has a bounded buffer. A subscriber that falls behind
//! receives [`StoreChange::Lagged`] in place of the changes it missed; at that
//! point it should re-read the snapshots it renders from. So no subscriber
//! silently misses that state changed, even when it misses which change.
//!
//! # Example
//!
//! ```ignore
//! let subscription = store.subscribe(|change| {
//!     tracing::info!(?change, "re-rendering");
//! });
//! // ...
//! drop(subscription); // unsubscribes
//! ```

use crate::purchase::PurchaseState;
use purchase_state_core::{
    Entitlement, Generation, ListenerError, ProductId, RefundRequest,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// A change in engine state.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreChange {
    /// A catalog refresh installed a new snapshot.
    CatalogRefreshed {
        /// Generation of the new catalog snapshot
        generation: Generation,
        /// Number of products in it
        product_count: usize,
    },

    /// A single entitlement changed after a transaction was applied.
    EntitlementChanged(Entitlement),

    /// The entitlement cache was rebuilt from current entitlements.
    EntitlementsRebuilt {
        /// Generation of the new entitlement snapshot
        generation: Generation,
        /// Number of owned products after the rebuild
        owned: usize,
    },

    /// A product's purchase state changed.
    PurchaseStateChanged {
        /// Product being purchased
        product_id: ProductId,
        /// New state
        state: PurchaseState,
    },

    /// A refund request reached its terminal state.
    RefundResolved(RefundRequest),

    /// The transaction listener stopped on an unrecoverable error. The cache
    /// keeps its last known good state.
    ListenerFatal(ListenerError),

    /// This subscriber missed `missed` changes; re-read snapshots.
    Lagged {
        /// Number of changes dropped from this subscriber's buffer
        missed: u64,
    },
}

/// Publisher side of the change channel.
#[derive(Clone, Debug)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<StoreChange>,
}

impl ChangeNotifier {
    /// Create a notifier buffering `capacity` changes per subscriber.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a change to all current subscribers.
    pub fn publish(&self, change: StoreChange) {
        metrics::counter!("store_notifications_published_total").increment(1);
        // No subscribers is not an error; nothing is listening yet.
        if self.tx.send(change).is_err() {
            tracing::trace!("Change published with no subscribers");
        }
    }

    /// Subscribe to changes published from now on.
    #[must_use]
    pub fn subscribe(&self) -> ChangeReceiver {
        ChangeReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Run `on_change` for every change on a background task.
    ///
    /// Must be called from within a Tokio runtime. Dropping the returned
    /// [`Subscription`] unsubscribes.
    pub fn subscribe_fn<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(StoreChange) + Send + Sync + 'static,
    {
        let mut receiver = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(change) = receiver.recv().await {
                on_change(change);
            }
        });
        Subscription { task }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Subscriber side of the change channel.
#[derive(Debug)]
pub struct ChangeReceiver {
    rx: broadcast::Receiver<StoreChange>,
}

impl ChangeReceiver {
    /// Wait for the next change.
    ///
    /// Returns `None` once the engine has been dropped. A lagging receiver
    /// gets [`StoreChange::Lagged`] before resuming with the oldest change
    /// still buffered.
    pub async fn recv(&mut self) -> Option<StoreChange> {
        match self.rx.recv().await {
            Ok(change) => Some(change),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Change subscriber lagged");
                metrics::counter!("store_notifications_lagged_total").increment(missed);
                Some(StoreChange::Lagged { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Take the next change if one is already buffered.
    pub fn try_recv(&mut self) -> Option<StoreChange> {
        match self.rx.try_recv() {
            Ok(change) => Some(change),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(StoreChange::Lagged { missed })
            }
            Err(_) => None,
        }
    }
}

/// Handle of a callback subscription; unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop delivering changes to the callback.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Whether the callback task has ended (engine dropped or callback panicked).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use purchase_state_core::{RefundState, TransactionId};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn refund(id: &str) -> StoreChange {
        StoreChange::RefundResolved(RefundRequest {
            transaction_id: TransactionId::new(id),
            state: RefundState::Succeeded,
        })
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_change() {
        let notifier = ChangeNotifier::new(8);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        notifier.publish(refund("t1"));

        assert_eq!(a.recv().await, Some(refund("t1")));
        assert_eq!(b.recv().await, Some(refund("t1")));
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_to_resync() {
        let notifier = ChangeNotifier::new(2);
        let mut rx = notifier.subscribe();

        for i in 0..5 {
            notifier.publish(refund(&format!("t{i}")));
        }

        assert_eq!(rx.recv().await, Some(StoreChange::Lagged { missed: 3 }));
        assert_eq!(rx.recv().await, Some(refund("t3")));
        assert_eq!(rx.recv().await, Some(refund("t4")));
    }

    #[tokio::test]
    async fn receiver_ends_when_notifier_dropped() {
        let notifier = ChangeNotifier::new(2);
        let mut rx = notifier.subscribe();
        drop(notifier);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn callback_subscription_delivers_until_dropped() {
        let notifier = ChangeNotifier::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let subscription = notifier.subscribe_fn(move |change| {
            sink.lock().unwrap().push(change);
        });
        assert_eq!(notifier.subscriber_count(), 1);

        notifier.publish(refund("t1"));
        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        subscription.unsubscribe();
        tokio::time::timeout(Duration::from_secs(1), async {
            while notifier.subscriber_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        notifier.publish(refund("t2"));
        assert_eq!(*seen.lock().unwrap(), vec![refund("t1")]);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let notifier = ChangeNotifier::new(1);
        notifier.publish(refund("t1"));
        assert_eq!(notifier.subscriber_count(), 0);
    }
}

//! The verify, apply, finish, notify pipeline.
//!
//! Both the transaction listener and the purchase coordinator feed
//! transactions through one [`TransactionProcessor`], so a transaction
//! reaches the cache the same way no matter who received it.

use crate::entitlements::{ApplyOutcome, EntitlementCache};
use crate::notifications::{ChangeNotifier, StoreChange};
use purchase_state_core::{
    Storefront, Transaction, TransactionVerifier, VerificationFailure, VerificationResult,
};
use std::sync::Arc;

/// What processing one transaction did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The transaction verified and was handed to the cache.
    Applied(ApplyOutcome),
    /// The transaction failed verification and was dropped.
    Unverified(VerificationFailure),
}

/// Runs a transaction through verification into the entitlement cache.
#[derive(Clone)]
pub struct TransactionProcessor {
    verifier: TransactionVerifier,
    cache: Arc<EntitlementCache>,
    storefront: Arc<dyn Storefront>,
    notifier: ChangeNotifier,
}

impl TransactionProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        verifier: TransactionVerifier,
        cache: Arc<EntitlementCache>,
        storefront: Arc<dyn Storefront>,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            verifier,
            cache,
            storefront,
            notifier,
        }
    }

    /// Verify, apply, acknowledge and announce `transaction`.
    ///
    /// Unverified transactions never reach the cache and are not
    /// acknowledged. Verified ones are acknowledged even when the cache
    /// already had them. A failed acknowledgement is logged; the storefront
    /// redelivers and the cache dedups.
    #[tracing::instrument(
        skip(self, transaction),
        fields(transaction_id = %transaction.id, product_id = %transaction.product_id)
    )]
    pub async fn process(&self, transaction: Transaction) -> ProcessOutcome {
        let verified = match self.verifier.verify(&transaction) {
            VerificationResult::Verified(verified) => verified,
            VerificationResult::Unverified { reason, .. } => {
                tracing::warn!(%reason, "Dropping unverified transaction");
                metrics::counter!("store_transactions_unverified_total").increment(1);
                return ProcessOutcome::Unverified(reason);
            }
        };

        let outcome = self.cache.apply(verified).await;
        metrics::counter!("store_transactions_processed_total").increment(1);

        if let Err(err) = self.storefront.finish_transaction(&transaction.id).await {
            tracing::warn!(error = %err, "Failed to finish transaction");
            metrics::counter!("store_transactions_finish_failures_total").increment(1);
        }

        if let ApplyOutcome::Applied(entitlement) = &outcome {
            tracing::info!(owned = entitlement.owned, revoked = entitlement.revoked, "Entitlement changed");
            self.notifier
                .publish(StoreChange::EntitlementChanged(entitlement.clone()));
        }

        ProcessOutcome::Applied(outcome)
    }

    /// The verifier used for incoming transactions.
    #[must_use]
    pub const fn verifier(&self) -> &TransactionVerifier {
        &self.verifier
    }

    /// The cache transactions are applied to.
    #[must_use]
    pub const fn cache(&self) -> &Arc<EntitlementCache> {
        &self.cache
    }
}

impl std::fmt::Debug for TransactionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionProcessor")
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use purchase_state_core::{Entitlement, ProductId, TransactionId};
    use purchase_state_testing::{MockStorefront, TestKey, test_clock};

    fn processor(key: &TestKey, storefront: &Arc<MockStorefront>) -> (TransactionProcessor, ChangeNotifier) {
        let notifier = ChangeNotifier::new(16);
        let processor = TransactionProcessor::new(
            TransactionVerifier::new(key.trust_store(), Arc::new(test_clock())),
            Arc::new(EntitlementCache::new()),
            Arc::clone(storefront) as Arc<dyn Storefront>,
            notifier.clone(),
        );
        (processor, notifier)
    }

    #[tokio::test]
    async fn verified_transaction_is_applied_finished_and_announced() {
        let key = TestKey::new("k");
        let storefront = Arc::new(MockStorefront::new());
        let (processor, notifier) = processor(&key, &storefront);
        let mut changes = notifier.subscribe();

        let outcome = processor.process(key.purchase("t1", "p1")).await;

        let expected = Entitlement::owned(ProductId::new("p1"), TransactionId::new("t1"));
        assert_eq!(outcome, ProcessOutcome::Applied(ApplyOutcome::Applied(expected.clone())));
        assert_eq!(storefront.finished(), vec![TransactionId::new("t1")]);
        assert_eq!(changes.try_recv(), Some(StoreChange::EntitlementChanged(expected)));
    }

    #[tokio::test]
    async fn duplicate_is_finished_but_not_announced() {
        let key = TestKey::new("k");
        let storefront = Arc::new(MockStorefront::new());
        let (processor, notifier) = processor(&key, &storefront);

        processor.process(key.purchase("t1", "p1")).await;
        let mut changes = notifier.subscribe();
        let outcome = processor.process(key.purchase("t1", "p1")).await;

        assert_eq!(outcome, ProcessOutcome::Applied(ApplyOutcome::Duplicate));
        assert_eq!(storefront.finished().len(), 2);
        assert_eq!(changes.try_recv(), None);
    }

    #[tokio::test]
    async fn unverified_transaction_never_reaches_cache() {
        let key = TestKey::new("k");
        let storefront = Arc::new(MockStorefront::new());
        let (processor, _notifier) = processor(&key, &storefront);

        let mut forged = key.purchase("t1", "p1");
        forged.product_id = ProductId::new("premium");

        let outcome = processor.process(forged).await;

        assert_eq!(outcome, ProcessOutcome::Unverified(VerificationFailure::BadSignature));
        assert!(processor.cache().snapshot().is_empty());
        assert!(storefront.finished().is_empty());
    }
}

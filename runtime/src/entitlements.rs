//! Entitlement cache.
//!
//! # Reads
//!
//! Every read clones the `Arc` of the current [`EntitlementSnapshot`] out of
//! a `tokio::sync::watch` channel. Readers never take the writer gate and
//! never see a half-applied change.
//!
//! # Writes
//!
//! Writers serialize on one async mutex, which also guards the ledger of
//! applied transaction facts. A fact is `(transaction id, revoked)`:
//!
//! | Ledger has | Incoming | Outcome |
//! |------------|----------|---------|
//! | nothing | any | applied |
//! | same fact | same fact | [`ApplyOutcome::Duplicate`] |
//! | unrevoked | revoked | applied |
//! | revoked | unrevoked | [`ApplyOutcome::Superseded`] |
//!
//! An applied purchase makes its product owned. The ledger also keeps every
//! product's unrevoked transactions. Revoking one that does not back the
//! product is only recorded ([`ApplyOutcome::Recorded`]). Revoking the
//! backing transaction moves ownership to the newest unrevoked one left, and
//! clears the product once none is left.

use futures::StreamExt;
use purchase_state_core::{
    Entitlement, Generation, ProductId, StorefrontError, Transaction, TransactionId,
    TransactionStream, TransactionVerifier, VerificationResult, VerifiedTransaction,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

/// What applying a verified transaction did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The product's entitlement changed to this.
    Applied(Entitlement),
    /// A revocation of a transaction that does not back its product; the
    /// entitlement is unchanged.
    Recorded,
    /// This exact fact was applied before.
    Duplicate,
    /// The transaction was already revoked; its unrevoked form is ignored.
    Superseded,
}

impl ApplyOutcome {
    /// The new entitlement, if this application changed one.
    #[must_use]
    pub const fn entitlement(&self) -> Option<&Entitlement> {
        match self {
            Self::Applied(entitlement) => Some(entitlement),
            _ => None,
        }
    }
}

/// An immutable view of every known entitlement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntitlementSnapshot {
    generation: Generation,
    entitlements: BTreeMap<ProductId, Entitlement>,
}

impl EntitlementSnapshot {
    /// Generation of this snapshot.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Entitlement for `product_id`, if any transaction touched it.
    #[must_use]
    pub fn get(&self, product_id: &ProductId) -> Option<&Entitlement> {
        self.entitlements.get(product_id)
    }

    /// Whether `product_id` is currently owned.
    #[must_use]
    pub fn is_purchased(&self, product_id: &ProductId) -> bool {
        self.entitlements.get(product_id).is_some_and(|e| e.owned)
    }

    /// All entitlements, owned and revoked, ordered by product id.
    pub fn iter(&self) -> impl Iterator<Item = &Entitlement> {
        self.entitlements.values()
    }

    /// Ids of owned products.
    #[must_use]
    pub fn owned_product_ids(&self) -> Vec<ProductId> {
        self.iter()
            .filter(|e| e.owned)
            .map(|e| e.product_id.clone())
            .collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entitlements.len()
    }

    /// Whether no transaction has been applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entitlements.is_empty()
    }
}

/// Result of a successful rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RebuildReport {
    /// Generation of the installed snapshot
    pub generation: Generation,
    /// Owned products after the rebuild
    pub owned: usize,
    /// Transactions dropped because they failed verification
    pub unverified: usize,
}

/// Facts the cache has applied.
#[derive(Debug, Default)]
struct Ledger {
    /// Transaction id to whether it was applied as revoked.
    facts: HashMap<TransactionId, bool>,
    /// Unrevoked transactions per product, oldest first.
    unrevoked: HashMap<ProductId, Vec<TransactionId>>,
}

impl Ledger {
    /// A ledger that only remembers revocations.
    fn revocations(&self) -> Self {
        Self {
            facts: self
                .facts
                .iter()
                .filter(|(_, revoked)| **revoked)
                .map(|(id, revoked)| (id.clone(), *revoked))
                .collect(),
            unrevoked: HashMap::new(),
        }
    }

    /// Decide what `transaction` does to `entitlements`, recording it.
    fn fold(
        &mut self,
        entitlements: &BTreeMap<ProductId, Entitlement>,
        transaction: &Transaction,
    ) -> ApplyOutcome {
        let revoked = transaction.is_revocation();
        match self.facts.get(&transaction.id) {
            Some(&seen) if seen == revoked => return ApplyOutcome::Duplicate,
            Some(true) => return ApplyOutcome::Superseded,
            _ => {}
        }
        self.facts.insert(transaction.id.clone(), revoked);

        let product_id = transaction.product_id.clone();
        let unrevoked = self.unrevoked.entry(product_id.clone()).or_default();
        if !revoked {
            unrevoked.push(transaction.id.clone());
            return ApplyOutcome::Applied(Entitlement::owned(product_id, transaction.id.clone()));
        }

        unrevoked.retain(|id| *id != transaction.id);
        let backing = entitlements
            .get(&product_id)
            .filter(|e| e.owned)
            .and_then(|e| e.transaction_id.as_ref());
        let outcome = match (unrevoked.last(), backing) {
            (Some(_), Some(backing)) if *backing != transaction.id => ApplyOutcome::Recorded,
            (Some(remaining), _) => {
                ApplyOutcome::Applied(Entitlement::owned(product_id.clone(), remaining.clone()))
            }
            (None, _) => {
                ApplyOutcome::Applied(Entitlement::revoked(product_id.clone(), transaction.id.clone()))
            }
        };
        if unrevoked.is_empty() {
            self.unrevoked.remove(&product_id);
        }
        outcome
    }
}

/// Cache of what the user owns, fed only by verified transactions.
#[derive(Debug)]
pub struct EntitlementCache {
    snapshot: watch::Sender<Arc<EntitlementSnapshot>>,
    ledger: Mutex<Ledger>,
}

impl Default for EntitlementCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntitlementCache {
    /// An empty cache at [`Generation::INITIAL`].
    #[must_use]
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(EntitlementSnapshot::default()));
        Self {
            snapshot,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Apply one verified transaction.
    ///
    /// Waits behind any running rebuild.
    pub async fn apply(&self, transaction: VerifiedTransaction) -> ApplyOutcome {
        let mut ledger = self.ledger.lock().await;
        let current = self.snapshot();

        let outcome = ledger.fold(&current.entitlements, transaction.transaction());
        if let ApplyOutcome::Applied(entitlement) = &outcome {
            let mut entitlements = current.entitlements.clone();
            entitlements.insert(entitlement.product_id.clone(), entitlement.clone());
            self.install(current.generation.next(), entitlements);
        }

        tracing::debug!(
            transaction_id = %transaction.id,
            product_id = %transaction.product_id,
            ?outcome,
            "Applied transaction"
        );
        outcome
    }

    /// Replace the cache with what the stream opened by `current` yields.
    ///
    /// The writer gate is taken before `current` is awaited and held for the
    /// whole rebuild, so an [`EntitlementCache::apply`] racing the storefront
    /// call queues behind it instead of being overwritten. Each transaction
    /// is re-verified; unverified ones are dropped. Revoked transaction ids
    /// are remembered across rebuilds.
    ///
    /// # Errors
    ///
    /// Returns the error opening or reading the stream; the previous snapshot
    /// stays installed.
    pub async fn rebuild_from_current_entitlements<F>(
        &self,
        verifier: &TransactionVerifier,
        current: F,
    ) -> Result<RebuildReport, StorefrontError>
    where
        F: Future<Output = Result<TransactionStream, StorefrontError>>,
    {
        let mut ledger = self.ledger.lock().await;
        let mut current = current.await.inspect_err(|err| {
            tracing::warn!(error = %err, "Could not stream current entitlements");
        })?;

        let mut fresh = ledger.revocations();
        let mut entitlements = BTreeMap::new();
        let mut unverified = 0;

        while let Some(item) = current.next().await {
            let transaction = match item {
                Ok(transaction) => transaction,
                Err(err) => {
                    tracing::warn!(error = %err, "Rebuild stream failed, keeping last known good entitlements");
                    metrics::counter!("store_entitlement_rebuild_failures_total").increment(1);
                    return Err(err);
                }
            };

            match verifier.verify(&transaction) {
                VerificationResult::Verified(verified) => {
                    if let ApplyOutcome::Applied(entitlement) =
                        fresh.fold(&entitlements, verified.transaction())
                    {
                        entitlements.insert(entitlement.product_id.clone(), entitlement);
                    }
                }
                VerificationResult::Unverified {
                    transaction_id,
                    reason,
                } => {
                    unverified += 1;
                    tracing::warn!(%transaction_id, %reason, "Dropping unverified entitlement");
                    metrics::counter!("store_transactions_unverified_total").increment(1);
                }
            }
        }

        *ledger = fresh;
        let generation = self.snapshot.borrow().generation.next();
        let installed = self.install(generation, entitlements);
        let owned = installed.iter().filter(|e| e.owned).count();

        tracing::info!(%generation, owned, unverified, "Rebuilt entitlement cache");
        Ok(RebuildReport {
            generation,
            owned,
            unverified,
        })
    }

    fn install(
        &self,
        generation: Generation,
        entitlements: BTreeMap<ProductId, Entitlement>,
    ) -> Arc<EntitlementSnapshot> {
        let snapshot = Arc::new(EntitlementSnapshot {
            generation,
            entitlements,
        });
        self.snapshot.send_replace(Arc::clone(&snapshot));
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("store_entitlements_owned")
            .set(snapshot.iter().filter(|e| e.owned).count() as f64);
        snapshot
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<EntitlementSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Whether `product_id` is currently owned.
    #[must_use]
    pub fn is_purchased(&self, product_id: &ProductId) -> bool {
        self.snapshot.borrow().is_purchased(product_id)
    }

    /// Entitlement for `product_id`.
    #[must_use]
    pub fn entitlement(&self, product_id: &ProductId) -> Option<Entitlement> {
        self.snapshot.borrow().get(product_id).cloned()
    }

    /// Ids of owned products.
    #[must_use]
    pub fn purchased_product_ids(&self) -> Vec<ProductId> {
        self.snapshot.borrow().owned_product_ids()
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.snapshot.borrow().generation
    }

    /// Receiver that observes every snapshot swap.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<EntitlementSnapshot>> {
        self.snapshot.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::{future, stream};
    use purchase_state_testing::{TestKey, test_clock};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn verifier(key: &TestKey) -> TransactionVerifier {
        TransactionVerifier::new(key.trust_store(), Arc::new(test_clock()))
    }

    fn verified(key: &TestKey, tx: &Transaction) -> VerifiedTransaction {
        verifier(key).verify(tx).into_result().unwrap()
    }

    fn pid(id: &str) -> ProductId {
        ProductId::new(id)
    }

    #[tokio::test]
    async fn purchase_then_duplicate() {
        let key = TestKey::new("k");
        let cache = EntitlementCache::new();
        let tx = key.purchase("t1", "p1");

        let first = cache.apply(verified(&key, &tx)).await;
        assert_eq!(
            first,
            ApplyOutcome::Applied(Entitlement::owned(pid("p1"), TransactionId::new("t1")))
        );
        let generation = cache.generation();

        assert_eq!(cache.apply(verified(&key, &tx)).await, ApplyOutcome::Duplicate);
        assert_eq!(cache.generation(), generation);
        assert!(cache.is_purchased(&pid("p1")));
    }

    #[tokio::test]
    async fn revocation_clears_and_redelivery_is_superseded() {
        let key = TestKey::new("k");
        let cache = EntitlementCache::new();

        cache.apply(verified(&key, &key.purchase("t1", "p1"))).await;
        let revoked = cache.apply(verified(&key, &key.revocation("t1", "p1"))).await;
        assert_eq!(
            revoked,
            ApplyOutcome::Applied(Entitlement::revoked(pid("p1"), TransactionId::new("t1")))
        );

        let redelivered = cache.apply(verified(&key, &key.purchase("t1", "p1"))).await;
        assert_eq!(redelivered, ApplyOutcome::Superseded);

        let entitlement = cache.entitlement(&pid("p1")).unwrap();
        assert!(!entitlement.owned);
        assert!(entitlement.revoked);
    }

    #[tokio::test]
    async fn revoking_an_older_purchase_keeps_newer_ownership() {
        let key = TestKey::new("k");
        let cache = EntitlementCache::new();

        cache.apply(verified(&key, &key.purchase("t1", "p1"))).await;
        cache.apply(verified(&key, &key.purchase("t2", "p1"))).await;
        let outcome = cache.apply(verified(&key, &key.revocation("t1", "p1"))).await;

        assert_eq!(outcome, ApplyOutcome::Recorded);
        assert!(cache.is_purchased(&pid("p1")));
        assert_eq!(cache.purchased_product_ids(), vec![pid("p1")]);
    }

    #[tokio::test]
    async fn revoking_the_backing_purchase_falls_back_to_an_older_one() {
        let key = TestKey::new("k");
        let cache = EntitlementCache::new();

        cache.apply(verified(&key, &key.purchase("t1", "p1"))).await;
        cache.apply(verified(&key, &key.purchase("t2", "p1"))).await;
        let outcome = cache.apply(verified(&key, &key.revocation("t2", "p1"))).await;

        assert_eq!(
            outcome,
            ApplyOutcome::Applied(Entitlement::owned(pid("p1"), TransactionId::new("t1")))
        );
        assert!(cache.is_purchased(&pid("p1")));

        let last = cache.apply(verified(&key, &key.revocation("t1", "p1"))).await;
        assert_eq!(
            last,
            ApplyOutcome::Applied(Entitlement::revoked(pid("p1"), TransactionId::new("t1")))
        );
        assert!(!cache.is_purchased(&pid("p1")));
    }

    #[tokio::test]
    async fn apply_queues_behind_a_rebuild_waiting_on_its_stream() {
        let key = TestKey::new("k");
        let cache = Arc::new(EntitlementCache::new());
        let (open, opened) = oneshot::channel::<()>();
        let (started, gate_held) = oneshot::channel::<()>();
        let first = key.purchase("t1", "p1");

        let current = async move {
            let _ = started.send(());
            let _ = opened.await;
            Ok::<TransactionStream, StorefrontError>(stream::iter(vec![Ok(first)]).boxed())
        };
        let rebuild = tokio::spawn({
            let cache = Arc::clone(&cache);
            let verifier = verifier(&key);
            async move { cache.rebuild_from_current_entitlements(&verifier, current).await }
        });
        gate_held.await.unwrap();

        let apply = tokio::spawn({
            let cache = Arc::clone(&cache);
            let purchase = verified(&key, &key.purchase("t2", "p2"));
            async move { cache.apply(purchase).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!apply.is_finished());

        open.send(()).unwrap();
        rebuild.await.unwrap().unwrap();
        apply.await.unwrap();

        assert_eq!(cache.purchased_product_ids(), vec![pid("p1"), pid("p2")]);
    }

    #[tokio::test]
    async fn rebuild_never_exposes_a_partial_snapshot() {
        let key = TestKey::new("k");
        let cache = Arc::new(EntitlementCache::new());
        cache.apply(verified(&key, &key.purchase("t0", "p0"))).await;
        let old = cache.snapshot();

        let mut watcher = cache.watch();
        let recorder = tokio::spawn(async move {
            let mut seen = Vec::new();
            while watcher.changed().await.is_ok() {
                seen.push(Arc::clone(&watcher.borrow_and_update()));
            }
            seen
        });

        let purchases = vec![
            key.purchase("t1", "p1"),
            key.purchase("t2", "p2"),
            key.purchase("t3", "p3"),
        ];
        let (started, gate_held) = oneshot::channel::<()>();
        let current = async move {
            let _ = started.send(());
            let slow: TransactionStream = async_stream::stream! {
                for transaction in purchases {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    yield Ok(transaction);
                }
            }
            .boxed();
            Ok::<_, StorefrontError>(slow)
        };
        let rebuild = tokio::spawn({
            let cache = Arc::clone(&cache);
            let verifier = verifier(&key);
            async move { cache.rebuild_from_current_entitlements(&verifier, current).await }
        });
        gate_held.await.unwrap();

        let late = verified(&key, &key.purchase("t4", "p4"));
        cache.apply(late).await;
        rebuild.await.unwrap().unwrap();
        drop(cache);

        let rebuilt = vec![pid("p1"), pid("p2"), pid("p3")];
        let with_late = vec![pid("p1"), pid("p2"), pid("p3"), pid("p4")];
        let seen = recorder.await.unwrap();
        assert_eq!(seen.last().unwrap().owned_product_ids(), with_late);
        for snapshot in seen {
            let owned = snapshot.owned_product_ids();
            assert!(
                snapshot == old || owned == rebuilt || owned == with_late,
                "mixed snapshot exposed: {owned:?}"
            );
        }
    }

    #[tokio::test]
    async fn rebuild_replaces_contents_and_drops_unverified() {
        let key = TestKey::new("k");
        let stranger = TestKey::new("stranger");
        let cache = EntitlementCache::new();
        cache.apply(verified(&key, &key.purchase("t0", "old"))).await;

        let current: TransactionStream = stream::iter(vec![
            Ok(key.purchase("t1", "p1")),
            Ok(stranger.purchase("t2", "p2")),
        ])
        .boxed();

        let report = cache
            .rebuild_from_current_entitlements(&verifier(&key), future::ready(Ok(current)))
            .await
            .unwrap();

        assert_eq!(report.owned, 1);
        assert_eq!(report.unverified, 1);
        assert_eq!(cache.purchased_product_ids(), vec![pid("p1")]);
        assert!(!cache.is_purchased(&pid("old")));
        assert!(!cache.is_purchased(&pid("p2")));
    }

    #[tokio::test]
    async fn rebuild_stream_error_keeps_last_known_good() {
        let key = TestKey::new("k");
        let cache = EntitlementCache::new();
        cache.apply(verified(&key, &key.purchase("t0", "p0"))).await;
        let before = cache.snapshot();

        let current: TransactionStream = stream::iter(vec![
            Ok(key.purchase("t1", "p1")),
            Err(StorefrontError::Transient("reset".into())),
        ])
        .boxed();

        let err = cache
            .rebuild_from_current_entitlements(&verifier(&key), future::ready(Ok(current)))
            .await
            .unwrap_err();

        assert_eq!(err, StorefrontError::Transient("reset".into()));
        assert_eq!(cache.snapshot(), before);
    }

    #[tokio::test]
    async fn rebuild_remembers_revocations() {
        let key = TestKey::new("k");
        let cache = EntitlementCache::new();
        cache.apply(verified(&key, &key.revocation("t1", "p1"))).await;

        let current: TransactionStream = stream::iter(vec![Ok(key.purchase("t1", "p1"))]).boxed();
        cache
            .rebuild_from_current_entitlements(&verifier(&key), future::ready(Ok(current)))
            .await
            .unwrap();

        assert!(!cache.is_purchased(&pid("p1")));
    }

    #[test]
    fn snapshots_are_cheap_handles() {
        let cache = EntitlementCache::new();
        let a = cache.snapshot();
        let b = cache.snapshot();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_empty());
    }
}

//! Property tests for the entitlement fold.
//!
//! Sequences are drawn from a small id space so redeliveries, revocations
//! and multiple transactions per product collide often.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use proptest::prelude::*;
use purchase_state_core::{
    ProductId, Transaction, TransactionId, TransactionVerifier, VerifiedTransaction,
};
use purchase_state_runtime::{ApplyOutcome, EntitlementCache, EntitlementSnapshot};
use purchase_state_testing::properties::{Fact, fact_sequence};
use purchase_state_testing::{TestKey, test_clock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn transaction(key: &TestKey, fact: Fact) -> Transaction {
    let id = format!("t{}", fact.index);
    let product = format!("p{}", fact.product);
    if fact.revoked {
        key.revocation(&id, &product)
    } else {
        key.purchase(&id, &product)
    }
}

fn verified(key: &TestKey, facts: &[Fact]) -> Vec<VerifiedTransaction> {
    let verifier = TransactionVerifier::new(key.trust_store(), Arc::new(test_clock()));
    facts
        .iter()
        .map(|fact| {
            verifier
                .verify(&transaction(key, *fact))
                .into_result()
                .unwrap()
        })
        .collect()
}

fn apply_all(cache: &EntitlementCache, transactions: &[VerifiedTransaction]) -> Vec<ApplyOutcome> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut outcomes = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            outcomes.push(cache.apply(transaction.clone()).await);
        }
        outcomes
    })
}

/// Transaction ids per product, split by how they were delivered.
#[derive(Default)]
struct Deliveries {
    purchased: HashSet<TransactionId>,
    revoked: HashSet<TransactionId>,
}

fn deliveries(facts: &[Fact]) -> HashMap<ProductId, Deliveries> {
    let mut by_product: HashMap<ProductId, Deliveries> = HashMap::new();
    for fact in facts {
        let entry = by_product
            .entry(ProductId::new(format!("p{}", fact.product)))
            .or_default();
        let id = TransactionId::new(format!("t{}", fact.index));
        if fact.revoked {
            entry.revoked.insert(id);
        } else {
            entry.purchased.insert(id);
        }
    }
    by_product
}

fn snapshot_after(facts: &[Fact]) -> (EntitlementCache, Arc<EntitlementSnapshot>) {
    let key = TestKey::new("k1");
    let cache = EntitlementCache::new();
    apply_all(&cache, &verified(&key, facts));
    let snapshot = cache.snapshot();
    (cache, snapshot)
}

proptest! {
    /// Replaying a delivered sequence changes nothing.
    #[test]
    fn redelivery_is_idempotent(facts in fact_sequence(24)) {
        let key = TestKey::new("k1");
        let transactions = verified(&key, &facts);
        let cache = EntitlementCache::new();

        apply_all(&cache, &transactions);
        let once = cache.snapshot();
        let replayed = apply_all(&cache, &transactions);

        prop_assert!(replayed
            .iter()
            .all(|o| matches!(o, ApplyOutcome::Duplicate | ApplyOutcome::Superseded)));
        prop_assert_eq!(&*cache.snapshot(), &*once);
    }

    /// An owned product is always backed by a transaction that was
    /// delivered as a purchase and never revoked.
    #[test]
    fn ownership_is_backed_by_an_unrevoked_purchase(facts in fact_sequence(24)) {
        let (_cache, snapshot) = snapshot_after(&facts);
        let delivered = deliveries(&facts);

        for entitlement in snapshot.iter().filter(|e| e.owned) {
            let backing = entitlement.transaction_id.clone().unwrap();
            let product = &delivered[&entitlement.product_id];
            prop_assert!(product.purchased.contains(&backing));
            prop_assert!(!product.revoked.contains(&backing));
            prop_assert!(!entitlement.revoked);
        }
    }

    /// A product is owned exactly when some purchase of it was never
    /// revoked, whatever order the deliveries came in.
    #[test]
    fn revocations_decide_ownership(facts in fact_sequence(24)) {
        let (_cache, snapshot) = snapshot_after(&facts);

        for (product_id, product) in deliveries(&facts) {
            let unrevoked = product.purchased.difference(&product.revoked).count();
            prop_assert_eq!(
                snapshot.is_purchased(&product_id),
                unrevoked > 0,
                "{} has {} unrevoked purchases",
                product_id,
                unrevoked
            );
        }
    }

    /// Only products that saw a transaction get an entry, and the generation
    /// advances once per applied change.
    #[test]
    fn generation_counts_applied_changes(facts in fact_sequence(24)) {
        let key = TestKey::new("k1");
        let cache = EntitlementCache::new();
        let initial = cache.generation();
        let outcomes = apply_all(&cache, &verified(&key, &facts));

        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, ApplyOutcome::Applied(_)))
            .count();
        let mut expected = initial;
        for _ in 0..applied {
            expected = expected.next();
        }
        prop_assert_eq!(cache.generation(), expected);

        let touched = deliveries(&facts);
        for entitlement in cache.snapshot().iter() {
            prop_assert!(touched.contains_key(&entitlement.product_id));
        }
    }
}

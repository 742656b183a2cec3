//! Storefront signing fixtures.

use crate::mocks::test_epoch;
use chrono::{DateTime, Utc};
use purchase_state_core::verification::compute_signature;
use purchase_state_core::{
    ProductId, SignaturePayload, Transaction, TransactionId, TrustStore, TrustedKey,
};

/// A storefront key that signs transactions the verifier accepts.
///
/// # Example
///
/// ```
/// use purchase_state_testing::{TestKey, test_clock};
/// use purchase_state_core::TransactionVerifier;
/// use std::sync::Arc;
///
/// let key = TestKey::new("k1");
/// let verifier = TransactionVerifier::new(key.trust_store(), Arc::new(test_clock()));
/// assert!(verifier.verify(&key.purchase("t1", "p1")).is_verified());
/// ```
#[derive(Clone, Debug)]
pub struct TestKey {
    key_id: String,
    secret: Vec<u8>,
}

impl TestKey {
    /// A key whose secret is derived from its id.
    #[must_use]
    pub fn new(key_id: impl Into<String>) -> Self {
        let key_id = key_id.into();
        let secret = format!("secret-for-{key_id}").into_bytes();
        Self { key_id, secret }
    }

    /// Key identifier carried in signatures.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// This key as trust material.
    #[must_use]
    pub fn trusted_key(&self) -> TrustedKey {
        TrustedKey::new(self.secret.clone())
    }

    /// A trust store holding only this key.
    #[must_use]
    pub fn trust_store(&self) -> TrustStore {
        TrustStore::new().with_key(self.key_id.clone(), self.trusted_key())
    }

    /// Re-sign `transaction` with this key.
    #[must_use]
    pub fn sign(&self, mut transaction: Transaction) -> Transaction {
        transaction.signature = SignaturePayload {
            key_id: self.key_id.clone(),
            signature: compute_signature(&self.secret, &transaction.signing_bytes()),
        };
        transaction
    }

    /// A signed one-off purchase made at the test epoch.
    #[must_use]
    pub fn purchase(&self, id: &str, product_id: &str) -> Transaction {
        self.sign(unsigned(id, product_id))
    }

    /// A signed revocation of purchase `id`, an hour after the test epoch.
    #[must_use]
    pub fn revocation(&self, id: &str, product_id: &str) -> Transaction {
        let mut transaction = unsigned(id, product_id);
        transaction.revocation_date = Some(test_epoch() + chrono::Duration::hours(1));
        self.sign(transaction)
    }

    /// A signed subscription period ending at `expires`.
    #[must_use]
    pub fn subscription(&self, id: &str, product_id: &str, expires: DateTime<Utc>) -> Transaction {
        let mut transaction = unsigned(id, product_id);
        transaction.expiration_date = Some(expires);
        self.sign(transaction)
    }
}

fn unsigned(id: &str, product_id: &str) -> Transaction {
    Transaction {
        id: TransactionId::new(id),
        original_id: TransactionId::new(id),
        product_id: ProductId::new(product_id),
        purchase_date: test_epoch(),
        revocation_date: None,
        expiration_date: None,
        signature: SignaturePayload {
            key_id: String::new(),
            signature: String::new(),
        },
    }
}

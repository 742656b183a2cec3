//! Transaction signature verification.
//!
//! [`TransactionVerifier::verify`] is a pure check of a [`Transaction`]
//! against storefront-issued trust material. It never touches any cache; its
//! only output is a [`VerificationResult`].
//!
//! The one way to obtain a [`VerifiedTransaction`] is through the verifier,
//! so code that mutates entitlements by taking a `VerifiedTransaction` cannot
//! be handed an unverified one.
//!
//! # Signature scheme
//!
//! ```text
//! inner     = SHA-256(secret || transaction.signing_bytes())
//! signature = base64(SHA-256(secret || inner))
//! ```
//!
//! Nesting the digest keeps the construction safe against length extension.
//! Comparisons are constant time.

use crate::environment::Clock;
use crate::error::VerificationFailure;
use crate::ids::TransactionId;
use crate::transaction::Transaction;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Compute the signature for `message` under `secret`.
///
/// Exposed so storefront adapters and test fixtures can produce signatures
/// the verifier accepts.
#[must_use]
pub fn compute_signature(secret: &[u8], message: &[u8]) -> String {
    STANDARD.encode(keyed_digest(secret, message))
}

fn keyed_digest(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let inner = Sha256::new().chain_update(secret).chain_update(message).finalize();
    Sha256::new()
        .chain_update(secret)
        .chain_update(inner)
        .finalize()
        .to_vec()
}

/// A storefront signing key.
#[derive(Clone)]
pub struct TrustedKey {
    secret: Vec<u8>,
    not_after: Option<DateTime<Utc>>,
}

impl TrustedKey {
    /// Create a key that never expires.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            not_after: None,
        }
    }

    /// Stop trusting signatures checked after `not_after`.
    #[must_use]
    pub const fn with_not_after(mut self, not_after: DateTime<Utc>) -> Self {
        self.not_after = Some(not_after);
        self
    }

    /// Expiry instant, if any.
    #[must_use]
    pub const fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }
}

impl std::fmt::Debug for TrustedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustedKey")
            .field("secret", &"<redacted>")
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// Set of storefront keys, indexed by key id.
#[derive(Clone, Debug, Default)]
pub struct TrustStore {
    keys: HashMap<String, TrustedKey>,
}

impl TrustStore {
    /// Create an empty trust store (which trusts nothing).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a key.
    #[must_use]
    pub fn with_key(mut self, key_id: impl Into<String>, key: TrustedKey) -> Self {
        self.keys.insert(key_id.into(), key);
        self
    }

    /// Look up a key by id.
    #[must_use]
    pub fn key(&self, key_id: &str) -> Option<&TrustedKey> {
        self.keys.get(key_id)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A transaction that passed verification.
///
/// Only [`TransactionVerifier`] constructs this type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedTransaction(Transaction);

impl VerifiedTransaction {
    /// The verified transaction.
    #[must_use]
    pub const fn transaction(&self) -> &Transaction {
        &self.0
    }

    /// Unwrap the verified transaction.
    #[must_use]
    pub fn into_inner(self) -> Transaction {
        self.0
    }

    /// Whether this verified transaction revokes an entitlement.
    #[must_use]
    pub const fn is_revocation(&self) -> bool {
        self.0.is_revocation()
    }
}

impl std::ops::Deref for VerifiedTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.0
    }
}

/// Outcome of verifying a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationResult {
    /// The transaction may be applied.
    Verified(VerifiedTransaction),
    /// The transaction must be dropped.
    Unverified {
        /// Id of the rejected transaction, for logging.
        transaction_id: TransactionId,
        /// Why it was rejected.
        reason: VerificationFailure,
    },
}

impl VerificationResult {
    /// Convert into a `Result`, discarding the transaction id on failure.
    ///
    /// # Errors
    ///
    /// Returns the [`VerificationFailure`] for unverified transactions.
    pub fn into_result(self) -> Result<VerifiedTransaction, VerificationFailure> {
        match self {
            Self::Verified(tx) => Ok(tx),
            Self::Unverified { reason, .. } => Err(reason),
        }
    }

    /// Whether the transaction verified.
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        matches!(self, Self::Verified(_))
    }
}

/// Checks transaction signatures against a [`TrustStore`].
#[derive(Clone)]
pub struct TransactionVerifier {
    trust: Arc<TrustStore>,
    clock: Arc<dyn Clock>,
}

impl TransactionVerifier {
    /// Create a verifier over the given trust material.
    #[must_use]
    pub fn new(trust: TrustStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            trust: Arc::new(trust),
            clock,
        }
    }

    /// Verify a transaction.
    ///
    /// Checks, in order: the key is trusted, the key has not expired, the
    /// signature matches, and (for non-revocations) the transaction's own
    /// expiration date has not passed.
    #[must_use]
    pub fn verify(&self, transaction: &Transaction) -> VerificationResult {
        match self.check(transaction) {
            Ok(()) => VerificationResult::Verified(VerifiedTransaction(transaction.clone())),
            Err(reason) => VerificationResult::Unverified {
                transaction_id: transaction.id.clone(),
                reason,
            },
        }
    }

    fn check(&self, transaction: &Transaction) -> Result<(), VerificationFailure> {
        let key = self
            .trust
            .key(&transaction.signature.key_id)
            .ok_or(VerificationFailure::Untrusted)?;

        let now = self.clock.now();
        if key.not_after.is_some_and(|not_after| now > not_after) {
            return Err(VerificationFailure::Expired);
        }

        let provided = STANDARD
            .decode(transaction.signature.signature.as_bytes())
            .map_err(|_| VerificationFailure::BadSignature)?;
        let expected = keyed_digest(&key.secret, &transaction.signing_bytes());
        if !constant_time_eq::constant_time_eq(&provided, &expected) {
            return Err(VerificationFailure::BadSignature);
        }

        // A revocation must always be able to clear an entitlement.
        if !transaction.is_revocation()
            && transaction.expiration_date.is_some_and(|expires| now >= expires)
        {
            return Err(VerificationFailure::Expired);
        }

        Ok(())
    }
}

impl std::fmt::Debug for TransactionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionVerifier")
            .field("trusted_keys", &self.trust.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ids::ProductId;
    use crate::transaction::SignaturePayload;
    use chrono::{Duration, TimeZone};

    struct At(DateTime<Utc>);

    impl Clock for At {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().unwrap()
    }

    fn signed(secret: &[u8], key_id: &str) -> Transaction {
        let mut tx = Transaction {
            id: TransactionId::new("t1"),
            original_id: TransactionId::new("t1"),
            product_id: ProductId::new("p1"),
            purchase_date: noon() - Duration::hours(1),
            revocation_date: None,
            expiration_date: None,
            signature: SignaturePayload {
                key_id: key_id.to_string(),
                signature: String::new(),
            },
        };
        tx.signature.signature = compute_signature(secret, &tx.signing_bytes());
        tx
    }

    fn verifier(trust: TrustStore) -> TransactionVerifier {
        TransactionVerifier::new(trust, Arc::new(At(noon())))
    }

    fn reason(result: VerificationResult) -> Option<VerificationFailure> {
        result.into_result().err()
    }

    #[test]
    fn accepts_valid_signature() {
        let v = verifier(TrustStore::new().with_key("k1", TrustedKey::new(b"secret".to_vec())));
        let result = v.verify(&signed(b"secret", "k1"));
        assert!(result.is_verified());
    }

    #[test]
    fn rejects_unknown_key() {
        let v = verifier(TrustStore::new().with_key("k1", TrustedKey::new(b"secret".to_vec())));
        assert_eq!(
            reason(v.verify(&signed(b"secret", "k2"))),
            Some(VerificationFailure::Untrusted)
        );
    }

    #[test]
    fn rejects_wrong_secret() {
        let v = verifier(TrustStore::new().with_key("k1", TrustedKey::new(b"secret".to_vec())));
        assert_eq!(
            reason(v.verify(&signed(b"forged", "k1"))),
            Some(VerificationFailure::BadSignature)
        );
    }

    #[test]
    fn rejects_tampered_fields() {
        let v = verifier(TrustStore::new().with_key("k1", TrustedKey::new(b"secret".to_vec())));
        let mut tx = signed(b"secret", "k1");
        tx.product_id = ProductId::new("p2");
        assert_eq!(reason(v.verify(&tx)), Some(VerificationFailure::BadSignature));
    }

    #[test]
    fn rejects_malformed_base64() {
        let v = verifier(TrustStore::new().with_key("k1", TrustedKey::new(b"secret".to_vec())));
        let mut tx = signed(b"secret", "k1");
        tx.signature.signature = "not base64!!".into();
        assert_eq!(reason(v.verify(&tx)), Some(VerificationFailure::BadSignature));
    }

    #[test]
    fn rejects_expired_key() {
        let key = TrustedKey::new(b"secret".to_vec()).with_not_after(noon() - Duration::days(1));
        let v = verifier(TrustStore::new().with_key("k1", key));
        assert_eq!(
            reason(v.verify(&signed(b"secret", "k1"))),
            Some(VerificationFailure::Expired)
        );
    }

    #[test]
    fn rejects_lapsed_subscription() {
        let v = verifier(TrustStore::new().with_key("k1", TrustedKey::new(b"secret".to_vec())));
        let mut tx = signed(b"secret", "k1");
        tx.expiration_date = Some(noon() - Duration::minutes(5));
        tx.signature.signature = compute_signature(b"secret", &tx.signing_bytes());
        assert_eq!(reason(v.verify(&tx)), Some(VerificationFailure::Expired));
    }

    #[test]
    fn revocation_of_lapsed_subscription_still_verifies() {
        let v = verifier(TrustStore::new().with_key("k1", TrustedKey::new(b"secret".to_vec())));
        let mut tx = signed(b"secret", "k1");
        tx.expiration_date = Some(noon() - Duration::minutes(5));
        tx.revocation_date = Some(noon());
        tx.signature.signature = compute_signature(b"secret", &tx.signing_bytes());

        let verified = v.verify(&tx).into_result().unwrap();
        assert!(verified.is_revocation());
    }

    #[test]
    fn unverified_result_carries_transaction_id() {
        let v = verifier(TrustStore::new());
        match v.verify(&signed(b"secret", "k1")) {
            VerificationResult::Unverified { transaction_id, .. } => {
                assert_eq!(transaction_id.as_str(), "t1");
            }
            VerificationResult::Verified(_) => unreachable!("empty trust store verified a transaction"),
        }
    }

    #[test]
    fn debug_redacts_secret() {
        let key = TrustedKey::new(b"hunter2".to_vec());
        assert!(!format!("{key:?}").contains("hunter2"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any change to the signed product id breaks the signature.
            #[test]
            fn any_product_change_is_detected(product in "[a-z0-9._-]{1,24}") {
                prop_assume!(product != "p1");
                let v = verifier(TrustStore::new().with_key("k1", TrustedKey::new(b"secret".to_vec())));
                let mut tx = signed(b"secret", "k1");
                tx.product_id = ProductId::new(product);
                prop_assert_eq!(reason(v.verify(&tx)), Some(VerificationFailure::BadSignature));
            }

            /// Flipping any bit of the digest breaks the signature.
            #[test]
            fn any_digest_bit_flip_is_detected(byte in 0usize..32, bit in 0u8..8) {
                let v = verifier(TrustStore::new().with_key("k1", TrustedKey::new(b"secret".to_vec())));
                let mut tx = signed(b"secret", "k1");
                let mut digest = STANDARD.decode(tx.signature.signature.as_bytes()).unwrap();
                digest[byte] ^= 1 << bit;
                tx.signature.signature = STANDARD.encode(digest);
                prop_assert_eq!(reason(v.verify(&tx)), Some(VerificationFailure::BadSignature));
            }
        }
    }
}

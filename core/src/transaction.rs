//! Transactions as delivered by the storefront.

use crate::ids::{ProductId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Signature material attached to a transaction by the storefront.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignaturePayload {
    /// Identifier of the storefront key that produced the signature.
    pub key_id: String,
    /// Base64 (standard alphabet) SHA-256 keyed digest of
    /// [`Transaction::signing_bytes`].
    pub signature: String,
}

/// A purchase, renewal or revocation event.
///
/// Transactions are immutable once received. A revocation is delivered as the
/// same transaction id with `revocation_date` set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Storefront transaction id.
    pub id: TransactionId,
    /// Id of the first transaction in a renewal chain (equal to `id` for
    /// one-off purchases).
    pub original_id: TransactionId,
    /// Product this transaction is for.
    pub product_id: ProductId,
    /// When the purchase happened.
    pub purchase_date: DateTime<Utc>,
    /// Set when the storefront revoked the transaction (refund, family
    /// sharing removed).
    pub revocation_date: Option<DateTime<Utc>>,
    /// End of the paid period for subscriptions and non-renewables.
    pub expiration_date: Option<DateTime<Utc>>,
    /// Storefront signature over the fields above.
    pub signature: SignaturePayload,
}

impl Transaction {
    /// Whether this transaction revokes a previous purchase.
    #[must_use]
    pub const fn is_revocation(&self) -> bool {
        self.revocation_date.is_some()
    }

    /// Canonical byte representation covered by the signature.
    ///
    /// Fields are joined with `\n` in a fixed order, timestamps as RFC 3339
    /// with second precision, absent optionals as the empty string.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        fn ts(value: Option<&DateTime<Utc>>) -> String {
            value
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                .unwrap_or_default()
        }

        [
            self.id.as_str().to_owned(),
            self.original_id.as_str().to_owned(),
            self.product_id.as_str().to_owned(),
            ts(Some(&self.purchase_date)),
            ts(self.revocation_date.as_ref()),
            ts(self.expiration_date.as_ref()),
        ]
        .join("\n")
        .into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Transaction {
        Transaction {
            id: TransactionId::new("t1"),
            original_id: TransactionId::new("t1"),
            product_id: ProductId::new("p1"),
            purchase_date: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().unwrap_or_default(),
            revocation_date: None,
            expiration_date: None,
            signature: SignaturePayload {
                key_id: "k1".into(),
                signature: String::new(),
            },
        }
    }

    #[test]
    fn signing_bytes_are_stable() {
        let tx = sample();
        let text = String::from_utf8(tx.signing_bytes()).unwrap_or_default();
        assert_eq!(text, "t1\nt1\np1\n2025-01-01T12:00:00Z\n\n");
    }

    #[test]
    fn revocation_changes_signing_bytes() {
        let tx = sample();
        let mut revoked = tx.clone();
        revoked.revocation_date = Some(tx.purchase_date);
        assert!(revoked.is_revocation());
        assert!(!tx.is_revocation());
        assert_ne!(tx.signing_bytes(), revoked.signing_bytes());
    }

    #[test]
    fn signature_is_not_signed() {
        let tx = sample();
        let mut resigned = tx.clone();
        resigned.signature.signature = "other".into();
        assert_eq!(tx.signing_bytes(), resigned.signing_bytes());
    }
}

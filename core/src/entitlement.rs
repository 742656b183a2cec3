//! Ownership state derived from verified transactions.

use crate::ids::{ProductId, TransactionId};
use serde::{Deserialize, Serialize};

/// Current ownership of one product.
///
/// `owned` is only ever `true` when the entry is backed by an unrevoked,
/// verified transaction. Entries for revoked purchases stay in the cache with
/// `owned = false, revoked = true` so the presentation layer can tell
/// "never bought" from "refunded".
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entitlement {
    /// Product this entitlement is for.
    pub product_id: ProductId,
    /// Whether the user currently owns the product.
    pub owned: bool,
    /// Transaction that last changed this entitlement.
    pub transaction_id: Option<TransactionId>,
    /// Whether the last applied transaction was a revocation.
    pub revoked: bool,
}

impl Entitlement {
    /// An owned entitlement backed by `transaction_id`.
    #[must_use]
    pub const fn owned(product_id: ProductId, transaction_id: TransactionId) -> Self {
        Self {
            product_id,
            owned: true,
            transaction_id: Some(transaction_id),
            revoked: false,
        }
    }

    /// A revoked entitlement; `transaction_id` is the revoked transaction.
    #[must_use]
    pub const fn revoked(product_id: ProductId, transaction_id: TransactionId) -> Self {
        Self {
            product_id,
            owned: false,
            transaction_id: Some(transaction_id),
            revoked: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_uphold_owned_revoked_exclusion() {
        let owned = Entitlement::owned(ProductId::new("p1"), TransactionId::new("t1"));
        assert!(owned.owned && !owned.revoked);

        let revoked = Entitlement::revoked(ProductId::new("p1"), TransactionId::new("t1"));
        assert!(!revoked.owned && revoked.revoked);
    }
}

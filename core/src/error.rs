//! Error taxonomy for the purchase state engine.
//!
//! Each concern gets its own enum so callers can match exhaustively on the
//! failures that can actually reach them:
//!
//! | Error | Raised by | Surfaces to |
//! |-------|-----------|-------------|
//! | [`CatalogError`] | product refresh | caller, as a typed result |
//! | [`PurchaseError`] | purchase attempt | caller, as a typed result |
//! | [`VerificationFailure`] | transaction verifier | logs only; the transaction is dropped |
//! | [`RefundError`] | refund flow | refund ticket and change notification |
//! | [`ListenerError`] | transaction listener | change notification (fatal only) |
//! | [`StorefrontError`] | storefront collaborator | classified into the above |

use crate::ids::{ProductId, TransactionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the storefront collaborator.
///
/// Implementations of [`Storefront`](crate::storefront::Storefront) classify
/// their failures into these variants so the engine can decide whether to
/// retry, surface, or give up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorefrontError {
    /// The storefront could not be reached (offline, DNS, TLS).
    #[error("Storefront unreachable: {0}")]
    Unreachable(String),

    /// A temporary failure; the same call may succeed later.
    #[error("Transient storefront failure: {0}")]
    Transient(String),

    /// A permanent failure; retrying will not help.
    #[error("Fatal storefront failure: {0}")]
    Fatal(String),

    /// The storefront understood the request and refused it.
    #[error("Storefront rejected request: {0}")]
    Rejected(String),
}

impl StorefrontError {
    /// Whether a retry with backoff may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Transient(_))
    }
}

/// Errors from refreshing the product catalog.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The storefront could not be queried; the previous catalog is kept.
    #[error("Product catalog unreachable: {0}")]
    Unreachable(String),

    /// The storefront returned only some of the requested products.
    ///
    /// The returned subset has been installed; callers decide whether a
    /// partial catalog is acceptable.
    #[error("Storefront returned a partial catalog, missing {missing:?}")]
    PartialResult {
        /// Requested ids the storefront did not return.
        missing: Vec<ProductId>,
    },
}

/// Errors from a purchase attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PurchaseError {
    /// Another purchase of the same product is still in flight.
    #[error("A purchase of {0} is already in progress")]
    AlreadyInProgress(ProductId),

    /// The promotional offer could not be signed; nothing was submitted.
    #[error("Promotional offer signing failed: {0}")]
    OfferSigningFailed(String),

    /// The user backed out of the storefront purchase sheet.
    #[error("Purchase cancelled by user")]
    UserCancelled,

    /// The purchase awaits external approval (e.g. parental consent).
    ///
    /// The entitlement changes later, when the approved transaction arrives
    /// on the transaction stream.
    #[error("Purchase is pending approval")]
    Pending,

    /// The storefront reported a failure.
    #[error("Purchase failed: {0}")]
    Failed(String),

    /// The storefront reported success but the transaction failed verification.
    #[error("Purchase transaction failed verification: {0}")]
    FailedVerification(VerificationFailure),

    /// The product is not in the current catalog.
    #[error("Product {0} is not available in the catalog")]
    ProductUnavailable(ProductId),

    /// The device or account is not allowed to make payments.
    #[error("Payments are not allowed on this device")]
    PaymentsNotAllowed,
}

/// Reasons a transaction fails verification.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationFailure {
    /// The signature does not match the transaction contents.
    #[error("bad signature")]
    BadSignature,

    /// The signing key or the transaction itself has expired.
    #[error("expired")]
    Expired,

    /// The signing key is not part of the trust store.
    #[error("untrusted signing key")]
    Untrusted,
}

/// Terminal failures of a refund request.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundError {
    /// The host dismissed the refund flow before the storefront answered.
    #[error("Refund flow dismissed by user")]
    UserDismissed,

    /// The storefront could not accept the refund request.
    #[error("Refund submission failed: {0}")]
    SubmissionFailed(String),

    /// A refund for this transaction is already awaiting its outcome.
    #[error("A refund request for transaction {0} is already pending")]
    AlreadyPending(TransactionId),
}

/// Errors raised by the transaction listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// A recoverable stream failure; the listener resubscribes with backoff.
    #[error("Transient listener failure: {0}")]
    Transient(String),

    /// An unrecoverable failure; the listener has stopped.
    #[error("Fatal listener failure: {0}")]
    Fatal(String),
}

impl From<StorefrontError> for ListenerError {
    fn from(err: StorefrontError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

impl From<StorefrontError> for CatalogError {
    fn from(err: StorefrontError) -> Self {
        Self::Unreachable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storefront_error_transience() {
        assert!(StorefrontError::Unreachable("offline".into()).is_transient());
        assert!(StorefrontError::Transient("503".into()).is_transient());
        assert!(!StorefrontError::Fatal("revoked".into()).is_transient());
        assert!(!StorefrontError::Rejected("bad id".into()).is_transient());
    }

    #[test]
    fn listener_error_classification() {
        let transient: ListenerError = StorefrontError::Transient("reset".into()).into();
        assert!(matches!(transient, ListenerError::Transient(_)));

        let fatal: ListenerError = StorefrontError::Fatal("gone".into()).into();
        assert!(matches!(fatal, ListenerError::Fatal(_)));
    }

    #[test]
    fn catalog_error_display() {
        let err = CatalogError::PartialResult {
            missing: vec![ProductId::new("p2")],
        };
        assert!(err.to_string().contains("p2"));
    }

    #[test]
    fn purchase_error_display() {
        let err = PurchaseError::AlreadyInProgress(ProductId::new("sub1"));
        assert_eq!(err.to_string(), "A purchase of sub1 is already in progress");
        assert_eq!(
            PurchaseError::FailedVerification(VerificationFailure::BadSignature).to_string(),
            "Purchase transaction failed verification: bad signature"
        );
    }
}

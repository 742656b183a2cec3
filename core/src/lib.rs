//! # Purchase State Core
//!
//! Domain types, error taxonomy and collaborator traits for the purchase
//! state engine.
//!
//! This crate is the functional core: everything in it is either plain data
//! or a pure function. The runtime crate owns the caches, tasks and locks.
//!
//! ## Core Concepts
//!
//! - **Product**: catalog metadata fetched from the storefront
//! - **Transaction**: a purchase, renewal or revocation event
//! - **Verification**: the only gate between a transaction and ownership
//! - **Entitlement**: derived "does the user own this" state
//! - **Storefront**: the platform store, injected as a trait object
//! - **OfferSigner**: host-supplied promotional offer signing
//!
//! ## Example
//!
//! ```
//! use purchase_state_core::environment::SystemClock;
//! use purchase_state_core::verification::{TransactionVerifier, TrustStore, TrustedKey};
//! use std::sync::Arc;
//!
//! let trust = TrustStore::new().with_key("store-key-1", TrustedKey::new(b"secret".to_vec()));
//! let verifier = TransactionVerifier::new(trust, Arc::new(SystemClock));
//! # let _ = verifier;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Strongly typed identifiers
pub mod ids;

/// Error taxonomy
pub mod error;

/// Product metadata
pub mod product;

/// Storefront transactions
pub mod transaction;

/// Transaction signature verification
pub mod verification;

/// Ownership state
pub mod entitlement;

/// Refund request lifecycle
pub mod refund;

/// Promotional offer signing delegation
pub mod offer;

/// The storefront collaborator trait
pub mod storefront;

/// Environment module - Dependency injection traits
///
/// All ambient dependencies (currently only time) are abstracted behind
/// traits so tests can pin them.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use purchase_state_core::environment::{Clock, SystemClock};
    ///
    /// let now = SystemClock.now();
    /// assert!(now.timestamp() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use entitlement::Entitlement;
pub use error::{
    CatalogError, ListenerError, PurchaseError, RefundError, StorefrontError, VerificationFailure,
};
pub use ids::{Generation, OfferId, ProductId, SubscriptionGroupId, TransactionId};
pub use offer::{FnOfferSigner, OfferSigner, PromotionalOfferSignature};
pub use product::{Product, ProductKind};
pub use refund::{RefundOutcome, RefundRequest, RefundState};
pub use storefront::{
    RefundOutcomeStream, Storefront, StorefrontPurchaseResult, SubmitOptions, TransactionStream,
};
pub use transaction::{SignaturePayload, Transaction};
pub use verification::{
    TransactionVerifier, TrustStore, TrustedKey, VerificationResult, VerifiedTransaction,
};

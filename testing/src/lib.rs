//! # Purchase State Testing
//!
//! Testing utilities for the purchase state engine.
//!
//! This crate provides:
//! - [`FixedClock`] / [`test_clock`]: deterministic time
//! - [`MockStorefront`]: a scriptable in-memory storefront
//! - [`TestKey`]: a storefront key that signs transactions the verifier accepts
//! - [`StaticOfferSigner`]: an offer signer with a canned answer
//! - proptest strategies for transaction fact sequences
//!
//! ## Example
//!
//! ```
//! use purchase_state_testing::{MockStorefront, TestKey};
//! use purchase_state_core::Product;
//! use purchase_state_core::ProductKind;
//!
//! let key = TestKey::new("store-key");
//! let storefront = MockStorefront::new();
//! storefront.set_products(vec![Product::new("p1", ProductKind::NonConsumable, "0.99", "USD")]);
//! storefront.push_transaction(key.purchase("t1", "p1"));
//! ```

use chrono::{DateTime, Utc};
use purchase_state_core::environment::Clock;

pub mod signing;
pub mod storefront;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use purchase_state_core::offer::{OfferSigner, PromotionalOfferSignature, SignFuture};
    use purchase_state_core::{OfferId, ProductId};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time unless moved with [`FixedClock::set`].
    ///
    /// # Example
    ///
    /// ```
    /// use purchase_state_testing::mocks::FixedClock;
    /// use purchase_state_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug)]
    pub struct FixedClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = time;
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// The instant [`test_clock`] starts at.
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Offer signer that always returns the same answer and counts calls.
    #[derive(Debug)]
    pub struct StaticOfferSigner {
        answer: Result<Option<PromotionalOfferSignature>, String>,
        calls: AtomicUsize,
    }

    impl StaticOfferSigner {
        /// Sign every request with `bytes`.
        #[must_use]
        pub fn signing(bytes: &[u8]) -> Self {
            Self::with_answer(Ok(Some(PromotionalOfferSignature::new(bytes.to_vec()))))
        }

        /// Decline every request (`Ok(None)`).
        #[must_use]
        pub const fn declining() -> Self {
            Self::with_answer(Ok(None))
        }

        /// Fail every request with `reason`.
        #[must_use]
        pub fn failing(reason: impl Into<String>) -> Self {
            Self::with_answer(Err(reason.into()))
        }

        const fn with_answer(answer: Result<Option<PromotionalOfferSignature>, String>) -> Self {
            Self {
                answer,
                calls: AtomicUsize::new(0),
            }
        }

        /// Number of sign requests received.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl OfferSigner for StaticOfferSigner {
        fn sign<'a>(&'a self, _product_id: &'a ProductId, _offer_id: &'a OfferId) -> SignFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.answer.clone();
            Box::pin(async move { answer })
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use std::time::Duration;

    /// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Poll `condition` until it holds or `timeout` passes.
    ///
    /// Returns whether the condition held.
    pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// One storefront delivery: transaction `index` for product `product`,
    /// optionally revoked.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Fact {
        /// Transaction number (becomes id `t{index}`)
        pub index: u8,
        /// Product number (becomes id `p{product}`)
        pub product: u8,
        /// Whether this delivery is a revocation
        pub revoked: bool,
    }

    /// A fact over a small id space, so sequences repeat and collide.
    pub fn fact() -> impl Strategy<Value = Fact> {
        // Each transaction id always belongs to the same product.
        (0u8..6, any::<bool>()).prop_map(|(index, revoked)| Fact {
            index,
            product: index % 3,
            revoked,
        })
    }

    /// A sequence of up to `max_len` facts.
    pub fn fact_sequence(max_len: usize) -> impl Strategy<Value = Vec<Fact>> {
        proptest::collection::vec(fact(), 0..max_len)
    }
}

pub use mocks::{FixedClock, StaticOfferSigner, test_clock, test_epoch};
pub use signing::TestKey;
pub use storefront::{MockStorefront, RefundScript};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1, test_epoch());
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = test_clock();
        clock.advance(chrono::Duration::hours(1));
        assert_eq!(clock.now(), test_epoch() + chrono::Duration::hours(1));
    }
}

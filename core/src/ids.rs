//! Strongly typed identifiers and snapshot generations.
//!
//! Every identifier the storefront hands out is an opaque string. Wrapping
//! each one in its own newtype keeps a `ProductId` from being passed where a
//! `TransactionId` is expected, and gives all of them the same parsing rules:
//!
//! - `FromStr::from_str()`: validates input (rejects empty strings)
//! - `From::from()` and `new()`: no validation (trusted storefront data)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing an identifier from untrusted input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind}: {reason}")]
pub struct ParseIdError {
    kind: &'static str,
    reason: String,
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Create a new `", stringify!($name), "` without validation.")]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Convert into the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(ParseIdError {
                        kind: $kind,
                        reason: "cannot be empty".to_string(),
                    });
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Storefront identifier of a purchasable item, e.g. `"com.example.pro"`.
    ///
    /// # Examples
    ///
    /// ```
    /// use purchase_state_core::ids::ProductId;
    ///
    /// let id = ProductId::new("com.example.pro");
    /// assert_eq!(id.as_str(), "com.example.pro");
    ///
    /// let parsed: ProductId = "com.example.coins".parse().unwrap();
    /// assert_eq!(parsed, ProductId::new("com.example.coins"));
    /// ```
    ProductId,
    "product id"
);

string_id!(
    /// Storefront identifier of a single transaction.
    TransactionId,
    "transaction id"
);

string_id!(
    /// Identifier of a promotional subscription offer configured in the storefront.
    OfferId,
    "offer id"
);

string_id!(
    /// Identifier of a subscription group. Subscriptions in the same group are
    /// mutually exclusive tiers of one service.
    SubscriptionGroupId,
    "subscription group id"
);

/// Monotonic counter stamped on every snapshot swap.
///
/// Readers can compare generations to tell whether a snapshot they hold is
/// still current without comparing contents.
///
/// # Examples
///
/// ```
/// use purchase_state_core::ids::Generation;
///
/// let g0 = Generation::INITIAL;
/// let g1 = g0.next();
/// assert!(g1 > g0);
/// assert_eq!(g1.value(), 1);
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(u64);

impl Generation {
    /// Generation of the empty snapshot installed at construction.
    pub const INITIAL: Self = Self(0);

    /// Create a generation with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw counter value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The following generation.
    ///
    /// Saturates at `u64::MAX`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    mod string_id_tests {
        use super::*;

        #[test]
        fn new_and_as_str() {
            let id = ProductId::new("p1");
            assert_eq!(id.as_str(), "p1");
            assert_eq!(id.into_inner(), "p1");
        }

        #[test]
        fn parse_from_str() {
            let id: TransactionId = "t-100".parse().unwrap();
            assert_eq!(id, TransactionId::new("t-100"));
        }

        #[test]
        fn parse_blank_string_fails() {
            assert!("".parse::<ProductId>().is_err());
            assert!("   ".parse::<OfferId>().is_err());
        }

        #[test]
        fn parse_error_names_the_kind() {
            let err = "".parse::<SubscriptionGroupId>().unwrap_err();
            assert_eq!(err.to_string(), "Invalid subscription group id: cannot be empty");
        }

        #[test]
        fn display() {
            let id = OfferId::new("promo1");
            assert_eq!(format!("{id}"), "promo1");
        }

        #[test]
        fn serializes_transparently() {
            let id = ProductId::new("p1");
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, "\"p1\"");
        }

        #[test]
        fn hash_lookup_by_str() {
            let mut map = std::collections::HashMap::new();
            map.insert(ProductId::new("p1"), 1);
            assert_eq!(map.get("p1"), Some(&1));
        }
    }

    mod generation_tests {
        use super::*;

        #[test]
        fn initial_is_zero() {
            assert_eq!(Generation::INITIAL.value(), 0);
            assert_eq!(Generation::default(), Generation::INITIAL);
        }

        #[test]
        fn next_increments() {
            let g = Generation::new(41).next();
            assert_eq!(g, Generation::new(42));
        }

        #[test]
        fn next_saturates() {
            assert_eq!(Generation::new(u64::MAX).next().value(), u64::MAX);
        }
    }
}

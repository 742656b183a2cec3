//! Purchasable product metadata.

use crate::ids::{ProductId, SubscriptionGroupId};
use serde::{Deserialize, Serialize};

/// The kind of a purchasable product.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProductKind {
    /// Used up once purchased (coins, credits); may be bought repeatedly.
    Consumable,
    /// Bought once and owned forever (unlock, upgrade).
    NonConsumable,
    /// Time-limited access that does not renew automatically.
    NonRenewable,
    /// Auto-renewing subscription, a tier within a subscription group.
    Subscription {
        /// Group the subscription tier belongs to.
        group_id: SubscriptionGroupId,
    },
}

impl ProductKind {
    /// Whether this is an auto-renewing subscription.
    #[must_use]
    pub const fn is_subscription(&self) -> bool {
        matches!(self, Self::Subscription { .. })
    }

    /// Subscription group, if this is a subscription.
    #[must_use]
    pub const fn group_id(&self) -> Option<&SubscriptionGroupId> {
        match self {
            Self::Subscription { group_id } => Some(group_id),
            _ => None,
        }
    }

    /// Whether two kinds are the same variant, ignoring the subscription group.
    #[must_use]
    pub const fn same_variant(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Consumable, Self::Consumable)
                | (Self::NonConsumable, Self::NonConsumable)
                | (Self::NonRenewable, Self::NonRenewable)
                | (Self::Subscription { .. }, Self::Subscription { .. })
        )
    }
}

/// A product as described by the storefront.
///
/// Products are created on catalog refresh and replaced wholesale on the next
/// one; they are never mutated in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Storefront identifier.
    pub id: ProductId,
    /// What kind of product this is.
    pub kind: ProductKind,
    /// Localized name.
    pub display_name: String,
    /// Localized description.
    pub description: String,
    /// Price as the storefront's decimal text, e.g. `"4.99"`.
    pub price: String,
    /// ISO 4217 currency code, e.g. `"USD"`.
    pub currency: String,
}

impl Product {
    /// Create a product with empty display strings.
    #[must_use]
    pub fn new(
        id: impl Into<ProductId>,
        kind: ProductKind,
        price: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            display_name: String::new(),
            description: String::new(),
            price: price.into(),
            currency: currency.into(),
        }
    }

    /// Set the localized display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the localized description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_group_accessors() {
        let kind = ProductKind::Subscription {
            group_id: SubscriptionGroupId::new("vip"),
        };
        assert!(kind.is_subscription());
        assert_eq!(kind.group_id().map(SubscriptionGroupId::as_str), Some("vip"));
        assert_eq!(ProductKind::Consumable.group_id(), None);
    }

    #[test]
    fn same_variant_ignores_group() {
        let gold = ProductKind::Subscription {
            group_id: SubscriptionGroupId::new("gold"),
        };
        let silver = ProductKind::Subscription {
            group_id: SubscriptionGroupId::new("silver"),
        };
        assert!(gold.same_variant(&silver));
        assert!(!gold.same_variant(&ProductKind::NonConsumable));
    }

    #[test]
    fn builder_sets_display_fields() {
        let product = Product::new("p1", ProductKind::NonConsumable, "1.99", "EUR")
            .with_display_name("Pro")
            .with_description("Unlocks everything");
        assert_eq!(product.id.as_str(), "p1");
        assert_eq!(product.display_name, "Pro");
        assert_eq!(product.description, "Unlocks everything");
    }
}

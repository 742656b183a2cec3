//! The storefront collaborator.
//!
//! The engine has no wire format of its own; it wraps a platform storefront
//! (App Store, Play Billing, a web checkout) behind the [`Storefront`] trait.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────┐
//!                 │     Storefront     │
//!                 └─────────┬──────────┘
//!     fetch_products        │        transaction_stream
//!     submit_purchase       │        current_entitlements
//!     request_refund        │        finish_transaction
//!                           ▼
//!   ┌─────────────┐  ┌─────────────┐  ┌──────────────┐
//!   │   Catalog   │  │  Listener   │  │ Coordinators │
//!   └─────────────┘  └─────────────┘  └──────────────┘
//! ```
//!
//! # Delivery semantics
//!
//! - The transaction stream is at-least-once: the same transaction may be
//!   delivered again until it is acknowledged with
//!   [`Storefront::finish_transaction`]. Consumers dedup by transaction id.
//! - Events for the same product arrive in the order the storefront recorded
//!   them.
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! engine can hold the storefront as `Arc<dyn Storefront>`.

use crate::error::StorefrontError;
use crate::ids::{OfferId, ProductId, TransactionId};
use crate::offer::PromotionalOfferSignature;
use crate::product::Product;
use crate::refund::RefundOutcome;
use crate::transaction::Transaction;
use futures::Stream;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

/// Stream of transactions from the storefront.
pub type TransactionStream =
    Pin<Box<dyn Stream<Item = Result<Transaction, StorefrontError>> + Send>>;

/// Stream of refund flow outcomes. The first item is the terminal outcome.
pub type RefundOutcomeStream =
    Pin<Box<dyn Stream<Item = Result<RefundOutcome, StorefrontError>> + Send>>;

/// Boxed future returned by storefront methods.
pub type StorefrontFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, StorefrontError>> + Send + 'a>>;

/// Options accompanying a purchase submission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Promotional offer being redeemed, with the host-produced signature.
    pub offer: Option<(OfferId, PromotionalOfferSignature)>,
}

/// Storefront verdict on a purchase submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorefrontPurchaseResult {
    /// The purchase went through; the transaction still needs verifying.
    Success(Transaction),
    /// The user dismissed the purchase sheet.
    UserCancelled,
    /// The purchase awaits approval; a transaction arrives later on the
    /// transaction stream if it is approved.
    Pending,
    /// The storefront refused or failed the purchase.
    Failed(String),
}

/// A platform storefront.
pub trait Storefront: Send + Sync {
    /// Fetch product metadata for the given identifiers.
    ///
    /// May return fewer products than requested (unknown or unavailable ids).
    fn fetch_products<'a>(&'a self, ids: &'a BTreeSet<ProductId>) -> StorefrontFuture<'a, Vec<Product>>;

    /// Submit a purchase.
    fn submit_purchase<'a>(
        &'a self,
        product_id: &'a ProductId,
        options: SubmitOptions,
    ) -> StorefrontFuture<'a, StorefrontPurchaseResult>;

    /// Subscribe to the live transaction stream (purchases made elsewhere,
    /// renewals, approvals of pending purchases, revocations).
    fn transaction_stream(&self) -> StorefrontFuture<'_, TransactionStream>;

    /// Stream the transactions that currently entitle the user to something.
    ///
    /// The stream ends once all current entitlements have been delivered.
    fn current_entitlements(&self) -> StorefrontFuture<'_, TransactionStream>;

    /// Start the storefront's refund flow for a transaction.
    fn request_refund<'a>(
        &'a self,
        transaction_id: &'a TransactionId,
    ) -> StorefrontFuture<'a, RefundOutcomeStream>;

    /// Whether the current device/account may make payments.
    fn can_make_payments(&self) -> StorefrontFuture<'_, bool>;

    /// Acknowledge a processed transaction so it is not redelivered.
    fn finish_transaction<'a>(&'a self, transaction_id: &'a TransactionId) -> StorefrontFuture<'a, ()>;
}

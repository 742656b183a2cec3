//! Purchase coordination.
//!
//! [`PurchaseCoordinator::purchase`] drives one purchase attempt from the
//! payment checks through offer signing and submission to the verified
//! entitlement change. At most one attempt per product is in flight; a
//! second concurrent call fails fast with
//! [`PurchaseError::AlreadyInProgress`] and never reaches the storefront.

use crate::catalog::ProductCatalog;
use crate::entitlements::ApplyOutcome;
use crate::notifications::{ChangeNotifier, StoreChange};
use crate::processor::{ProcessOutcome, TransactionProcessor};
use purchase_state_core::{
    Entitlement, OfferId, OfferSigner, ProductId, PurchaseError, Storefront,
    StorefrontPurchaseResult, SubmitOptions, Transaction,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Options for a purchase attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurchaseOptions {
    /// Promotional offer to redeem; requires an offer signer.
    pub offer_id: Option<OfferId>,
}

impl PurchaseOptions {
    /// Redeem `offer_id` with this purchase.
    #[must_use]
    pub fn with_offer(offer_id: impl Into<OfferId>) -> Self {
        Self {
            offer_id: Some(offer_id.into()),
        }
    }
}

/// A completed, verified purchase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseOutcome {
    /// The verified transaction.
    pub transaction: Transaction,
    /// The product's entitlement after the transaction was applied.
    pub entitlement: Entitlement,
}

/// Where a product's most recent purchase attempt stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PurchaseState {
    /// No attempt yet.
    #[default]
    NotStarted,
    /// Signing or awaiting the storefront.
    InProgress,
    /// Completed and verified.
    Purchased,
    /// Awaiting external approval.
    Pending,
    /// The user backed out.
    Cancelled,
    /// The storefront or the offer signer failed.
    Failed,
    /// The storefront's transaction did not verify.
    FailedVerification,
    /// Payments are not allowed on this device.
    NotAllowed,
}

type InFlight = Arc<Mutex<HashSet<ProductId>>>;

/// Releases a product's in-flight marker on drop, on every exit path.
struct InFlightGuard {
    in_flight: InFlight,
    product_id: ProductId,
}

impl InFlightGuard {
    fn claim(in_flight: &InFlight, product_id: &ProductId) -> Option<Self> {
        let claimed = in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(product_id.clone());
        claimed.then(|| Self {
            in_flight: Arc::clone(in_flight),
            product_id: product_id.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.product_id);
    }
}

/// Coordinates purchase attempts.
pub struct PurchaseCoordinator {
    storefront: Arc<dyn Storefront>,
    processor: TransactionProcessor,
    catalog: Arc<ProductCatalog>,
    signer: Option<Arc<dyn OfferSigner>>,
    notifier: ChangeNotifier,
    payments_allowed: Arc<AtomicBool>,
    in_flight: InFlight,
    states: Mutex<HashMap<ProductId, PurchaseState>>,
}

impl PurchaseCoordinator {
    /// Create a coordinator.
    ///
    /// `payments_allowed` is the cached result of
    /// [`Storefront::can_make_payments`], kept fresh by the owner.
    #[must_use]
    pub fn new(
        storefront: Arc<dyn Storefront>,
        processor: TransactionProcessor,
        catalog: Arc<ProductCatalog>,
        signer: Option<Arc<dyn OfferSigner>>,
        notifier: ChangeNotifier,
        payments_allowed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            storefront,
            processor,
            catalog,
            signer,
            notifier,
            payments_allowed,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Purchase `product_id`.
    ///
    /// On storefront success the transaction is verified, applied, finished
    /// and announced before this returns.
    ///
    /// # Errors
    ///
    /// - [`PurchaseError::PaymentsNotAllowed`]: the device may not pay.
    /// - [`PurchaseError::ProductUnavailable`]: not in the current catalog.
    /// - [`PurchaseError::AlreadyInProgress`]: another attempt is in flight.
    /// - [`PurchaseError::OfferSigningFailed`]: an offer was requested and
    ///   could not be signed; nothing was submitted.
    /// - [`PurchaseError::UserCancelled`], [`PurchaseError::Pending`],
    ///   [`PurchaseError::Failed`]: the storefront's verdict. `Failed` also
    ///   covers a transaction that was revoked before it could be granted.
    /// - [`PurchaseError::FailedVerification`]: the storefront reported
    ///   success but the transaction did not verify.
    #[tracing::instrument(skip(self, options), fields(offer_id = ?options.offer_id))]
    pub async fn purchase(
        &self,
        product_id: &ProductId,
        options: PurchaseOptions,
    ) -> Result<PurchaseOutcome, PurchaseError> {
        if !self.payments_allowed.load(Ordering::SeqCst) {
            self.set_state(product_id, PurchaseState::NotAllowed);
            return Err(PurchaseError::PaymentsNotAllowed);
        }

        if self.catalog.lookup(product_id).is_none() {
            tracing::warn!("Product is not in the catalog");
            return Err(PurchaseError::ProductUnavailable(product_id.clone()));
        }

        let Some(_guard) = InFlightGuard::claim(&self.in_flight, product_id) else {
            tracing::debug!("Purchase already in progress");
            metrics::counter!("store_purchases_rejected_in_flight_total").increment(1);
            return Err(PurchaseError::AlreadyInProgress(product_id.clone()));
        };

        self.set_state(product_id, PurchaseState::InProgress);
        metrics::counter!("store_purchases_started_total").increment(1);

        let result = self.attempt(product_id, options).await;
        let state = match &result {
            Ok(_) => PurchaseState::Purchased,
            Err(PurchaseError::Pending) => PurchaseState::Pending,
            Err(PurchaseError::UserCancelled) => PurchaseState::Cancelled,
            Err(PurchaseError::FailedVerification(_)) => PurchaseState::FailedVerification,
            Err(_) => PurchaseState::Failed,
        };
        self.set_state(product_id, state);

        match &result {
            Ok(_) => tracing::info!("Purchase completed"),
            Err(err) => tracing::info!(error = %err, "Purchase did not complete"),
        }
        metrics::counter!("store_purchases_finished_total", "state" => format!("{state:?}"))
            .increment(1);
        result
    }

    async fn attempt(
        &self,
        product_id: &ProductId,
        options: PurchaseOptions,
    ) -> Result<PurchaseOutcome, PurchaseError> {
        let mut submit = SubmitOptions::default();
        if let Some(offer_id) = options.offer_id {
            let signer = self.signer.as_ref().ok_or_else(|| {
                PurchaseError::OfferSigningFailed("no offer signer configured".to_string())
            })?;
            let signature = signer
                .sign(product_id, &offer_id)
                .await
                .map_err(PurchaseError::OfferSigningFailed)?
                .ok_or_else(|| {
                    PurchaseError::OfferSigningFailed(format!(
                        "signer declined offer {offer_id}"
                    ))
                })?;
            submit.offer = Some((offer_id, signature));
        }

        let verdict = self
            .storefront
            .submit_purchase(product_id, submit)
            .await
            .map_err(|err| PurchaseError::Failed(err.to_string()))?;

        let transaction = match verdict {
            StorefrontPurchaseResult::Success(transaction) => transaction,
            StorefrontPurchaseResult::UserCancelled => return Err(PurchaseError::UserCancelled),
            StorefrontPurchaseResult::Pending => return Err(PurchaseError::Pending),
            StorefrontPurchaseResult::Failed(reason) => return Err(PurchaseError::Failed(reason)),
        };

        let applied = match self.processor.process(transaction.clone()).await {
            ProcessOutcome::Applied(applied) => applied,
            ProcessOutcome::Unverified(reason) => {
                return Err(PurchaseError::FailedVerification(reason));
            }
        };

        if transaction.product_id != *product_id {
            return Err(PurchaseError::Failed(format!(
                "storefront returned a transaction for {}",
                transaction.product_id
            )));
        }

        let entitlement = match applied {
            ApplyOutcome::Applied(entitlement) => Some(entitlement),
            // Already applied (e.g. the listener got there first): report
            // what the cache holds now.
            _ => self.processor.cache().entitlement(product_id),
        };
        let Some(entitlement) = entitlement.filter(|e| e.owned) else {
            tracing::warn!(transaction_id = %transaction.id, "Purchased transaction was already revoked");
            return Err(PurchaseError::Failed(format!(
                "transaction {} was revoked before it was granted",
                transaction.id
            )));
        };

        Ok(PurchaseOutcome {
            transaction,
            entitlement,
        })
    }

    fn set_state(&self, product_id: &ProductId, state: PurchaseState) {
        let previous = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(product_id.clone(), state);

        if previous != Some(state) {
            self.notifier.publish(StoreChange::PurchaseStateChanged {
                product_id: product_id.clone(),
                state,
            });
        }
    }

    /// State of the most recent attempt for `product_id`.
    #[must_use]
    pub fn purchase_state(&self, product_id: &ProductId) -> PurchaseState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(product_id)
            .copied()
            .unwrap_or_default()
    }

    /// Whether an attempt for `product_id` is in flight.
    #[must_use]
    pub fn is_in_flight(&self, product_id: &ProductId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(product_id)
    }
}

impl std::fmt::Debug for PurchaseCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseCoordinator")
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_marker_on_drop() {
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let product_id = ProductId::new("p1");

        let guard = InFlightGuard::claim(&in_flight, &product_id).unwrap();
        assert!(InFlightGuard::claim(&in_flight, &product_id).is_none());

        drop(guard);
        assert!(InFlightGuard::claim(&in_flight, &product_id).is_some());
        assert!(in_flight.lock().unwrap().is_empty());
    }

    #[test]
    fn guard_releases_marker_on_panic() {
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let product_id = ProductId::new("p1");

        let arena = Arc::clone(&in_flight);
        let id = product_id.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = InFlightGuard::claim(&arena, &id).unwrap();
            #[allow(clippy::panic)]
            {
                panic!("purchase blew up");
            }
        });

        assert!(result.is_err());
        assert!(InFlightGuard::claim(&in_flight, &product_id).is_some());
    }

    #[test]
    fn default_state_is_not_started() {
        assert_eq!(PurchaseState::default(), PurchaseState::NotStarted);
    }
}

//! The [`StoreState`] façade.
//!
//! Composes the catalog, the entitlement cache, the transaction listener
//! and the purchase/refund coordinators behind one handle for the
//! presentation layer. Reads are snapshot reads; nothing here makes a UI
//! read wait on the storefront.
//!
//! # Example
//!
//! ```ignore
//! let store = StoreState::builder()
//!     .storefront(storefront)
//!     .trust_store(trust)
//!     .offer_signer(signer)
//!     .config(StoreConfig::from_env()?)
//!     .start()
//!     .await?;
//!
//! let _subscription = store.subscribe(|change| tracing::info!(?change, "store changed"));
//! store.refresh_products(&ids, true).await?;
//! if store.is_purchased(&ProductId::new("premium")) { /* unlock */ }
//! ```

use crate::catalog::{CatalogSnapshot, ProductCatalog};
use crate::config::{ConfigError, StoreConfig};
use crate::entitlements::{EntitlementCache, EntitlementSnapshot, RebuildReport};
use crate::health::{HealthCheck, HealthReport};
use crate::listener::{ListenerState, TransactionListener};
use crate::notifications::{ChangeNotifier, ChangeReceiver, StoreChange, Subscription};
use crate::processor::TransactionProcessor;
use crate::purchase::{PurchaseCoordinator, PurchaseOptions, PurchaseOutcome, PurchaseState};
use crate::refund::{RefundCoordinator, RefundTicket};
use purchase_state_core::environment::{Clock, SystemClock};
use purchase_state_core::{
    CatalogError, Entitlement, OfferSigner, Product, ProductId, PurchaseError, RefundError,
    Storefront, StorefrontError, SubscriptionGroupId, TransactionId, TransactionVerifier,
    TrustStore,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors from façade operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The catalog refresh failed or was partial.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Rebuilding entitlements from the storefront failed; the previous
    /// entitlements are kept.
    #[error("Entitlement rebuild failed: {0}")]
    Rebuild(StorefrontError),

    /// The store was shut down.
    #[error("Store has been shut down")]
    AlreadyShutDown,

    /// The store could not be built from its configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What a successful [`StoreState::refresh_products`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshReport {
    /// Products now in the catalog
    pub products: Vec<Product>,
    /// Entitlement rebuild result, when one was requested
    pub rebuild: Option<RebuildReport>,
}

/// Builder for [`StoreState`].
pub struct StoreStateBuilder {
    storefront: Option<Arc<dyn Storefront>>,
    trust: TrustStore,
    signer: Option<Arc<dyn OfferSigner>>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl StoreStateBuilder {
    /// The platform storefront (required).
    #[must_use]
    pub fn storefront(mut self, storefront: Arc<dyn Storefront>) -> Self {
        self.storefront = Some(storefront);
        self
    }

    /// Keys transaction signatures are checked against.
    #[must_use]
    pub fn trust_store(mut self, trust: TrustStore) -> Self {
        self.trust = trust;
        self
    }

    /// Signer for promotional offers. Without one, offer purchases fail.
    #[must_use]
    pub fn offer_signer(mut self, signer: Arc<dyn OfferSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Clock for verification and health timestamps (default: system clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the store without starting background work.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] when no storefront was given or the
    /// configuration is invalid.
    pub fn build(self) -> Result<StoreState, StoreError> {
        self.config.validate()?;
        let storefront = self.storefront.ok_or_else(|| {
            ConfigError::ValidationError("a storefront is required".to_string())
        })?;

        if self.trust.is_empty() {
            tracing::warn!("Trust store is empty; no transaction will verify");
        }

        let notifier = ChangeNotifier::new(self.config.notification_capacity);
        let verifier = TransactionVerifier::new(self.trust, Arc::clone(&self.clock));
        let cache = Arc::new(EntitlementCache::new());
        let catalog = Arc::new(ProductCatalog::new(Arc::clone(&storefront), notifier.clone()));
        let processor = TransactionProcessor::new(
            verifier,
            Arc::clone(&cache),
            Arc::clone(&storefront),
            notifier.clone(),
        );
        let listener = TransactionListener::new(
            Arc::clone(&storefront),
            processor.clone(),
            notifier.clone(),
            self.config.listener.retry_policy(),
        );
        let payments_allowed = Arc::new(AtomicBool::new(false));
        let purchases = PurchaseCoordinator::new(
            Arc::clone(&storefront),
            processor.clone(),
            Arc::clone(&catalog),
            self.signer,
            notifier.clone(),
            Arc::clone(&payments_allowed),
        );
        let refunds = RefundCoordinator::new(Arc::clone(&storefront), notifier.clone());

        Ok(StoreState {
            config: self.config,
            storefront,
            clock: self.clock,
            notifier,
            catalog,
            cache,
            processor,
            listener,
            purchases,
            refunds,
            payments_allowed,
            refresher: Mutex::new(None),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Build the store and [`start`](StoreState::start) it.
    ///
    /// # Errors
    ///
    /// See [`StoreStateBuilder::build`].
    pub async fn start(self) -> Result<StoreState, StoreError> {
        let store = self.build()?;
        store.start().await?;
        Ok(store)
    }
}

/// Purchase state and product cache engine.
pub struct StoreState {
    config: StoreConfig,
    storefront: Arc<dyn Storefront>,
    clock: Arc<dyn Clock>,
    notifier: ChangeNotifier,
    catalog: Arc<ProductCatalog>,
    cache: Arc<EntitlementCache>,
    processor: TransactionProcessor,
    listener: TransactionListener,
    purchases: PurchaseCoordinator,
    refunds: RefundCoordinator,
    payments_allowed: Arc<AtomicBool>,
    refresher: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl StoreState {
    /// Start building a store.
    #[must_use]
    pub fn builder() -> StoreStateBuilder {
        StoreStateBuilder {
            storefront: None,
            trust: TrustStore::new(),
            signer: None,
            clock: Arc::new(SystemClock),
            config: StoreConfig::default(),
        }
    }

    // --- lifecycle ---

    /// Refresh `can_transact`, start the transaction listener and the
    /// periodic `can_transact` refresher. Starting twice is a no-op.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyShutDown`] after [`StoreState::shutdown`].
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), StoreError> {
        self.ensure_running()?;

        self.refresh_can_transact().await;
        self.listener.start();

        let mut refresher = self.refresher.lock().unwrap_or_else(PoisonError::into_inner);
        if refresher.is_none() {
            *refresher = Some(spawn_can_transact_refresher(
                Arc::clone(&self.storefront),
                Arc::clone(&self.payments_allowed),
                self.config.can_transact_refresh_interval(),
            ));
        }
        drop(refresher);

        self.started.store(true, Ordering::SeqCst);
        tracing::info!("Store started");
        Ok(())
    }

    /// Stop the listener and the refresher, and dismiss pending refunds.
    ///
    /// Purchases already in flight run to completion. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.listener.stop().await;
        let refresher = self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(refresher) = refresher {
            refresher.abort();
        }
        self.refunds.dismiss_all();

        tracing::info!("Store shut down");
    }

    fn ensure_running(&self) -> Result<(), StoreError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(StoreError::AlreadyShutDown)
        } else {
            Ok(())
        }
    }

    // --- payments ---

    /// Whether the device may make payments, as last reported by the storefront.
    #[must_use]
    pub fn can_transact(&self) -> bool {
        self.payments_allowed.load(Ordering::SeqCst)
    }

    /// Ask the storefront now and update the cached flag.
    ///
    /// On a storefront error the previous value is kept and returned.
    pub async fn refresh_can_transact(&self) -> bool {
        update_can_transact(self.storefront.as_ref(), &self.payments_allowed).await
    }

    // --- catalog & entitlements ---

    /// Refresh the catalog with `ids`; with `rebuild_caches`, also rebuild
    /// entitlements from the storefront's current entitlements.
    ///
    /// The rebuild runs even when the catalog refresh fails.
    ///
    /// # Errors
    ///
    /// [`StoreError::Catalog`] takes precedence over [`StoreError::Rebuild`].
    /// [`StoreError::AlreadyShutDown`] after shutdown.
    #[tracing::instrument(skip(self, ids), fields(requested = ids.len()))]
    pub async fn refresh_products(
        &self,
        ids: &BTreeSet<ProductId>,
        rebuild_caches: bool,
    ) -> Result<RefreshReport, StoreError> {
        self.ensure_running()?;

        let catalog = self.catalog.refresh(ids).await;
        let rebuild = if rebuild_caches {
            Some(self.rebuild_entitlements().await)
        } else {
            None
        };

        let products = catalog?;
        let rebuild = rebuild.transpose().map_err(StoreError::Rebuild)?;
        Ok(RefreshReport { products, rebuild })
    }

    /// Rebuild the entitlement cache from the storefront's current entitlements.
    ///
    /// # Errors
    ///
    /// Returns the storefront error; the previous entitlements are kept.
    pub async fn rebuild_entitlements(&self) -> Result<RebuildReport, StorefrontError> {
        let report = self
            .cache
            .rebuild_from_current_entitlements(
                self.processor.verifier(),
                self.storefront.current_entitlements(),
            )
            .await?;

        self.notifier.publish(StoreChange::EntitlementsRebuilt {
            generation: report.generation,
            owned: report.owned,
        });
        Ok(report)
    }

    /// Whether `product_id` is currently owned.
    #[must_use]
    pub fn is_purchased(&self, product_id: &ProductId) -> bool {
        self.cache.is_purchased(product_id)
    }

    /// Entitlement for `product_id`.
    #[must_use]
    pub fn entitlement(&self, product_id: &ProductId) -> Option<Entitlement> {
        self.cache.entitlement(product_id)
    }

    /// Snapshot of all entitlements.
    #[must_use]
    pub fn entitlements(&self) -> Arc<EntitlementSnapshot> {
        self.cache.snapshot()
    }

    /// Snapshot of the catalog.
    #[must_use]
    pub fn products(&self) -> Arc<CatalogSnapshot> {
        self.catalog.snapshot()
    }

    /// A product from the catalog.
    #[must_use]
    pub fn product(&self, product_id: &ProductId) -> Option<Product> {
        self.catalog.lookup(product_id)
    }

    /// The catalog itself, for kind and group queries.
    #[must_use]
    pub fn catalog(&self) -> &ProductCatalog {
        &self.catalog
    }

    /// The owned subscription tier in `group`, if any.
    ///
    /// With several owned tiers, the first by product id.
    #[must_use]
    pub fn active_subscription(&self, group: &SubscriptionGroupId) -> Option<Product> {
        let entitlements = self.cache.snapshot();
        self.catalog
            .subscriptions_in_group(group)
            .into_iter()
            .find(|product| entitlements.is_purchased(&product.id))
    }

    // --- notifications ---

    /// Run `on_change` for every change. Drop the handle to unsubscribe.
    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(StoreChange) + Send + Sync + 'static,
    {
        self.notifier.subscribe_fn(on_change)
    }

    /// Raw change receiver.
    #[must_use]
    pub fn changes(&self) -> ChangeReceiver {
        self.notifier.subscribe()
    }

    // --- purchases & refunds ---

    /// Purchase `product_id`. See [`PurchaseCoordinator::purchase`].
    ///
    /// # Errors
    ///
    /// See [`PurchaseCoordinator::purchase`].
    pub async fn purchase(
        &self,
        product_id: &ProductId,
        options: PurchaseOptions,
    ) -> Result<PurchaseOutcome, PurchaseError> {
        self.purchases.purchase(product_id, options).await
    }

    /// State of the most recent purchase attempt for `product_id`.
    #[must_use]
    pub fn purchase_state(&self, product_id: &ProductId) -> PurchaseState {
        self.purchases.purchase_state(product_id)
    }

    /// Whether a purchase attempt for `product_id` is in flight.
    #[must_use]
    pub fn is_purchase_in_flight(&self, product_id: &ProductId) -> bool {
        self.purchases.is_in_flight(product_id)
    }

    /// Start a refund request. See [`RefundCoordinator::request_refund`].
    ///
    /// # Errors
    ///
    /// Returns [`RefundError::AlreadyPending`] for a transaction whose
    /// refund has not resolved yet.
    pub fn request_refund(&self, transaction_id: &TransactionId) -> Result<RefundTicket, RefundError> {
        self.refunds.request_refund(transaction_id)
    }

    /// Dismiss a pending refund request on the host's behalf.
    pub fn dismiss_refund(&self, transaction_id: &TransactionId) -> bool {
        self.refunds.dismiss(transaction_id)
    }

    // --- introspection ---

    /// Current transaction listener state.
    #[must_use]
    pub fn listener_state(&self) -> ListenerState {
        self.listener.state()
    }

    /// Configuration the store was built with.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Health of the store's long-running parts.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let listener = match self.listener.state() {
            ListenerState::Listening => HealthCheck::healthy("listener"),
            ListenerState::Reconnecting => HealthCheck::degraded(
                "listener",
                self.listener
                    .last_error()
                    .map_or_else(|| "reconnecting".to_string(), |e| e.to_string()),
            ),
            ListenerState::Stopped if self.shut_down.load(Ordering::SeqCst) => {
                HealthCheck::degraded("listener", "store shut down")
            }
            ListenerState::Stopped if !self.started.load(Ordering::SeqCst) => {
                HealthCheck::degraded("listener", "not started")
            }
            ListenerState::Stopped => HealthCheck::unhealthy(
                "listener",
                self.listener
                    .last_error()
                    .map_or_else(|| "stopped".to_string(), |e| e.to_string()),
            ),
        };

        let payments = if self.can_transact() {
            HealthCheck::healthy("payments")
        } else {
            HealthCheck::degraded("payments", "payments not allowed")
        };

        let catalog = self.catalog.snapshot();
        let catalog = HealthCheck::healthy("catalog")
            .with_metadata("generation", catalog.generation().to_string())
            .with_metadata("products", catalog.len().to_string());

        let entitlements = self.cache.snapshot();
        let entitlements = HealthCheck::healthy("entitlements")
            .with_metadata("generation", entitlements.generation().to_string())
            .with_metadata("owned", entitlements.owned_product_ids().len().to_string());

        HealthReport::new(vec![listener, payments, catalog, entitlements], self.clock.now())
    }
}

impl std::fmt::Debug for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreState")
            .field("listener", &self.listener.state())
            .field("can_transact", &self.can_transact())
            .field("catalog_generation", &self.catalog.generation())
            .field("entitlement_generation", &self.cache.generation())
            .finish_non_exhaustive()
    }
}

impl Drop for StoreState {
    fn drop(&mut self) {
        if let Some(refresher) = self
            .refresher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            refresher.abort();
        }
    }
}

async fn update_can_transact(storefront: &dyn Storefront, payments_allowed: &AtomicBool) -> bool {
    match storefront.can_make_payments().await {
        Ok(allowed) => {
            let previous = payments_allowed.swap(allowed, Ordering::SeqCst);
            if previous != allowed {
                tracing::info!(allowed, "Payment availability changed");
            }
            allowed
        }
        Err(err) => {
            tracing::warn!(error = %err, "Could not refresh payment availability");
            payments_allowed.load(Ordering::SeqCst)
        }
    }
}

fn spawn_can_transact_refresher(
    storefront: Arc<dyn Storefront>,
    payments_allowed: Arc<AtomicBool>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            update_can_transact(storefront.as_ref(), &payments_allowed).await;
        }
    })
}

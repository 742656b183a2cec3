//! Product catalog cache.
//!
//! The catalog is an immutable [`CatalogSnapshot`] behind a
//! `tokio::sync::watch` channel. A refresh builds a whole new snapshot and
//! swaps it in; readers clone the current `Arc` and never wait on the
//! network.

use crate::notifications::{ChangeNotifier, StoreChange};
use purchase_state_core::{
    CatalogError, Generation, Product, ProductId, ProductKind, Storefront, SubscriptionGroupId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// An immutable view of the catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    generation: Generation,
    products: BTreeMap<ProductId, Product>,
}

impl CatalogSnapshot {
    /// Generation of this snapshot; bumped on every swap.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Look up a product.
    #[must_use]
    pub fn get(&self, id: &ProductId) -> Option<&Product> {
        self.products.get(id)
    }

    /// Whether the snapshot has a product with this id.
    #[must_use]
    pub fn contains(&self, id: &ProductId) -> bool {
        self.products.contains_key(id)
    }

    /// All products, ordered by id.
    pub fn products(&self) -> impl Iterator<Item = &Product> {
        self.products.values()
    }

    /// Number of products.
    #[must_use]
    pub fn len(&self) -> usize {
        self.products.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

/// Storefront-backed product catalog.
pub struct ProductCatalog {
    storefront: Arc<dyn Storefront>,
    notifier: ChangeNotifier,
    snapshot: watch::Sender<Arc<CatalogSnapshot>>,
}

impl ProductCatalog {
    /// Create an empty catalog at [`Generation::INITIAL`].
    #[must_use]
    pub fn new(storefront: Arc<dyn Storefront>, notifier: ChangeNotifier) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(CatalogSnapshot::default()));
        Self {
            storefront,
            notifier,
            snapshot,
        }
    }

    /// Fetch `ids` from the storefront and replace the catalog with the result.
    ///
    /// Products the storefront returns without being asked for are ignored.
    /// An empty `ids` set installs an empty catalog without a storefront call.
    /// Concurrent refreshes are last-write-wins.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::Unreachable`]: the storefront call failed; the
    ///   previous catalog is kept.
    /// - [`CatalogError::PartialResult`]: some ids were not returned; the
    ///   returned subset has been installed.
    #[tracing::instrument(skip(self, ids), fields(requested = ids.len()))]
    pub async fn refresh(&self, ids: &BTreeSet<ProductId>) -> Result<Vec<Product>, CatalogError> {
        if ids.is_empty() {
            self.install(BTreeMap::new());
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let fetched = self.storefront.fetch_products(ids).await;
        metrics::histogram!("store_catalog_fetch_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        let fetched = match fetched {
            Ok(products) => products,
            Err(err) => {
                tracing::warn!(error = %err, "Catalog refresh failed, keeping previous snapshot");
                metrics::counter!("store_catalog_refresh_failures_total").increment(1);
                return Err(CatalogError::from(err));
            }
        };

        let products: BTreeMap<ProductId, Product> = fetched
            .into_iter()
            .filter(|product| {
                let requested = ids.contains(&product.id);
                if !requested {
                    tracing::debug!(product_id = %product.id, "Ignoring unrequested product");
                }
                requested
            })
            .map(|product| (product.id.clone(), product))
            .collect();

        let missing: Vec<ProductId> = ids
            .iter()
            .filter(|id| !products.contains_key(*id))
            .cloned()
            .collect();

        let installed = self.install(products);

        if missing.is_empty() {
            Ok(installed.products().cloned().collect())
        } else {
            tracing::warn!(?missing, "Storefront returned a partial catalog");
            Err(CatalogError::PartialResult { missing })
        }
    }

    fn install(&self, products: BTreeMap<ProductId, Product>) -> Arc<CatalogSnapshot> {
        let mut installed = None;
        self.snapshot.send_modify(|current| {
            let next = Arc::new(CatalogSnapshot {
                generation: current.generation.next(),
                products,
            });
            installed = Some(Arc::clone(&next));
            *current = next;
        });
        let installed = installed.unwrap_or_else(|| self.snapshot());

        tracing::info!(
            generation = %installed.generation,
            products = installed.len(),
            "Installed catalog snapshot"
        );
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("store_catalog_products").set(installed.len() as f64);
        self.notifier.publish(StoreChange::CatalogRefreshed {
            generation: installed.generation,
            product_count: installed.len(),
        });

        installed
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Look up a product in the current snapshot.
    #[must_use]
    pub fn lookup(&self, id: &ProductId) -> Option<Product> {
        self.snapshot.borrow().get(id).cloned()
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.snapshot.borrow().generation
    }

    /// Products of the same kind as `kind` (any group, for subscriptions).
    #[must_use]
    pub fn products_of_kind(&self, kind: &ProductKind) -> Vec<Product> {
        self.snapshot
            .borrow()
            .products()
            .filter(|p| p.kind.same_variant(kind))
            .cloned()
            .collect()
    }

    /// Subscription tiers in `group`.
    #[must_use]
    pub fn subscriptions_in_group(&self, group: &SubscriptionGroupId) -> Vec<Product> {
        self.snapshot
            .borrow()
            .products()
            .filter(|p| p.kind.group_id() == Some(group))
            .cloned()
            .collect()
    }

    /// Receiver that observes every snapshot swap.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<CatalogSnapshot>> {
        self.snapshot.subscribe()
    }
}

impl std::fmt::Debug for ProductCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductCatalog")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

//! # Purchase State Runtime
//!
//! The concurrent half of the purchase state engine: snapshot caches, the
//! long-lived transaction listener, purchase and refund coordination, and
//! the [`StoreState`] façade that composes them.
//!
//! ## Core Components
//!
//! - **Catalog**: products fetched from the storefront, swapped in whole
//! - **Entitlements**: ownership folded from verified transactions
//! - **Listener**: consumes the storefront's transaction stream, resubscribing on transient errors
//! - **Coordinators**: one purchase in flight per product, exactly-once refund resolution
//! - **Notifications**: fan-out of every change to subscribers
//!
//! Reads never wait on the storefront: every query returns the snapshot
//! installed by the last completed write.
//!
//! ## Example
//!
//! ```ignore
//! use purchase_state_runtime::{StoreConfig, StoreState};
//!
//! let store = StoreState::builder()
//!     .storefront(storefront)
//!     .trust_store(trust)
//!     .config(StoreConfig::from_env()?)
//!     .start()
//!     .await?;
//!
//! store.refresh_products(&ids, true).await?;
//! let premium = store.is_purchased(&ProductId::new("premium"));
//! ```

/// Product catalog cache
pub mod catalog;

/// Engine configuration
pub mod config;

/// Entitlement cache
pub mod entitlements;

/// Health reporting
pub mod health;

/// Transaction stream listener
pub mod listener;

/// Prometheus metrics for observability
pub mod metrics;

/// Change notifications
pub mod notifications;

/// Verify-apply-finish pipeline shared by the listener and purchases
pub mod processor;

/// Purchase coordination
pub mod purchase;

/// Refund coordination
pub mod refund;

/// Retry logic with exponential backoff
pub mod retry;

/// The store façade
pub mod store;

pub use catalog::{CatalogSnapshot, ProductCatalog};
pub use config::{ConfigError, ListenerConfig, StoreConfig};
pub use entitlements::{ApplyOutcome, EntitlementCache, EntitlementSnapshot, RebuildReport};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use listener::{ListenerState, TransactionListener};
pub use notifications::{ChangeNotifier, ChangeReceiver, StoreChange, Subscription};
pub use processor::{ProcessOutcome, TransactionProcessor};
pub use purchase::{PurchaseCoordinator, PurchaseOptions, PurchaseOutcome, PurchaseState};
pub use refund::{RefundCoordinator, RefundTicket};
pub use retry::RetryPolicy;
pub use store::{RefreshReport, StoreError, StoreState, StoreStateBuilder};

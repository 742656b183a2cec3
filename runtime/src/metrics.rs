//! Prometheus metrics for the engine.
//!
//! Every component records through the `metrics` facade:
//! - Catalog refreshes
//! - Transaction processing and verification failures
//! - Listener reconnects and fatal stops
//! - Purchase attempts
//! - Refund requests
//! - Change notifications
//!
//! Without an installed recorder these calls are no-ops. Hosts that want
//! Prometheus output install [`MetricsExporter`] once at startup.
//!
//! # Example
//!
//! ```rust,no_run
//! use purchase_state_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! // Hand the text to whatever serves /metrics.
//! let text = exporter.render().unwrap_or_default();
//! # let _ = text;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for the engine's metrics.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder globally.
    ///
    /// # Errors
    ///
    /// Returns error if the recorder cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests) this logs a
    /// warning and succeeds without a handle.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Catalog
    describe_histogram!(
        "store_catalog_fetch_duration_seconds",
        "Time taken by storefront product fetches"
    );
    describe_counter!(
        "store_catalog_refresh_failures_total",
        "Catalog refreshes that could not reach the storefront"
    );
    describe_gauge!("store_catalog_products", "Products in the current catalog");

    // Entitlements
    describe_gauge!("store_entitlements_owned", "Products currently owned");
    describe_counter!(
        "store_transactions_processed_total",
        "Verified transactions handed to the entitlement cache"
    );
    describe_counter!(
        "store_transactions_unverified_total",
        "Transactions dropped because they failed verification"
    );
    describe_counter!(
        "store_transactions_finish_failures_total",
        "Transactions the storefront failed to acknowledge"
    );
    describe_counter!(
        "store_entitlement_rebuild_failures_total",
        "Entitlement rebuilds abandoned on a stream error"
    );

    // Listener
    describe_counter!(
        "store_listener_reconnects_total",
        "Transaction stream resubscriptions"
    );
    describe_counter!(
        "store_listener_fatal_total",
        "Times the listener stopped on an unrecoverable error"
    );

    // Purchases
    describe_counter!("store_purchases_started_total", "Purchase attempts started");
    describe_counter!(
        "store_purchases_finished_total",
        "Purchase attempts finished, labelled by resulting state"
    );
    describe_counter!(
        "store_purchases_rejected_in_flight_total",
        "Purchases rejected because one was already in flight"
    );

    // Refunds
    describe_counter!("store_refunds_requested_total", "Refund requests started");
    describe_counter!("store_refunds_resolved_total", "Refund requests resolved");

    // Notifications
    describe_counter!(
        "store_notifications_published_total",
        "Change notifications published"
    );
    describe_counter!(
        "store_notifications_lagged_total",
        "Change notifications dropped by lagging subscribers"
    );
}

//! Promotional offer signing, delegated to the host application.
//!
//! Storefronts require purchases that redeem a promotional subscription offer
//! to carry a signature produced with keys only the host application (or its
//! server) holds. The engine never creates or inspects that signature; it
//! asks an injected [`OfferSigner`] for one right before submitting the
//! purchase.
//!
//! # Example
//!
//! ```
//! use purchase_state_core::offer::{FnOfferSigner, OfferSigner, PromotionalOfferSignature};
//! use std::sync::Arc;
//!
//! let signer: Arc<dyn OfferSigner> = Arc::new(FnOfferSigner::new(|product_id, offer_id| {
//!     Box::pin(async move {
//!         // Ask the app server to sign (product_id, offer_id)...
//!         let _ = (product_id, offer_id);
//!         Ok::<_, String>(Some(PromotionalOfferSignature::new(b"opaque".to_vec())))
//!     })
//! }));
//! # let _ = signer;
//! ```

use crate::ids::{OfferId, ProductId};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Opaque capability token produced by the host for one `(product, offer)`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionalOfferSignature(Vec<u8>);

impl PromotionalOfferSignature {
    /// Wrap the host-produced bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw bytes, for handing to the storefront.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PromotionalOfferSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PromotionalOfferSignature(<{} bytes>)", self.0.len())
    }
}

/// Future returned by [`OfferSigner::sign`].
///
/// `Ok(None)` means the host declined to sign; `Err` carries the host's
/// failure description.
pub type SignFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<PromotionalOfferSignature>, String>> + Send + 'a>>;

/// Host-supplied promotional offer signer.
///
/// Uses an explicit boxed future so the engine can hold it as
/// `Arc<dyn OfferSigner>`.
pub trait OfferSigner: Send + Sync {
    /// Sign a purchase of `product_id` redeeming `offer_id`.
    fn sign<'a>(&'a self, product_id: &'a ProductId, offer_id: &'a OfferId) -> SignFuture<'a>;
}

type SignFn = dyn Fn(ProductId, OfferId) -> SignFuture<'static> + Send + Sync;

/// [`OfferSigner`] backed by a closure.
pub struct FnOfferSigner {
    sign: Box<SignFn>,
}

impl FnOfferSigner {
    /// Wrap a closure returning a boxed future.
    #[must_use]
    pub fn new<F>(sign: F) -> Self
    where
        F: Fn(ProductId, OfferId) -> SignFuture<'static> + Send + Sync + 'static,
    {
        Self { sign: Box::new(sign) }
    }
}

impl OfferSigner for FnOfferSigner {
    fn sign<'a>(&'a self, product_id: &'a ProductId, offer_id: &'a OfferId) -> SignFuture<'a> {
        (self.sign)(product_id.clone(), offer_id.clone())
    }
}

impl std::fmt::Debug for FnOfferSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnOfferSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_signer_receives_ids() {
        let signer = FnOfferSigner::new(|product_id, offer_id| {
            Box::pin(async move {
                Ok::<_, String>(Some(PromotionalOfferSignature::new(
                    format!("{product_id}:{offer_id}").into_bytes(),
                )))
            })
        });

        let signature = tokio_test::block_on(
            signer.sign(&ProductId::new("sub1"), &OfferId::new("promo1")),
        );
        assert_eq!(
            signature,
            Ok(Some(PromotionalOfferSignature::new(b"sub1:promo1".to_vec())))
        );
    }

    #[test]
    fn debug_hides_bytes() {
        let sig = PromotionalOfferSignature::new(vec![1, 2, 3]);
        assert_eq!(format!("{sig:?}"), "PromotionalOfferSignature(<3 bytes>)");
    }
}

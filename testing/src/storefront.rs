//! In-memory storefront for tests.
//!
//! [`MockStorefront`] answers every [`Storefront`] call from scripted state
//! and records what the engine asked of it.

#![allow(clippy::missing_panics_doc)]

use futures::StreamExt;
use futures::stream;
use purchase_state_core::storefront::StorefrontFuture;
use purchase_state_core::{
    Product, ProductId, RefundOutcome, RefundOutcomeStream, Storefront, StorefrontError,
    StorefrontPurchaseResult, SubmitOptions, Transaction, TransactionId, TransactionStream,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

type StreamItem = Result<Transaction, StorefrontError>;

/// How the storefront's refund flow answers a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefundScript {
    /// Emit this outcome.
    Outcome(RefundOutcome),
    /// Emit a stream error.
    StreamError(StorefrontError),
    /// Fail to start the refund flow at all.
    StartError(StorefrontError),
    /// End the stream without an outcome.
    EndWithoutOutcome,
    /// Never answer.
    Hang,
}

/// Scriptable in-memory [`Storefront`].
///
/// Unscripted calls get harmless defaults: an empty catalog, a failed
/// purchase, an empty entitlement stream, a hanging refund flow and
/// `can_make_payments() == true`.
#[derive(Debug)]
pub struct MockStorefront {
    products: Mutex<Vec<Product>>,
    fetch_error: Mutex<Option<StorefrontError>>,
    fetch_calls: AtomicUsize,

    purchase_results: Mutex<HashMap<ProductId, StorefrontPurchaseResult>>,
    purchase_gate: watch::Sender<bool>,
    submissions: Mutex<Vec<(ProductId, SubmitOptions)>>,

    subscription_errors: Mutex<VecDeque<StorefrontError>>,
    live: Mutex<Option<mpsc::UnboundedSender<StreamItem>>>,
    backlog: Mutex<Vec<StreamItem>>,
    subscriptions: AtomicUsize,

    current: Mutex<Vec<StreamItem>>,
    current_error: Mutex<Option<StorefrontError>>,
    current_gate: watch::Sender<bool>,
    current_calls: AtomicUsize,

    refunds: Mutex<HashMap<TransactionId, RefundScript>>,
    refund_requests: AtomicUsize,

    can_make_payments: AtomicBool,
    can_make_payments_calls: AtomicUsize,
    finished: Mutex<Vec<TransactionId>>,
    finish_gate: watch::Sender<bool>,
    finish_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn pass(gate: &watch::Sender<bool>) -> Result<(), StorefrontError> {
    let mut gate = gate.subscribe();
    gate.wait_for(|open| *open)
        .await
        .map(|_| ())
        .map_err(|_| StorefrontError::Fatal("storefront dropped".to_string()))
}

impl Default for MockStorefront {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStorefront {
    /// A storefront with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        let (purchase_gate, _) = watch::channel(true);
        let (current_gate, _) = watch::channel(true);
        let (finish_gate, _) = watch::channel(true);
        Self {
            products: Mutex::new(Vec::new()),
            fetch_error: Mutex::new(None),
            fetch_calls: AtomicUsize::new(0),
            purchase_results: Mutex::new(HashMap::new()),
            purchase_gate,
            submissions: Mutex::new(Vec::new()),
            subscription_errors: Mutex::new(VecDeque::new()),
            live: Mutex::new(None),
            backlog: Mutex::new(Vec::new()),
            subscriptions: AtomicUsize::new(0),
            current: Mutex::new(Vec::new()),
            current_error: Mutex::new(None),
            current_gate,
            current_calls: AtomicUsize::new(0),
            refunds: Mutex::new(HashMap::new()),
            refund_requests: AtomicUsize::new(0),
            can_make_payments: AtomicBool::new(true),
            can_make_payments_calls: AtomicUsize::new(0),
            finished: Mutex::new(Vec::new()),
            finish_gate,
            finish_calls: AtomicUsize::new(0),
        }
    }

    // --- catalog ---

    /// Products `fetch_products` can return.
    pub fn set_products(&self, products: Vec<Product>) {
        *lock(&self.products) = products;
    }

    /// Make `fetch_products` fail (`Some`) or succeed again (`None`).
    pub fn set_fetch_error(&self, error: Option<StorefrontError>) {
        *lock(&self.fetch_error) = error;
    }

    /// Number of `fetch_products` calls.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    // --- purchases ---

    /// What `submit_purchase` answers for `product_id`.
    pub fn set_purchase_result(&self, product_id: impl Into<ProductId>, result: StorefrontPurchaseResult) {
        lock(&self.purchase_results).insert(product_id.into(), result);
    }

    /// Hold every `submit_purchase` call until [`MockStorefront::open_purchases`].
    pub fn hold_purchases(&self) {
        self.purchase_gate.send_replace(false);
    }

    /// Release held and future `submit_purchase` calls.
    pub fn open_purchases(&self) {
        self.purchase_gate.send_replace(true);
    }

    /// Every purchase submission received, in order.
    #[must_use]
    pub fn submissions(&self) -> Vec<(ProductId, SubmitOptions)> {
        lock(&self.submissions).clone()
    }

    // --- transaction stream ---

    /// Deliver a transaction on the live stream, or queue it for the next
    /// subscriber.
    pub fn push_transaction(&self, transaction: Transaction) {
        self.push(Ok(transaction));
    }

    /// Deliver a stream error on the live stream, or queue it.
    pub fn push_stream_error(&self, error: StorefrontError) {
        self.push(Err(error));
    }

    fn push(&self, item: StreamItem) {
        let mut live = lock(&self.live);
        let item = match live.as_ref() {
            Some(tx) => match tx.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => {
                    *live = None;
                    item
                }
            },
            None => item,
        };
        lock(&self.backlog).push(item);
    }

    /// End the live stream; the next subscriber gets a fresh one.
    pub fn end_stream(&self) {
        lock(&self.live).take();
    }

    /// Make the next `transaction_stream` calls fail, one error per call.
    pub fn fail_next_subscriptions(&self, errors: impl IntoIterator<Item = StorefrontError>) {
        lock(&self.subscription_errors).extend(errors);
    }

    /// Number of `transaction_stream` calls, failed ones included.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    // --- current entitlements ---

    /// Transactions `current_entitlements` streams.
    pub fn set_current_entitlements(&self, transactions: Vec<Transaction>) {
        *lock(&self.current) = transactions.into_iter().map(Ok).collect();
    }

    /// Append a stream error after the current entitlements.
    pub fn push_current_entitlements_error(&self, error: StorefrontError) {
        lock(&self.current).push(Err(error));
    }

    /// Make `current_entitlements` fail to start (`Some`) or succeed (`None`).
    pub fn set_current_entitlements_error(&self, error: Option<StorefrontError>) {
        *lock(&self.current_error) = error;
    }

    /// Hold every `current_entitlements` call, after it has read its answer,
    /// until [`MockStorefront::open_current_entitlements`].
    pub fn hold_current_entitlements(&self) {
        self.current_gate.send_replace(false);
    }

    /// Release held and future `current_entitlements` calls.
    pub fn open_current_entitlements(&self) {
        self.current_gate.send_replace(true);
    }

    /// Number of `current_entitlements` calls.
    #[must_use]
    pub fn current_entitlements_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }

    // --- refunds ---

    /// How the refund flow answers for `transaction_id`.
    pub fn set_refund_script(&self, transaction_id: impl Into<TransactionId>, script: RefundScript) {
        lock(&self.refunds).insert(transaction_id.into(), script);
    }

    /// Number of `request_refund` calls.
    #[must_use]
    pub fn refund_requests(&self) -> usize {
        self.refund_requests.load(Ordering::SeqCst)
    }

    // --- misc ---

    /// Answer for `can_make_payments`.
    pub fn set_can_make_payments(&self, allowed: bool) {
        self.can_make_payments.store(allowed, Ordering::SeqCst);
    }

    /// Number of `can_make_payments` calls.
    #[must_use]
    pub fn can_make_payments_calls(&self) -> usize {
        self.can_make_payments_calls.load(Ordering::SeqCst)
    }

    /// Transactions acknowledged with `finish_transaction`, in order.
    #[must_use]
    pub fn finished(&self) -> Vec<TransactionId> {
        lock(&self.finished).clone()
    }

    /// Hold every `finish_transaction` call until
    /// [`MockStorefront::open_finishes`].
    pub fn hold_finishes(&self) {
        self.finish_gate.send_replace(false);
    }

    /// Release held and future `finish_transaction` calls.
    pub fn open_finishes(&self) {
        self.finish_gate.send_replace(true);
    }

    /// Number of `finish_transaction` calls, held ones included.
    #[must_use]
    pub fn finish_calls(&self) -> usize {
        self.finish_calls.load(Ordering::SeqCst)
    }
}

impl Storefront for MockStorefront {
    // Returns every scripted product, requested or not.
    fn fetch_products<'a>(&'a self, _ids: &'a BTreeSet<ProductId>) -> StorefrontFuture<'a, Vec<Product>> {
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = lock(&self.fetch_error).clone() {
                return Err(error);
            }
            Ok(lock(&self.products).clone())
        })
    }

    fn submit_purchase<'a>(
        &'a self,
        product_id: &'a ProductId,
        options: SubmitOptions,
    ) -> StorefrontFuture<'a, StorefrontPurchaseResult> {
        Box::pin(async move {
            lock(&self.submissions).push((product_id.clone(), options));
            pass(&self.purchase_gate).await?;

            Ok(lock(&self.purchase_results)
                .get(product_id)
                .cloned()
                .unwrap_or_else(|| StorefrontPurchaseResult::Failed("no scripted result".to_string())))
        })
    }

    fn transaction_stream(&self) -> StorefrontFuture<'_, TransactionStream> {
        Box::pin(async move {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = lock(&self.subscription_errors).pop_front() {
                return Err(error);
            }

            let (tx, rx) = mpsc::unbounded_channel();
            {
                let mut live = lock(&self.live);
                for item in lock(&self.backlog).drain(..) {
                    let _ = tx.send(item);
                }
                *live = Some(tx);
            }

            let stream = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(stream.boxed())
        })
    }

    fn current_entitlements(&self) -> StorefrontFuture<'_, TransactionStream> {
        Box::pin(async move {
            self.current_calls.fetch_add(1, Ordering::SeqCst);
            let answer = match lock(&self.current_error).clone() {
                Some(error) => Err(error),
                None => Ok(lock(&self.current).clone()),
            };
            pass(&self.current_gate).await?;
            Ok(stream::iter(answer?).boxed())
        })
    }

    fn request_refund<'a>(
        &'a self,
        transaction_id: &'a TransactionId,
    ) -> StorefrontFuture<'a, RefundOutcomeStream> {
        Box::pin(async move {
            self.refund_requests.fetch_add(1, Ordering::SeqCst);
            let script = lock(&self.refunds)
                .get(transaction_id)
                .cloned()
                .unwrap_or(RefundScript::Hang);

            let outcomes: RefundOutcomeStream = match script {
                RefundScript::Outcome(outcome) => stream::iter([Ok(outcome)]).boxed(),
                RefundScript::StreamError(error) => stream::iter([Err(error)]).boxed(),
                RefundScript::StartError(error) => return Err(error),
                RefundScript::EndWithoutOutcome => stream::empty().boxed(),
                RefundScript::Hang => stream::pending().boxed(),
            };
            Ok(outcomes)
        })
    }

    fn can_make_payments(&self) -> StorefrontFuture<'_, bool> {
        Box::pin(async move {
            self.can_make_payments_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.can_make_payments.load(Ordering::SeqCst))
        })
    }

    fn finish_transaction<'a>(&'a self, transaction_id: &'a TransactionId) -> StorefrontFuture<'a, ()> {
        Box::pin(async move {
            self.finish_calls.fetch_add(1, Ordering::SeqCst);
            pass(&self.finish_gate).await?;
            lock(&self.finished).push(transaction_id.clone());
            Ok(())
        })
    }
}

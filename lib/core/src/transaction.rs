//! Per-context transactions.
//!
//! A transaction does not journal effects itself: each effect-producing
//! subject (a container, a storage layer, the filesystem) keeps its own
//! pending state and registers a single end-of-transaction callback through
//! [`Transaction::on_end`]. On commit the callbacks run in registration
//! order with `success = true`; on rollback with `success = false` so each
//! subject can discard what it buffered.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error};

use crate::context::Context;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    fn new() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("the transaction is read-only")]
    Readonly,
    #[error("a transaction is already attached to the context")]
    AlreadyAttached,
    #[error("the transaction is already finished")]
    Finished,
    #[error("another transaction is writing to the same value")]
    Concurrent,
}

/// A callback invoked exactly once when the transaction ends; the flag is
/// `true` on commit and `false` on rollback.
pub type OnEndCallback = Box<dyn FnOnce(bool) -> anyhow::Result<()> + Send>;

struct TxInner {
    status: TxStatus,
    // Registration order is the invocation order.
    callbacks: Vec<(u64, OnEndCallback)>,
    subjects: HashSet<u64>,
}

/// A context-bound journal of effects with commit/rollback.
pub struct Transaction {
    id: TransactionId,
    readonly: bool,
    inner: Mutex<TxInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("readonly", &self.readonly)
            .field("status", &self.status())
            .finish()
    }
}

impl Transaction {
    /// Starts a transaction and attaches it to `ctx`. Starting a second
    /// transaction on the same context fails.
    pub fn start(ctx: &Context, readonly: bool) -> Result<Arc<Self>, TxError> {
        let tx = Arc::new(Self {
            id: TransactionId::new(),
            readonly,
            inner: Mutex::new(TxInner {
                status: TxStatus::Active,
                callbacks: Vec::new(),
                subjects: HashSet::new(),
            }),
        });
        ctx.attach_transaction(tx.clone())?;
        debug!(id = %tx.id, readonly, "transaction started");
        Ok(tx)
    }

    /// Like [`Transaction::start`] with a wall-clock budget: if the
    /// transaction is still active after `timeout` it is rolled back.
    pub fn start_with_timeout(
        ctx: &Context,
        readonly: bool,
        timeout: Duration,
    ) -> Result<Arc<Self>, TxError> {
        let tx = Self::start(ctx, readonly)?;

        let weak_tx = Arc::downgrade(&tx);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = weak_tx.upgrade() {
                if tx.status() == TxStatus::Active {
                    debug!(id = %tx.id, "transaction timed out, rolling back");
                    let _ = tx.rollback(&ctx);
                }
            }
        });

        Ok(tx)
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn status(&self) -> TxStatus {
        self.inner.lock().unwrap().status
    }

    pub fn is_finished(&self) -> bool {
        self.status() != TxStatus::Active
    }

    /// Fails with [`TxError::Readonly`] when an effect-producing operation
    /// is attempted under a read-only transaction.
    pub fn assert_writable(&self) -> Result<(), TxError> {
        if self.readonly {
            Err(TxError::Readonly)
        } else {
            Ok(())
        }
    }

    /// Registers `callback` to run when the transaction ends. Registration
    /// is idempotent per subject: the first callback for a given subject id
    /// wins and later registrations are dropped.
    pub fn on_end(&self, subject: u64, callback: OnEndCallback) -> Result<(), TxError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != TxStatus::Active {
            return Err(TxError::Finished);
        }
        if !inner.subjects.insert(subject) {
            return Ok(());
        }
        inner.callbacks.push((subject, callback));
        Ok(())
    }

    pub fn commit(&self, ctx: &Context) -> Result<(), TxError> {
        ctx.detach_transaction(self.id);
        self.finish(TxStatus::Committed)
    }

    pub fn rollback(&self, ctx: &Context) -> Result<(), TxError> {
        ctx.detach_transaction(self.id);
        self.finish(TxStatus::RolledBack)
    }

    /// Rollback driven by context cancellation; the context is already
    /// tearing its own state down.
    pub(crate) fn rollback_detached(&self) {
        let _ = self.finish(TxStatus::RolledBack);
    }

    fn finish(&self, status: TxStatus) -> Result<(), TxError> {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status != TxStatus::Active {
                return Err(TxError::Finished);
            }
            inner.status = status;
            std::mem::take(&mut inner.callbacks)
        };

        let success = status == TxStatus::Committed;
        for (subject, callback) in callbacks {
            // End-of-transaction callbacks never re-raise.
            if let Err(err) = callback(success) {
                error!(id = %self.id, subject, %err, "transaction callback failed");
            }
        }

        debug!(id = %self.id, ?status, "transaction finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;
    use std::sync::atomic::AtomicUsize;

    fn test_ctx() -> Context {
        Context::new(ContextConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn nested_starts_fail() {
        let ctx = test_ctx();
        let _tx = Transaction::start(&ctx, false).unwrap();
        assert_eq!(
            Transaction::start(&ctx, false).map(|_| ()),
            Err(TxError::AlreadyAttached),
        );
    }

    #[tokio::test]
    async fn callbacks_fire_exactly_once_in_registration_order() {
        let ctx = test_ctx();
        let tx = Transaction::start(&ctx, false).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for subject in [1u64, 2, 3] {
            let order = order.clone();
            tx.on_end(
                subject,
                Box::new(move |success| {
                    order.lock().unwrap().push((subject, success));
                    Ok(())
                }),
            )
            .unwrap();
        }

        // Re-registering subject 2 is a no-op.
        tx.on_end(2, Box::new(|_| panic!("must not run"))).unwrap();

        tx.commit(&ctx).unwrap();
        assert_eq!(
            order.lock().unwrap().as_slice(),
            &[(1, true), (2, true), (3, true)],
        );

        assert_eq!(tx.commit(&ctx), Err(TxError::Finished));
        assert_eq!(tx.rollback(&ctx), Err(TxError::Finished));
    }

    #[tokio::test]
    async fn rollback_reports_failure_to_subjects() {
        let ctx = test_ctx();
        let tx = Transaction::start(&ctx, false).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        tx.on_end(
            7,
            Box::new(move |success| {
                *seen_clone.lock().unwrap() = Some(success);
                Ok(())
            }),
        )
        .unwrap();

        tx.rollback(&ctx).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn a_failing_callback_does_not_prevent_later_ones() {
        let ctx = test_ctx();
        let tx = Transaction::start(&ctx, false).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        tx.on_end(1, Box::new(|_| anyhow::bail!("subject one exploded")))
            .unwrap();
        let count_clone = count.clone();
        tx.on_end(
            2,
            Box::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

        tx.commit(&ctx).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_new_transaction_can_start_after_the_previous_one_ends() {
        let ctx = test_ctx();

        let tx = Transaction::start(&ctx, false).unwrap();
        tx.commit(&ctx).unwrap();

        let tx = Transaction::start(&ctx, true).unwrap();
        assert!(tx.is_readonly());
        assert_eq!(tx.assert_writable(), Err(TxError::Readonly));
        tx.rollback(&ctx).unwrap();
    }

    #[tokio::test]
    async fn cancelling_the_context_rolls_the_transaction_back() {
        let ctx = test_ctx();
        let tx = Transaction::start(&ctx, false).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        tx.on_end(
            1,
            Box::new(move |success| {
                *seen_clone.lock().unwrap() = Some(success);
                Ok(())
            }),
        )
        .unwrap();

        ctx.cancel();

        assert_eq!(tx.status(), TxStatus::RolledBack);
        assert_eq!(*seen.lock().unwrap(), Some(false));
    }
}

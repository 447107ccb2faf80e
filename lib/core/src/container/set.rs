//! The set container: unique elements, transactional writes.
//!
//! Writes made under a transaction are pending: only the writing
//! transaction observes them until commit. While one transaction has
//! pending writes, writers from other contexts wait for it to finish
//! (commit or rollback); transactionless readers see committed state only.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tracing::trace;

use crate::context::{Context, ContextId};
use crate::mutation::{
    CallbackHandle, Mutation, MutationCallbacks, MutationHandler, MutationPath,
    MutationWatchingConfig,
};
use crate::state::GlobalState;
use crate::transaction::{Transaction, TransactionId};
use crate::value::{SmartLock, SmartLockGuard, Value, ValueError};
use crate::RuntimeError;

#[derive(Debug)]
struct PendingTx {
    tx_id: TransactionId,
    inclusions: BTreeMap<String, Value>,
    removals: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct SetInner {
    /// Committed elements, keyed by their canonical element key.
    elements: Mutex<BTreeMap<String, Value>>,
    /// Pending view of the single transaction currently writing, if any.
    pending: Mutex<Option<PendingTx>>,
    tx_released: Notify,
    watchers: MutationCallbacks,
    lock: SmartLock,
    sharer: RwLock<Option<ContextId>>,
    url: Mutex<Option<String>>,
    persisted: bool,
}

/// The transactional container. Cloning is cheap; clones refer to the same
/// set.
#[derive(Clone, Debug, Default)]
pub struct Set {
    inner: Arc<SetInner>,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    /// A persisted set must expose a URL before it can be shared.
    pub fn new_persisted(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SetInner {
                url: Mutex::new(Some(url.into())),
                persisted: true,
                ..Default::default()
            }),
        }
    }

    pub fn same_identity(&self, other: &Set) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn url(&self) -> Option<String> {
        self.inner.url.lock().unwrap().clone()
    }

    pub fn is_persisted(&self) -> bool {
        self.inner.persisted
    }

    /// Number of committed elements.
    pub fn len(&self) -> usize {
        self.inner.elements.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.elements.lock().unwrap().is_empty()
    }

    /// Whether the set contains `value`, as seen from `ctx`: a context
    /// attached to the transaction with pending writes sees them, everyone
    /// else sees committed state only.
    pub fn has(&self, ctx: &Context, value: &Value) -> Result<bool, RuntimeError> {
        let key = value.element_key()?;

        if let Some(tx) = ctx.transaction() {
            let pending = self.inner.pending.lock().unwrap();
            if let Some(pending) = pending.as_ref().filter(|p| p.tx_id == tx.id()) {
                if pending.removals.contains(&key) {
                    return Ok(false);
                }
                if pending.inclusions.contains_key(&key) {
                    return Ok(true);
                }
            }
        }

        Ok(self.inner.elements.lock().unwrap().contains_key(&key))
    }

    /// Adds `value`. Under a transaction the element stays pending until
    /// commit; without one it is applied immediately (after waiting out any
    /// transaction currently writing).
    pub async fn add(&self, ctx: &Context, value: Value) -> Result<(), RuntimeError> {
        value.check_serializable()?;
        let key = value.element_key()?;

        match ctx.transaction() {
            Some(tx) => {
                tx.assert_writable()?;
                self.with_pending(ctx, &tx, |pending| {
                    pending.removals.remove(&key);
                    pending.inclusions.insert(key.clone(), value.clone());
                })
                .await
            }
            None => {
                self.wait_for_no_pending_tx(ctx).await?;
                let _guard = self.lock_if_shared(ctx);
                let previous = self
                    .inner
                    .elements
                    .lock()
                    .unwrap()
                    .insert(key.clone(), value.clone());
                let mutation = match previous {
                    None => Mutation::add_entry(&key, value),
                    Some(previous) => Mutation::update_entry(&key, previous, value),
                };
                self.inner.watchers.emit(ctx, &mutation);
                Ok(())
            }
        }
    }

    /// Removes `value`, with the same transactional semantics as
    /// [`Set::add`].
    pub async fn remove(&self, ctx: &Context, value: &Value) -> Result<(), RuntimeError> {
        let key = value.element_key()?;

        match ctx.transaction() {
            Some(tx) => {
                tx.assert_writable()?;
                self.with_pending(ctx, &tx, |pending| {
                    pending.inclusions.remove(&key);
                    pending.removals.insert(key.clone());
                })
                .await
            }
            None => {
                self.wait_for_no_pending_tx(ctx).await?;
                let _guard = self.lock_if_shared(ctx);
                let removed = self.inner.elements.lock().unwrap().remove(&key);
                if removed.is_some() {
                    self.inner
                        .watchers
                        .emit(ctx, &Mutation::unspecified(MutationPath::of_key(&key)));
                }
                Ok(())
            }
        }
    }

    /// Runs `edit` on the pending view of `tx`, installing it first if this
    /// is the transaction's first write to this set. Waits while another
    /// transaction is writing.
    async fn with_pending(
        &self,
        ctx: &Context,
        tx: &Arc<Transaction>,
        edit: impl FnOnce(&mut PendingTx),
    ) -> Result<(), RuntimeError> {
        let mut edit = Some(edit);
        loop {
            // Create the wakeup future before inspecting the state, so a
            // release happening in between is not missed.
            let released = self.inner.tx_released.notified();
            {
                let mut pending = self.inner.pending.lock().unwrap();
                match pending.as_mut() {
                    None => {
                        let mut fresh = PendingTx {
                            tx_id: tx.id(),
                            inclusions: BTreeMap::new(),
                            removals: BTreeSet::new(),
                        };
                        (edit.take().expect("single edit"))(&mut fresh);
                        *pending = Some(fresh);
                        drop(pending);

                        if let Err(err) = self.register_flush(ctx, tx) {
                            *self.inner.pending.lock().unwrap() = None;
                            self.inner.tx_released.notify_waiters();
                            return Err(err);
                        }
                        return Ok(());
                    }
                    Some(pending) if pending.tx_id == tx.id() => {
                        (edit.take().expect("single edit"))(pending);
                        return Ok(());
                    }
                    Some(other) => {
                        trace!(waiting_on = %other.tx_id, "set is written by another transaction");
                    }
                }
            }
            self.wait_released(ctx, released).await?;
        }
    }

    /// Registers the end-of-transaction callback that applies (on commit)
    /// or discards (on rollback) this set's pending writes.
    fn register_flush(&self, ctx: &Context, tx: &Arc<Transaction>) -> Result<(), RuntimeError> {
        let inner = self.inner.clone();
        let ctx = ctx.clone();
        let subject = Arc::as_ptr(&self.inner) as usize as u64;

        tx.on_end(
            subject,
            Box::new(move |success| {
                let taken = inner.pending.lock().unwrap().take();
                let Some(pending) = taken else {
                    return Ok(());
                };

                if success {
                    let mut mutations = Vec::new();
                    {
                        let mut elements = inner.elements.lock().unwrap();
                        for (key, value) in pending.inclusions {
                            let previous = elements.insert(key.clone(), value.clone());
                            mutations.push(match previous {
                                None => Mutation::add_entry(&key, value),
                                Some(previous) => Mutation::update_entry(&key, previous, value),
                            });
                        }
                        for key in pending.removals {
                            if elements.remove(&key).is_some() {
                                mutations
                                    .push(Mutation::unspecified(MutationPath::of_key(&key)));
                            }
                        }
                    }
                    for mutation in &mutations {
                        inner.watchers.emit(&ctx, mutation);
                    }
                }

                inner.tx_released.notify_waiters();
                Ok(())
            }),
        )?;
        Ok(())
    }

    async fn wait_for_no_pending_tx(&self, ctx: &Context) -> Result<(), RuntimeError> {
        loop {
            let released = self.inner.tx_released.notified();
            if self.inner.pending.lock().unwrap().is_none() {
                return Ok(());
            }
            self.wait_released(ctx, released).await?;
        }
    }

    async fn wait_released(
        &self,
        ctx: &Context,
        released: tokio::sync::futures::Notified<'_>,
    ) -> Result<(), RuntimeError> {
        ctx.check_alive()?;
        tokio::select! {
            biased;
            cause = ctx.done() => Err(cause.into()),
            _ = released => Ok(()),
        }
    }

    pub fn on_mutation(
        &self,
        _ctx: &Context,
        handler: MutationHandler,
        config: MutationWatchingConfig,
    ) -> CallbackHandle {
        self.inner.watchers.add(handler, config)
    }

    pub fn remove_mutation_callback(&self, _ctx: &Context, handle: CallbackHandle) {
        self.inner.watchers.remove(handle);
    }

    /// Marks the set as shared with `state`'s context. A persisted set
    /// without a URL cannot be shared: identity is required once a value is
    /// both persisted and shared.
    pub fn share(&self, state: &Arc<GlobalState>) -> Result<(), ValueError> {
        if self.inner.persisted && self.inner.url.lock().unwrap().is_none() {
            return Err(ValueError::MissingUrl);
        }
        let mut sharer = self.inner.sharer.write().unwrap();
        if sharer.is_none() {
            *sharer = Some(state.id());
        }
        Ok(())
    }

    pub fn is_shared(&self) -> bool {
        self.inner.sharer.read().unwrap().is_some()
    }

    fn lock_if_shared<'a>(&'a self, ctx: &'a Context) -> Option<SmartLockGuard<'a>> {
        self.is_shared()
            .then(|| SmartLockGuard::acquire(&self.inner.lock, ctx))
    }
}

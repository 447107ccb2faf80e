//! The context tree.
//!
//! A context is a cancellable scope carrying permissions, limits, a
//! filesystem handle, an optional transaction and a link to its parent.
//! Cancelling a context cancels all of its descendants, rolls back its
//! transaction and trips the filesystem interrupt handle.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace};

use rill_vfs::{FileSystem, Interrupt};

use crate::limits::{CpuActiveGuard, CpuBudget, Limit, LimitError, Limiter};
use crate::pattern::Host;
use crate::permissions::{NotAllowedError, Permission};
use crate::state::GlobalState;
use crate::transaction::{Transaction, TransactionId, TxError};
use crate::value::Value;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Interval at which the CPU-time decrementer charges the budget.
const CPU_DECREMENTATION_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn new() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

impl std::fmt::Debug for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context was canceled")]
    Canceled,
    #[error("context deadline was exceeded")]
    DeadlineExceeded,
    #[error("permission not granted to the parent context: {permission}")]
    PermissionEscalation { permission: String },
    #[error(transparent)]
    Limit(#[from] LimitError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContextStatus {
    Active,
    Canceled,
    DeadlineExceeded,
}

/// Configuration for [`Context::new`] and [`Context::child`].
#[derive(Default)]
pub struct ContextConfig {
    pub permissions: Vec<Permission>,
    pub forbidden_permissions: Vec<Permission>,
    pub limits: Vec<Limit>,
    pub filesystem: Option<Arc<dyn FileSystem>>,
    /// Wall-clock deadline; crossing it cancels the context with
    /// [`ContextError::DeadlineExceeded`].
    pub deadline: Option<Duration>,
}

pub(crate) struct ContextState {
    id: ContextId,
    parent: Option<Weak<ContextState>>,
    granted: Vec<Permission>,
    forbidden: Vec<Permission>,
    limiter: Arc<Limiter>,
    fs: Option<Arc<dyn FileSystem>>,
    interrupt: Interrupt,
    status_tx: watch::Sender<ContextStatus>,
    // Even though unused, without this receiver a status sent before any
    // subscriber would be lost.
    #[allow(dead_code)]
    status_rx: watch::Receiver<ContextStatus>,
    children: Mutex<Vec<Weak<ContextState>>>,
    transaction: Mutex<Option<Arc<Transaction>>>,
    global_state: Mutex<Weak<GlobalState>>,
    host_resolutions: RwLock<HashMap<Host, Value>>,
    owned_databases: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    done_microtasks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    long_lived: AtomicBool,
}

/// Cancellable scope carrying permissions, limits, filesystem and
/// transaction. Cloning is cheap and refers to the same context.
#[derive(Clone)]
pub struct Context {
    state: Arc<ContextState>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.state.id)
            .field("done", &self.is_done())
            .field("permissions", &self.state.granted.len())
            .finish()
    }
}

impl Context {
    pub fn new(config: ContextConfig) -> Result<Self, ContextError> {
        Self::build(config, None, false)
    }

    /// Creates a child context. The child's granted permissions must be a
    /// subset of this context's effective permissions; limits are shared by
    /// reference; parent cancellation propagates to the child.
    pub fn child(&self, config: ContextConfig) -> Result<Self, ContextError> {
        Self::build(config, Some(self), false)
    }

    /// Creates a child with the same permissions and limits as this
    /// context. Its own cancellation is independent, but it still dies with
    /// this context.
    pub fn bound_child(&self) -> Result<Self, ContextError> {
        let config = ContextConfig {
            permissions: self.state.granted.clone(),
            forbidden_permissions: self.state.forbidden.clone(),
            ..Default::default()
        };
        Self::build(config, Some(self), true)
    }

    fn build(
        config: ContextConfig,
        parent: Option<&Context>,
        bound: bool,
    ) -> Result<Self, ContextError> {
        let mut forbidden = config.forbidden_permissions;

        let limiter = match parent {
            Some(parent) => {
                if !bound {
                    for permission in &config.permissions {
                        if !parent.has_permission(permission) {
                            return Err(ContextError::PermissionEscalation {
                                permission: permission.to_string(),
                            });
                        }
                    }
                }
                for inherited in &parent.state.forbidden {
                    if !forbidden.contains(inherited) {
                        forbidden.push(inherited.clone());
                    }
                }
                parent.state.limiter.child(config.limits)?
            }
            None => Limiter::new(config.limits),
        };

        let fs = config
            .filesystem
            .or_else(|| parent.and_then(|p| p.state.fs.clone()));

        let (status_tx, status_rx) = watch::channel(ContextStatus::Active);

        let state = Arc::new(ContextState {
            id: ContextId::new(),
            parent: parent.map(|p| Arc::downgrade(&p.state)),
            granted: config.permissions,
            forbidden,
            limiter,
            fs,
            interrupt: Interrupt::new(),
            status_tx,
            status_rx,
            children: Mutex::new(Vec::new()),
            transaction: Mutex::new(None),
            global_state: Mutex::new(Weak::new()),
            host_resolutions: RwLock::new(HashMap::new()),
            owned_databases: Mutex::new(HashMap::new()),
            done_microtasks: Mutex::new(Vec::new()),
            long_lived: AtomicBool::new(false),
        });

        let ctx = Context { state };

        if let Some(parent) = parent {
            if parent.is_done() {
                ctx.cancel_with(ContextStatus::Canceled);
                return Ok(ctx);
            }
            parent
                .state
                .children
                .lock()
                .unwrap()
                .push(Arc::downgrade(&ctx.state));
        }

        ctx.spawn_watchdogs(config.deadline);
        trace!(id = %ctx.state.id, parent = ?parent.map(|p| p.state.id), "context created");
        Ok(ctx)
    }

    /// Starts the deadline timer and the CPU-time decrementer, when this
    /// context declared either. Outside a tokio runtime the watchdogs are
    /// skipped; a context is then purely manual.
    fn spawn_watchdogs(&self, deadline: Option<Duration>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        if let Some(deadline) = deadline {
            let weak = Arc::downgrade(&self.state);
            handle.spawn(async move {
                tokio::time::sleep(deadline).await;
                if let Some(state) = weak.upgrade() {
                    Context { state }.cancel_with(ContextStatus::DeadlineExceeded);
                }
            });
        }

        if let Some(total_time) = self.state.limiter.own_total_time() {
            let weak = Arc::downgrade(&self.state);
            handle.spawn(async move {
                tokio::time::sleep(total_time).await;
                if let Some(state) = weak.upgrade() {
                    Context { state }.cancel_with(ContextStatus::Canceled);
                }
            });
        }

        if let Some(cpu) = self.state.limiter.own_cpu_budget() {
            let weak = Arc::downgrade(&self.state);
            handle.spawn(Self::run_cpu_decrementer(weak, cpu));
        }
    }

    /// Charges wall-time × active-lthread-count against the CPU budget and
    /// cancels the context once the budget is spent.
    async fn run_cpu_decrementer(weak: Weak<ContextState>, cpu: Arc<CpuBudget>) {
        let mut interval = tokio::time::interval(CPU_DECREMENTATION_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_tick = tokio::time::Instant::now();

        loop {
            let now = interval.tick().await;
            let elapsed = now.duration_since(last_tick);
            last_tick = now;

            let Some(state) = weak.upgrade() else {
                return;
            };
            let ctx = Context { state };
            if ctx.is_done() || ctx.state.limiter.decrementer_stopped() {
                return;
            }

            if cpu.charge(elapsed) {
                debug!(id = %ctx.state.id, "CPU-time budget exhausted");
                ctx.cancel_with(ContextStatus::Canceled);
                return;
            }
        }
    }

    pub fn id(&self) -> ContextId {
        self.state.id
    }

    pub fn parent(&self) -> Option<Context> {
        let parent = self.state.parent.as_ref()?.upgrade()?;
        Some(Context { state: parent })
    }

    // ---- permissions -------------------------------------------------

    pub fn granted_permissions(&self) -> &[Permission] {
        &self.state.granted
    }

    /// Whether the context holds a permission including `permission`.
    /// The forbidden set wins over grants.
    pub fn has_permission(&self, permission: &Permission) -> bool {
        if self
            .state
            .forbidden
            .iter()
            .any(|forbidden| forbidden.includes(permission))
        {
            return false;
        }
        self.state
            .granted
            .iter()
            .any(|granted| granted.includes(permission))
    }

    /// Erroring form of [`Context::has_permission`].
    pub fn require_permission(&self, permission: &Permission) -> Result<(), NotAllowedError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(NotAllowedError::new(permission.clone()))
        }
    }

    /// Returns a new child context whose granted set is the current granted
    /// set minus the permissions included by `dropped`. The current context
    /// is never mutated; children already created keep what they hold.
    pub fn drop_permissions(&self, dropped: &[Permission]) -> Result<Context, ContextError> {
        let remaining: Vec<Permission> = self
            .state
            .granted
            .iter()
            .filter(|granted| !dropped.iter().any(|d| d.includes(granted)))
            .cloned()
            .collect();

        self.child(ContextConfig {
            permissions: remaining,
            ..Default::default()
        })
    }

    // ---- limits ------------------------------------------------------

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.state.limiter
    }

    /// Takes `n` units from the limit `name`, waiting cooperatively for
    /// rate limits. Fails immediately when the context is cancelled, also
    /// while waiting.
    pub async fn take(&self, name: &str, n: i64) -> Result<(), crate::RuntimeError> {
        self.check_alive()?;
        tokio::select! {
            biased;
            cause = self.done() => Err(cause.into()),
            res = self.state.limiter.take(name, n) => Ok(res?),
        }
    }

    pub fn give(&self, name: &str, n: i64) -> Result<(), LimitError> {
        self.state.limiter.give(name, n)
    }

    pub fn time_budget_remaining(&self, name: &str) -> Option<Duration> {
        self.state.limiter.time_budget_remaining(name)
    }

    pub fn cpu_budget(&self) -> Option<Arc<CpuBudget>> {
        self.state.limiter.cpu_budget()
    }

    /// Marks the calling task as actively consuming this context's CPU
    /// budget until the guard is dropped. Without a budget this is `None`
    /// and execution is unmetered.
    pub fn enter_cpu_active(&self) -> Option<CpuActiveGuard> {
        self.cpu_budget().map(|cpu| cpu.enter_active())
    }

    /// Freezes the CPU-time decrementer (both watchdog ticks and active
    /// charging).
    pub fn pause_cpu_time_decrementation(&self) {
        if let Some(cpu) = self.cpu_budget() {
            cpu.pause();
        }
    }

    pub fn resume_cpu_time_decrementation(&self) {
        if let Some(cpu) = self.cpu_budget() {
            cpu.resume();
        }
    }

    // ---- cancellation ------------------------------------------------

    pub fn is_done(&self) -> bool {
        *self.state.status_tx.borrow() != ContextStatus::Active
    }

    /// The cancellation cause, set once the context is done.
    pub fn err(&self) -> Option<ContextError> {
        match *self.state.status_tx.borrow() {
            ContextStatus::Active => None,
            ContextStatus::Canceled => Some(ContextError::Canceled),
            ContextStatus::DeadlineExceeded => Some(ContextError::DeadlineExceeded),
        }
    }

    /// Fails with the cancellation cause when the context is done.
    pub fn check_alive(&self) -> Result<(), ContextError> {
        match self.err() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Resolves once the context is cancelled, with the cause.
    pub async fn done(&self) -> ContextError {
        let mut receiver = self.state.status_tx.subscribe();
        loop {
            let status = *receiver.borrow_and_update();
            match status {
                ContextStatus::Active => {}
                ContextStatus::Canceled => return ContextError::Canceled,
                ContextStatus::DeadlineExceeded => return ContextError::DeadlineExceeded,
            }
            // The sender lives in `self`, so `changed` cannot fail.
            if receiver.changed().await.is_err() {
                return ContextError::Canceled;
            }
        }
    }

    /// Cancels the context and all of its descendants. Non-blocking; no
    /// teardown callbacks run.
    pub fn cancel(&self) {
        self.cancel_with(ContextStatus::Canceled);
    }

    /// Runs the registered end-of-context microtasks, then cancels.
    pub fn cancel_gracefully(&self) {
        let microtasks = std::mem::take(&mut *self.state.done_microtasks.lock().unwrap());
        for microtask in microtasks {
            microtask();
        }
        self.cancel();
    }

    fn cancel_with(&self, status: ContextStatus) {
        let mut was_active = false;
        self.state.status_tx.send_modify(|current| {
            if *current == ContextStatus::Active {
                *current = status;
                was_active = true;
            }
        });
        if !was_active {
            return;
        }

        debug!(id = %self.state.id, ?status, "context cancelled");
        self.state.interrupt.trip();
        self.state.limiter.mark_decrementer_stopped();

        if let Some(tx) = self.state.transaction.lock().unwrap().take() {
            tx.rollback_detached();
        }

        let children = std::mem::take(&mut *self.state.children.lock().unwrap());
        for child in children {
            if let Some(child) = child.upgrade() {
                Context { state: child }.cancel_with(ContextStatus::Canceled);
            }
        }
    }

    /// Registers a teardown callback run by [`Context::cancel_gracefully`].
    pub fn on_done(&self, microtask: impl FnOnce() + Send + 'static) {
        self.state
            .done_microtasks
            .lock()
            .unwrap()
            .push(Box::new(microtask));
    }

    /// Cancellation-aware sleep. Sleeping charges no CPU time.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.check_alive()?;
        tokio::select! {
            biased;
            cause = self.done() => Err(cause),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Opts the context out of aggressive cleanup performed on
    /// short-lived module executions.
    pub fn promote_to_long_lived(&self) {
        self.state.long_lived.store(true, Ordering::Release);
    }

    pub fn is_long_lived(&self) -> bool {
        self.state.long_lived.load(Ordering::Acquire)
    }

    // ---- filesystem --------------------------------------------------

    pub fn filesystem(&self) -> Option<Arc<dyn FileSystem>> {
        self.state.fs.clone()
    }

    /// The interrupt handle wired to this context's cancellation; handed to
    /// filesystem walks.
    pub fn interrupt(&self) -> Interrupt {
        self.state.interrupt.clone()
    }

    // ---- transaction -------------------------------------------------

    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.state.transaction.lock().unwrap().clone()
    }

    pub(crate) fn attach_transaction(&self, tx: Arc<Transaction>) -> Result<(), TxError> {
        let mut slot = self.state.transaction.lock().unwrap();
        if slot.is_some() {
            return Err(TxError::AlreadyAttached);
        }
        *slot = Some(tx);
        Ok(())
    }

    pub(crate) fn detach_transaction(&self, id: TransactionId) {
        let mut slot = self.state.transaction.lock().unwrap();
        if slot.as_ref().map(|tx| tx.id()) == Some(id) {
            *slot = None;
        }
    }

    // ---- evaluator state ---------------------------------------------

    pub(crate) fn set_global_state(&self, state: &Arc<GlobalState>) {
        *self.state.global_state.lock().unwrap() = Arc::downgrade(state);
    }

    /// The state attached to this context, or to the closest ancestor that
    /// has one.
    pub fn get_closest_state(&self) -> Option<Arc<GlobalState>> {
        if let Some(state) = self.state.global_state.lock().unwrap().upgrade() {
            return Some(state);
        }
        self.parent()?.get_closest_state()
    }

    // ---- host resolutions & databases --------------------------------

    /// Records what a host points to (its resolution data).
    pub fn add_host_resolution(&self, host: Host, data: Value) {
        self.state.host_resolutions.write().unwrap().insert(host, data);
    }

    pub fn host_resolution(&self, host: &Host) -> Option<Value> {
        self.state.host_resolutions.read().unwrap().get(host).cloned()
    }

    /// Registers a database owned by this context under `name`.
    pub fn set_database(&self, name: impl Into<String>, db: Arc<dyn Any + Send + Sync>) {
        self.state.owned_databases.lock().unwrap().insert(name.into(), db);
    }

    pub fn database(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.state.owned_databases.lock().unwrap().get(name).cloned()
    }
}

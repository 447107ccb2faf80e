//! The limit/quota engine.
//!
//! Rate limits (bytes per second, operations per second) are token buckets
//! refilled continuously; total limits are plain counters. A child context
//! shares its parent's limit state by reference: taking from the child and
//! taking from the parent drain the same bucket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

pub const FS_READ_LIMIT_NAME: &str = "fs/read";
pub const FS_WRITE_LIMIT_NAME: &str = "fs/write";
pub const FS_NEW_FILE_RATE_LIMIT_NAME: &str = "fs/new-file";
pub const FS_TOTAL_NEW_FILE_LIMIT_NAME: &str = "fs/total-new-file";
pub const HTTP_REQUEST_RATE_LIMIT_NAME: &str = "http/request";
pub const WS_SIMUL_CONN_TOTAL_LIMIT_NAME: &str = "ws/simul-connection-total";
pub const TCP_SIMUL_CONN_TOTAL_LIMIT_NAME: &str = "tcp/simul-connection-total";
pub const OBJECT_STORAGE_REQUEST_RATE_LIMIT_NAME: &str = "object-storage/request";
pub const THREADS_SIMUL_INSTANCES_LIMIT_NAME: &str = "threads/simul-instances";
pub const EXECUTION_CPU_TIME_LIMIT_NAME: &str = "execution/cpu-time";
pub const EXECUTION_TOTAL_TIME_LIMIT_NAME: &str = "execution/total-time";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitKind {
    /// Bytes per second.
    ByteRate,
    /// Operations per second.
    SimpleRate,
    /// Absolute cap over the lifetime of the context.
    Total,
}

/// A named quota attached to a context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limit {
    pub name: String,
    pub kind: LimitKind,
    pub value: i64,
}

impl Limit {
    pub fn byte_rate(name: impl Into<String>, bytes_per_sec: i64) -> Self {
        Self {
            name: name.into(),
            kind: LimitKind::ByteRate,
            value: bytes_per_sec,
        }
    }

    pub fn simple_rate(name: impl Into<String>, ops_per_sec: i64) -> Self {
        Self {
            name: name.into(),
            kind: LimitKind::SimpleRate,
            value: ops_per_sec,
        }
    }

    pub fn total(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            kind: LimitKind::Total,
            value,
        }
    }

    /// CPU-time budget; stored in nanoseconds as a total limit.
    pub fn cpu_time(budget: Duration) -> Self {
        Self::total(EXECUTION_CPU_TIME_LIMIT_NAME, budget.as_nanos() as i64)
    }

    /// Wall-clock budget; stored in nanoseconds as a total limit.
    pub fn total_time(budget: Duration) -> Self {
        Self::total(EXECUTION_TOTAL_TIME_LIMIT_NAME, budget.as_nanos() as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("cannot allocate {requested} for limit '{name}': limit is exhausted")]
    Exceeded { name: String, requested: i64 },
    #[error("limit '{name}' does not exist in this context")]
    Unknown { name: String },
    #[error("limit '{name}' has kind {expected:?}, got {actual:?}")]
    KindMismatch {
        name: String,
        expected: LimitKind,
        actual: LimitKind,
    },
    #[error("limit '{name}' of a child context cannot be higher than the parent's ({max})")]
    HigherThanParent { name: String, max: i64 },
}

struct LimitRegistry {
    kinds: HashMap<&'static str, LimitKind>,
    ready: bool,
}

static LIMIT_REGISTRY: Lazy<RwLock<LimitRegistry>> = Lazy::new(|| {
    let mut kinds = HashMap::new();
    kinds.insert(FS_READ_LIMIT_NAME, LimitKind::ByteRate);
    kinds.insert(FS_WRITE_LIMIT_NAME, LimitKind::ByteRate);
    kinds.insert(FS_NEW_FILE_RATE_LIMIT_NAME, LimitKind::SimpleRate);
    kinds.insert(FS_TOTAL_NEW_FILE_LIMIT_NAME, LimitKind::Total);
    kinds.insert(HTTP_REQUEST_RATE_LIMIT_NAME, LimitKind::SimpleRate);
    kinds.insert(WS_SIMUL_CONN_TOTAL_LIMIT_NAME, LimitKind::Total);
    kinds.insert(TCP_SIMUL_CONN_TOTAL_LIMIT_NAME, LimitKind::Total);
    kinds.insert(OBJECT_STORAGE_REQUEST_RATE_LIMIT_NAME, LimitKind::SimpleRate);
    kinds.insert(THREADS_SIMUL_INSTANCES_LIMIT_NAME, LimitKind::Total);
    kinds.insert(EXECUTION_CPU_TIME_LIMIT_NAME, LimitKind::Total);
    kinds.insert(EXECUTION_TOTAL_TIME_LIMIT_NAME, LimitKind::Total);
    RwLock::new(LimitRegistry { kinds, ready: false })
});

/// Registers a limit name. Must be called during process initialization,
/// before [`mark_limit_registry_ready`].
///
/// # Panics
///
/// Panics if the registry has already been marked ready.
pub fn register_limit(name: &'static str, kind: LimitKind) {
    let mut registry = LIMIT_REGISTRY.write().unwrap();
    assert!(
        !registry.ready,
        "limit registration after the registry was marked ready",
    );
    registry.kinds.insert(name, kind);
}

/// Freezes the limit registry; called once at the end of process
/// initialization.
pub fn mark_limit_registry_ready() {
    LIMIT_REGISTRY.write().unwrap().ready = true;
}

/// Builds a [`Limit`] for a registered name, validating the kind.
pub fn get_limit(name: &str, value: i64) -> Result<Limit, LimitError> {
    let registry = LIMIT_REGISTRY.read().unwrap();
    let kind = registry
        .kinds
        .get(name)
        .copied()
        .ok_or_else(|| LimitError::Unknown { name: name.into() })?;
    Ok(Limit {
        name: name.into(),
        kind,
        value,
    })
}

/// A token bucket: capacity = limit value, refilled continuously at
/// `value` tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: i64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: i64) -> Self {
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    fn refill(state: &mut BucketState, capacity: i64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed.as_secs_f64() * capacity as f64)
            .min(capacity as f64);
    }

    /// Takes `n` tokens without waiting; returns the missing amount's wait
    /// duration when the bucket cannot satisfy the request yet.
    fn try_take(&self, n: i64) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap();
        Self::refill(&mut state, self.capacity);

        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            return Ok(());
        }

        let missing = n as f64 - state.tokens;
        Err(Duration::from_secs_f64(missing / self.capacity as f64))
    }

    /// Takes `n` tokens, cooperatively waiting for the bucket to refill.
    pub async fn take(&self, n: i64) {
        loop {
            match self.try_take(n) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

/// A total limit: a remaining amount that can only shrink, except through
/// [`TotalLimit::give`].
#[derive(Debug)]
pub struct TotalLimit {
    remaining: AtomicI64,
}

impl TotalLimit {
    fn new(value: i64) -> Self {
        Self {
            remaining: AtomicI64::new(value),
        }
    }

    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn take(&self, name: &str, n: i64) -> Result<(), LimitError> {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current < n {
                return Err(LimitError::Exceeded {
                    name: name.into(),
                    requested: n,
                });
            }
            match self.remaining.compare_exchange(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn give(&self, n: i64) {
        self.remaining.fetch_add(n, Ordering::AcqRel);
    }
}

/// CPU-time budget of a context, shared by all of its lthreads.
///
/// A background decrementer charges elapsed wall-time multiplied by the
/// number of currently active lthreads: two equally busy lthreads drain the
/// budget twice as fast. Sleeping, waiting on a foreign lock, waiting on an
/// lthread result and the pause after a yield all leave the active count.
#[derive(Debug)]
pub struct CpuBudget {
    remaining_nanos: AtomicI64,
    active: AtomicU32,
    pause_depth: AtomicU32,
}

impl CpuBudget {
    fn new(budget_nanos: i64) -> Self {
        Self {
            remaining_nanos: AtomicI64::new(budget_nanos),
            active: AtomicU32::new(0),
            pause_depth: AtomicU32::new(0),
        }
    }

    pub fn remaining(&self) -> Duration {
        Duration::from_nanos(self.remaining_nanos.load(Ordering::Acquire).max(0) as u64)
    }

    pub fn pause(&self) {
        self.pause_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn resume(&self) {
        self.pause_depth.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_paused(&self) -> bool {
        self.pause_depth.load(Ordering::Acquire) > 0
    }

    pub fn active_count(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the calling task as actively spending CPU until the guard is
    /// dropped.
    pub fn enter_active(self: &Arc<Self>) -> CpuActiveGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        CpuActiveGuard {
            budget: self.clone(),
        }
    }

    /// Charges `elapsed` wall-time against the budget; returns `true` once
    /// the budget is exhausted.
    pub fn charge(&self, elapsed: Duration) -> bool {
        if self.is_paused() {
            return false;
        }
        let active = self.active.load(Ordering::Acquire) as i64;
        if active == 0 {
            return false;
        }
        let cost = elapsed.as_nanos() as i64 * active;
        self.remaining_nanos.fetch_sub(cost, Ordering::AcqRel) - cost <= 0
    }
}

/// Active-CPU marker; see [`CpuBudget::enter_active`].
#[derive(Debug)]
pub struct CpuActiveGuard {
    budget: Arc<CpuBudget>,
}

impl CpuActiveGuard {
    /// Runs `fut` with this task temporarily removed from the active count,
    /// so the wait contributes nothing to the CPU budget.
    pub async fn idle<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.budget.active.fetch_sub(1, Ordering::AcqRel);
        let out = fut.await;
        self.budget.active.fetch_add(1, Ordering::AcqRel);
        out
    }
}

impl Drop for CpuActiveGuard {
    fn drop(&mut self) {
        self.budget.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The limit state of a context. Children chain to their parent: a name not
/// declared locally resolves through the parent, sharing its buckets and
/// counters.
#[derive(Debug, Default)]
pub struct Limiter {
    parent: Option<Arc<Limiter>>,
    buckets: HashMap<String, Arc<TokenBucket>>,
    totals: HashMap<String, Arc<TotalLimit>>,
    cpu: Option<Arc<CpuBudget>>,
    total_time: Option<Duration>,
    declared: HashMap<String, i64>,
    decrementer_stopped: AtomicBool,
}

impl Limiter {
    pub fn new(limits: Vec<Limit>) -> Arc<Self> {
        Self::build(limits, None).expect("a root limiter has no parent to conflict with")
    }

    pub fn child(self: &Arc<Self>, limits: Vec<Limit>) -> Result<Arc<Self>, LimitError> {
        Self::build(limits, Some(self.clone()))
    }

    fn build(limits: Vec<Limit>, parent: Option<Arc<Limiter>>) -> Result<Arc<Self>, LimitError> {
        let mut limiter = Limiter {
            parent,
            ..Default::default()
        };

        for limit in limits {
            if let Some(parent) = &limiter.parent {
                // The child shares the parent's instance; it may restate the
                // limit, but never a looser one.
                if let Some(max) = parent.declared_value(&limit.name) {
                    if limit.value > max {
                        return Err(LimitError::HigherThanParent {
                            name: limit.name,
                            max,
                        });
                    }
                    continue;
                }
            }

            limiter.declared.insert(limit.name.clone(), limit.value);
            match limit.kind {
                LimitKind::ByteRate | LimitKind::SimpleRate => {
                    limiter
                        .buckets
                        .insert(limit.name, Arc::new(TokenBucket::new(limit.value)));
                }
                LimitKind::Total => {
                    if limit.name == EXECUTION_CPU_TIME_LIMIT_NAME {
                        limiter.cpu = Some(Arc::new(CpuBudget::new(limit.value)));
                    } else if limit.name == EXECUTION_TOTAL_TIME_LIMIT_NAME {
                        limiter.total_time = Some(Duration::from_nanos(limit.value as u64));
                    } else {
                        limiter
                            .totals
                            .insert(limit.name, Arc::new(TotalLimit::new(limit.value)));
                    }
                }
            }
        }

        Ok(Arc::new(limiter))
    }

    fn declared_value(&self, name: &str) -> Option<i64> {
        self.declared
            .get(name)
            .copied()
            .or_else(|| self.parent.as_ref()?.declared_value(name))
    }

    pub fn has_limit(&self, name: &str) -> bool {
        self.declared_value(name).is_some()
    }

    fn bucket(&self, name: &str) -> Option<Arc<TokenBucket>> {
        self.buckets
            .get(name)
            .cloned()
            .or_else(|| self.parent.as_ref()?.bucket(name))
    }

    fn total(&self, name: &str) -> Option<Arc<TotalLimit>> {
        self.totals
            .get(name)
            .cloned()
            .or_else(|| self.parent.as_ref()?.total(name))
    }

    /// The CPU budget governing this limiter, if any (possibly the
    /// parent's).
    pub fn cpu_budget(&self) -> Option<Arc<CpuBudget>> {
        self.cpu
            .clone()
            .or_else(|| self.parent.as_ref()?.cpu_budget())
    }

    /// The wall-clock budget declared on this limiter itself.
    pub fn own_total_time(&self) -> Option<Duration> {
        self.total_time
    }

    /// Whether this limiter declared its own CPU budget (as opposed to
    /// inheriting the parent's).
    pub fn own_cpu_budget(&self) -> Option<Arc<CpuBudget>> {
        self.cpu.clone()
    }

    pub(crate) fn mark_decrementer_stopped(&self) {
        self.decrementer_stopped.store(true, Ordering::Release);
    }

    pub(crate) fn decrementer_stopped(&self) -> bool {
        self.decrementer_stopped.load(Ordering::Acquire)
    }

    /// Takes `n` units from the limit `name`: waits for rate limits,
    /// errors for exhausted totals.
    pub async fn take(&self, name: &str, n: i64) -> Result<(), LimitError> {
        if let Some(bucket) = self.bucket(name) {
            trace!(limit = name, n, "taking from rate limit");
            bucket.take(n).await;
            return Ok(());
        }
        if let Some(total) = self.total(name) {
            return total.take(name, n);
        }
        Err(LimitError::Unknown { name: name.into() })
    }

    /// Synchronous take for total limits; rate limits need the waiting
    /// [`Limiter::take`].
    pub fn take_now(&self, name: &str, n: i64) -> Result<(), LimitError> {
        match self.total(name) {
            Some(total) => total.take(name, n),
            None => Err(LimitError::Unknown { name: name.into() }),
        }
    }

    /// Gives `n` units back to the total limit `name` (rate limits refill on
    /// their own).
    pub fn give(&self, name: &str, n: i64) -> Result<(), LimitError> {
        match self.total(name) {
            Some(total) => {
                total.give(n);
                Ok(())
            }
            None => Err(LimitError::Unknown { name: name.into() }),
        }
    }

    /// Remaining CPU-time or wall-time budget for the given limit name.
    pub fn time_budget_remaining(&self, name: &str) -> Option<Duration> {
        if name == EXECUTION_CPU_TIME_LIMIT_NAME {
            return self.cpu_budget().map(|cpu| cpu.remaining());
        }
        self.total(name)
            .map(|total| Duration::from_nanos(total.remaining().max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_limit_validates_the_name() {
        let limit = get_limit(EXECUTION_CPU_TIME_LIMIT_NAME, 1_000).unwrap();
        assert_eq!(limit.kind, LimitKind::Total);

        assert_eq!(
            get_limit("not/a-limit", 1),
            Err(LimitError::Unknown {
                name: "not/a-limit".into()
            }),
        );
    }

    #[tokio::test]
    async fn totals_error_once_exhausted() {
        let limiter = Limiter::new(vec![Limit::total(THREADS_SIMUL_INSTANCES_LIMIT_NAME, 2)]);

        limiter.take(THREADS_SIMUL_INSTANCES_LIMIT_NAME, 2).await.unwrap();
        let err = limiter
            .take(THREADS_SIMUL_INSTANCES_LIMIT_NAME, 1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LimitError::Exceeded {
                name: THREADS_SIMUL_INSTANCES_LIMIT_NAME.into(),
                requested: 1,
            },
        );

        limiter.give(THREADS_SIMUL_INSTANCES_LIMIT_NAME, 1).unwrap();
        limiter.take(THREADS_SIMUL_INSTANCES_LIMIT_NAME, 1).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_wait_for_the_bucket_to_refill() {
        let limiter = Limiter::new(vec![Limit::simple_rate(HTTP_REQUEST_RATE_LIMIT_NAME, 10)]);

        // The bucket starts full, so ten requests pass immediately.
        for _ in 0..10 {
            limiter.take(HTTP_REQUEST_RATE_LIMIT_NAME, 1).await.unwrap();
        }

        // The eleventh has to wait for a refill; with a paused clock the
        // elapsed time is exactly the refill duration.
        let start = Instant::now();
        limiter.take(HTTP_REQUEST_RATE_LIMIT_NAME, 1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(99));
    }

    #[tokio::test]
    async fn children_share_the_parents_counters() {
        let parent = Limiter::new(vec![Limit::total(FS_TOTAL_NEW_FILE_LIMIT_NAME, 3)]);
        let child = parent.child(vec![]).unwrap();

        child.take(FS_TOTAL_NEW_FILE_LIMIT_NAME, 2).await.unwrap();
        parent.take(FS_TOTAL_NEW_FILE_LIMIT_NAME, 1).await.unwrap();

        let err = child.take(FS_TOTAL_NEW_FILE_LIMIT_NAME, 1).await.unwrap_err();
        assert!(matches!(err, LimitError::Exceeded { .. }));
    }

    #[test]
    fn children_cannot_loosen_a_limit() {
        let parent = Limiter::new(vec![Limit::total(FS_TOTAL_NEW_FILE_LIMIT_NAME, 3)]);
        let err = parent
            .child(vec![Limit::total(FS_TOTAL_NEW_FILE_LIMIT_NAME, 10)])
            .unwrap_err();
        assert_eq!(
            err,
            LimitError::HigherThanParent {
                name: FS_TOTAL_NEW_FILE_LIMIT_NAME.into(),
                max: 3,
            },
        );
    }

    #[test]
    fn cpu_budget_charges_per_active_task() {
        let limiter = Limiter::new(vec![Limit::cpu_time(Duration::from_millis(100))]);
        let cpu = limiter.cpu_budget().unwrap();

        // Nothing active: a tick charges nothing.
        assert!(!cpu.charge(Duration::from_millis(10)));
        assert_eq!(cpu.remaining(), Duration::from_millis(100));

        // Two active tasks: a 10 ms tick costs 20 ms of budget.
        let _a = cpu.enter_active();
        let _b = cpu.enter_active();
        assert!(!cpu.charge(Duration::from_millis(10)));
        assert_eq!(cpu.remaining(), Duration::from_millis(80));

        // Paused: ticks charge nothing again.
        cpu.pause();
        assert!(!cpu.charge(Duration::from_millis(50)));
        assert_eq!(cpu.remaining(), Duration::from_millis(80));
        cpu.resume();

        assert!(cpu.charge(Duration::from_millis(40)));
    }

    #[tokio::test]
    async fn idle_scopes_leave_the_active_count() {
        let limiter = Limiter::new(vec![Limit::cpu_time(Duration::from_millis(100))]);
        let cpu = limiter.cpu_budget().unwrap();

        let guard = cpu.enter_active();
        assert_eq!(cpu.active_count(), 1);

        guard
            .idle(async {
                assert_eq!(cpu.active_count(), 0);
            })
            .await;

        assert_eq!(cpu.active_count(), 1);
        drop(guard);
        assert_eq!(cpu.active_count(), 0);
    }
}

//! Lightweight threads.
//!
//! An lthread runs a module body on the runtime's task pool inside its own
//! child context and state. Yield/resume are a channel rendezvous, not
//! host-language coroutines: a yield with `pause_after_yield` parks the
//! lthread until `resume_async`, and parked time costs no CPU budget.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

use crate::context::Context;
use crate::limits::{CpuActiveGuard, THREADS_SIMUL_INSTANCES_LIMIT_NAME};
use crate::permissions::Permission;
use crate::state::GlobalState;
use crate::value::Value;
use crate::RuntimeError;

static NEXT_LTHREAD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LThreadId(u64);

impl LThreadId {
    fn new() -> Self {
        Self(NEXT_LTHREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lthread{}", self.0)
    }
}

impl fmt::Debug for LThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LThreadError {
    #[error("lthread is not paused")]
    NotPaused,
    #[error("lthread already terminated")]
    AlreadyTerminated,
}

#[derive(Clone, Debug)]
pub enum LThreadStatus {
    Pending,
    Running,
    Paused,
    Finished(Result<Value, Arc<RuntimeError>>),
}

impl LThreadStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

/// The body an lthread evaluates: the evaluator passes module evaluation,
/// tests pass closures.
pub type LThreadBody =
    Box<dyn FnOnce(LThreadCtl) -> BoxFuture<'static, Result<Value, RuntimeError>> + Send>;

pub struct LThreadSpawnArgs {
    pub spawner: Arc<GlobalState>,
    /// Names of the spawner's globals to copy (sharing or cloning each
    /// value) into the lthread's state.
    pub globals: Vec<String>,
    pub module_name: String,
    /// When set, a yield parks the lthread until [`LThread::resume_async`].
    pub pause_after_yield: bool,
    /// The context the lthread runs in; a bound child of the spawner's
    /// context when absent.
    pub lthread_ctx: Option<Context>,
}

struct LThreadInner {
    id: LThreadId,
    ctx: Context,
    state: Arc<GlobalState>,
    pause_after_yield: bool,
    paused: AtomicBool,
    resume_tx: Mutex<Option<oneshot::Sender<()>>>,
    status_tx: watch::Sender<LThreadStatus>,
    // Keeps early status transitions from being dropped before the first
    // subscriber appears.
    #[allow(dead_code)]
    status_rx: watch::Receiver<LThreadStatus>,
}

/// Handle on a spawned lthread. Cloning is cheap.
#[derive(Clone)]
pub struct LThread {
    inner: Arc<LThreadInner>,
}

impl fmt::Debug for LThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LThread")
            .field("id", &self.inner.id)
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Spawns an lthread evaluating `body`.
///
/// Requires the `create routine` permission on the spawner's context and a
/// slot in the `threads/simul-instances` limit (given back on
/// termination).
pub fn spawn_lthread(args: LThreadSpawnArgs, body: LThreadBody) -> Result<LThread, RuntimeError> {
    let spawner_ctx = args.spawner.ctx();
    spawner_ctx.require_permission(&Permission::create_lthread())?;

    let limiter = spawner_ctx.limiter().clone();
    let thread_slot_charged = limiter.has_limit(THREADS_SIMUL_INSTANCES_LIMIT_NAME);
    if thread_slot_charged {
        limiter.take_now(THREADS_SIMUL_INSTANCES_LIMIT_NAME, 1)?;
    }

    let ctx = match args.lthread_ctx {
        Some(ctx) => ctx,
        None => spawner_ctx.bound_child()?,
    };
    let state = GlobalState::new(ctx.clone(), args.module_name);
    args.spawner.copy_globals_into(&args.globals, &state)?;

    let (status_tx, status_rx) = watch::channel(LThreadStatus::Pending);
    let lthread = LThread {
        inner: Arc::new(LThreadInner {
            id: LThreadId::new(),
            ctx,
            state,
            pause_after_yield: args.pause_after_yield,
            paused: AtomicBool::new(false),
            resume_tx: Mutex::new(None),
            status_tx,
            status_rx,
        }),
    };

    debug!(id = %lthread.inner.id, ctx = %lthread.inner.ctx.id(), "spawning lthread");

    let runner = lthread.clone();
    tokio::spawn(async move {
        let ctx = runner.inner.ctx.clone();
        let cpu = Arc::new(ctx.enter_cpu_active());
        runner.set_status(LThreadStatus::Running);

        let ctl = LThreadCtl {
            thread: runner.clone(),
            cpu,
        };
        let result = tokio::select! {
            biased;
            cause = ctx.done() => Err(RuntimeError::Context(cause)),
            result = body(ctl) => result,
        };

        if thread_slot_charged {
            let _ = limiter.give(THREADS_SIMUL_INSTANCES_LIMIT_NAME, 1);
        }

        trace!(id = %runner.inner.id, ok = result.is_ok(), "lthread terminated");
        runner.set_status(LThreadStatus::Finished(result.map_err(Arc::new)));
    });

    Ok(lthread)
}

impl LThread {
    pub fn id(&self) -> LThreadId {
        self.inner.id
    }

    pub fn ctx(&self) -> &Context {
        &self.inner.ctx
    }

    pub fn state(&self) -> &Arc<GlobalState> {
        &self.inner.state
    }

    pub fn status(&self) -> LThreadStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    fn set_status(&self, status: LThreadStatus) {
        self.inner.status_tx.send_modify(|current| {
            if !current.is_finished() {
                *current = status;
            }
        });
    }

    /// Unparks an lthread paused after a yield. Returns immediately; the
    /// lthread resumes on its own task.
    pub fn resume_async(&self) -> Result<(), RuntimeError> {
        let sender = self.inner.resume_tx.lock().unwrap().take();
        match sender {
            Some(sender) => {
                let _ = sender.send(());
                Ok(())
            }
            None => Err(LThreadError::NotPaused.into()),
        }
    }

    /// Waits for the lthread's result. The wait charges no CPU time to the
    /// waiting context and fails if `ctx` is cancelled first.
    pub async fn wait_result(&self, ctx: &Context) -> Result<Value, RuntimeError> {
        let mut receiver = self.inner.status_tx.subscribe();
        loop {
            let status = receiver.borrow_and_update().clone();
            if let LThreadStatus::Finished(result) = status {
                return result.map_err(RuntimeError::LThreadResult);
            }
            tokio::select! {
                biased;
                cause = ctx.done() => return Err(RuntimeError::Context(cause)),
                changed = receiver.changed() => {
                    if changed.is_err() {
                        return Err(LThreadError::AlreadyTerminated.into());
                    }
                }
            }
        }
    }

    /// Cancels the lthread's context, which terminates the body at its next
    /// suspension point.
    pub fn cancel(&self) {
        self.inner.ctx.cancel();
    }
}

/// Capabilities handed to the running body: its context, yields, and waits
/// that do not burn CPU budget.
pub struct LThreadCtl {
    thread: LThread,
    cpu: Arc<Option<CpuActiveGuard>>,
}

impl LThreadCtl {
    pub fn ctx(&self) -> &Context {
        self.thread.ctx()
    }

    pub fn state(&self) -> &Arc<GlobalState> {
        self.thread.state()
    }

    pub fn thread(&self) -> &LThread {
        &self.thread
    }

    async fn idle<F: std::future::Future>(&self, fut: F) -> F::Output {
        match self.cpu.as_ref() {
            Some(guard) => guard.idle(fut).await,
            None => fut.await,
        }
    }

    /// Suspends the lthread. With `pause_after_yield` the lthread parks
    /// (charging no CPU time) until [`LThread::resume_async`]; otherwise
    /// this is a plain cooperative yield to the scheduler.
    pub async fn yield_now(&self) -> Result<(), RuntimeError> {
        if !self.thread.inner.pause_after_yield {
            tokio::task::yield_now().await;
            return Ok(());
        }

        let (resume_tx, resume_rx) = oneshot::channel();
        *self.thread.inner.resume_tx.lock().unwrap() = Some(resume_tx);
        self.thread.inner.paused.store(true, Ordering::Release);
        self.thread.set_status(LThreadStatus::Paused);
        trace!(id = %self.thread.inner.id, "lthread paused after yield");

        let ctx = self.thread.ctx().clone();
        let outcome = self
            .idle(async {
                tokio::select! {
                    biased;
                    cause = ctx.done() => Err(RuntimeError::Context(cause)),
                    _ = resume_rx => Ok(()),
                }
            })
            .await;

        self.thread.inner.paused.store(false, Ordering::Release);
        if outcome.is_ok() {
            self.thread.set_status(LThreadStatus::Running);
        }
        outcome
    }

    /// Cancellation-aware sleep that charges no CPU time.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<(), RuntimeError> {
        let ctx = self.thread.ctx().clone();
        self.idle(async move { ctx.sleep(duration).await })
            .await
            .map_err(RuntimeError::Context)
    }

    /// Waits for another lthread's result without spending CPU budget.
    pub async fn wait_result(&self, other: &LThread) -> Result<Value, RuntimeError> {
        let ctx = self.thread.ctx().clone();
        self.idle(async move { other.wait_result(&ctx).await }).await
    }
}

/// An unordered collection of lthreads spawned within it.
#[derive(Default)]
pub struct LThreadGroup {
    threads: Mutex<Vec<LThread>>,
}

impl fmt::Debug for LThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LThreadGroup({})", self.threads.lock().unwrap().len())
    }
}

/// Partial-failure report of [`LThreadGroup::wait_results`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupError {
    pub failures: Vec<String>,
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lthread(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for GroupError {}

impl LThreadGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, lthread: LThread) {
        self.threads.lock().unwrap().push(lthread);
    }

    pub fn len(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().unwrap().is_empty()
    }

    /// Waits for every lthread of the group. On partial failure the
    /// composite error lists each failed lthread.
    pub async fn wait_results(&self, ctx: &Context) -> Result<Vec<Value>, RuntimeError> {
        let threads: Vec<LThread> = self.threads.lock().unwrap().clone();

        let mut values = Vec::with_capacity(threads.len());
        let mut failures = Vec::new();
        for thread in threads {
            match thread.wait_result(ctx).await {
                Ok(value) => values.push(value),
                Err(err) => failures.push(format!("{}: {err}", thread.id())),
            }
        }

        if failures.is_empty() {
            Ok(values)
        } else {
            Err(RuntimeError::LThreadGroup(GroupError { failures }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, ContextError};
    use crate::limits::Limit;
    use crate::permissions::NotAllowedError;
    use std::time::Duration;

    fn spawner_state(limits: Vec<Limit>) -> Arc<GlobalState> {
        let ctx = Context::new(ContextConfig {
            permissions: vec![Permission::create_lthread()],
            limits,
            ..Default::default()
        })
        .unwrap();
        GlobalState::new(ctx, "main")
    }

    fn args(spawner: &Arc<GlobalState>) -> LThreadSpawnArgs {
        LThreadSpawnArgs {
            spawner: spawner.clone(),
            globals: vec![],
            module_name: "lthread-test".into(),
            pause_after_yield: false,
            lthread_ctx: None,
        }
    }

    #[tokio::test]
    async fn spawning_requires_the_create_routine_permission() {
        let ctx = Context::new(ContextConfig::default()).unwrap();
        let spawner = GlobalState::new(ctx, "main");

        let err = spawn_lthread(args(&spawner), Box::new(|_| Box::pin(async { Ok(Value::Nil) })))
            .map(|_| ())
            .unwrap_err();

        let expected = NotAllowedError::new(Permission::create_lthread());
        assert!(matches!(err, RuntimeError::NotAllowed(actual) if actual == expected));
    }

    #[tokio::test]
    async fn wait_result_returns_the_bodys_value() {
        let spawner = spawner_state(vec![]);
        let lthread = spawn_lthread(
            args(&spawner),
            Box::new(|_| Box::pin(async { Ok(Value::Int(42)) })),
        )
        .unwrap();

        let value = lthread.wait_result(spawner.ctx()).await.unwrap();
        assert_eq!(value, Value::Int(42));
    }

    #[tokio::test]
    async fn globals_are_copied_into_the_lthread_state() {
        let spawner = spawner_state(vec![]);
        spawner.set_global("x", Value::Int(7));

        let mut spawn_args = args(&spawner);
        spawn_args.globals = vec!["x".into()];

        let lthread = spawn_lthread(
            spawn_args,
            Box::new(|ctl| {
                Box::pin(async move { Ok(ctl.state().global("x").unwrap_or(Value::Nil)) })
            }),
        )
        .unwrap();

        let value = lthread.wait_result(spawner.ctx()).await.unwrap();
        assert_eq!(value, Value::Int(7));
    }

    #[tokio::test]
    async fn pause_after_yield_parks_until_resumed() {
        let spawner = spawner_state(vec![]);
        let mut spawn_args = args(&spawner);
        spawn_args.pause_after_yield = true;

        let lthread = spawn_lthread(
            spawn_args,
            Box::new(|ctl| {
                Box::pin(async move {
                    ctl.yield_now().await?;
                    Ok(Value::Int(0))
                })
            }),
        )
        .unwrap();

        while !lthread.is_paused() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!lthread.status().is_finished());

        lthread.resume_async().unwrap();
        let value = lthread.wait_result(spawner.ctx()).await.unwrap();
        assert_eq!(value, Value::Int(0));
    }

    #[tokio::test]
    async fn resuming_a_non_paused_lthread_fails() {
        let spawner = spawner_state(vec![]);
        let lthread = spawn_lthread(
            args(&spawner),
            Box::new(|_| Box::pin(async { Ok(Value::Nil) })),
        )
        .unwrap();

        lthread.wait_result(spawner.ctx()).await.unwrap();
        assert!(matches!(
            lthread.resume_async(),
            Err(RuntimeError::LThread(LThreadError::NotPaused)),
        ));
    }

    #[tokio::test]
    async fn the_simul_instances_limit_caps_concurrent_lthreads() {
        let spawner = spawner_state(vec![Limit::total(THREADS_SIMUL_INSTANCES_LIMIT_NAME, 1)]);

        let first = spawn_lthread(
            args(&spawner),
            Box::new(|ctl| {
                Box::pin(async move {
                    ctl.sleep(Duration::from_millis(200)).await?;
                    Ok(Value::Nil)
                })
            }),
        )
        .unwrap();

        let err = spawn_lthread(args(&spawner), Box::new(|_| Box::pin(async { Ok(Value::Nil) })))
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Limit(_)));

        // once the first terminates the slot is given back
        first.cancel();
        let _ = first.wait_result(spawner.ctx()).await;
        spawn_lthread(args(&spawner), Box::new(|_| Box::pin(async { Ok(Value::Nil) })))
            .unwrap();
    }

    #[tokio::test]
    async fn cancelling_the_spawner_context_cancels_the_lthread() {
        let spawner = spawner_state(vec![]);
        let lthread = spawn_lthread(
            args(&spawner),
            Box::new(|ctl| {
                Box::pin(async move {
                    ctl.sleep(Duration::from_secs(60)).await?;
                    Ok(Value::Nil)
                })
            }),
        )
        .unwrap();

        spawner.ctx().cancel();

        let root = Context::new(ContextConfig::default()).unwrap();
        let err = lthread.wait_result(&root).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::LThreadResult(inner)
                if matches!(&*inner, RuntimeError::Context(ContextError::Canceled)),
        ));
    }

    #[tokio::test]
    async fn lthread_handles_are_transient_and_rejected_by_containers() {
        let spawner = spawner_state(vec![]);
        let lthread = spawn_lthread(
            args(&spawner),
            Box::new(|_| Box::pin(async { Ok(Value::Nil) })),
        )
        .unwrap();

        let object = crate::container::Object::new();
        let err = object
            .set_prop(spawner.ctx(), "t", Value::LThread(lthread))
            .unwrap_err();
        assert_eq!(
            err,
            crate::value::ValueError::TransientMember {
                type_name: "lthread",
            },
        );
    }

    #[tokio::test]
    async fn groups_report_partial_failure() {
        let spawner = spawner_state(vec![]);
        let group = LThreadGroup::new();

        group.add(
            spawn_lthread(
                args(&spawner),
                Box::new(|_| Box::pin(async { Ok(Value::Int(1)) })),
            )
            .unwrap(),
        );
        group.add(
            spawn_lthread(
                args(&spawner),
                Box::new(|ctl| {
                    Box::pin(async move {
                        ctl.ctx().cancel();
                        Err(RuntimeError::Context(ContextError::Canceled))
                    })
                }),
            )
            .unwrap(),
        );

        let err = group.wait_results(spawner.ctx()).await.unwrap_err();
        match err {
            RuntimeError::LThreadGroup(group_err) => {
                assert_eq!(group_err.failures.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

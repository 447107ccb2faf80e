#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Execution substrate of the rill runtime.
//!
//! Everything user code does runs inside a [`Context`]: a cancellable
//! scope carrying typed [`Permission`]s, shared [`limits`], a filesystem
//! handle and at most one [`Transaction`]. Lightweight threads spawn child
//! contexts, containers emit path-addressed [`mutation`]s, and the value
//! glue decides what may be persisted or shared.

pub mod container;
pub mod context;
pub mod fs_ops;
pub mod limits;
pub mod lthread;
pub mod mutation;
pub mod pattern;
pub mod permissions;
pub mod state;
pub mod transaction;
pub mod value;

pub use container::{List, Object, Set};
pub use context::{Context, ContextConfig, ContextError, ContextId};
pub use fs_ops::CtxFs;
pub use limits::{get_limit, Limit, LimitError, LimitKind, Limiter};
pub use lthread::{
    spawn_lthread, GroupError, LThread, LThreadBody, LThreadCtl, LThreadError, LThreadGroup,
    LThreadId, LThreadSpawnArgs, LThreadStatus,
};
pub use mutation::{
    CallbackHandle, Mutation, MutationKind, MutationPath, MutationWatchingConfig, WatchingDepth,
};
pub use pattern::{AbsolutePath, Host, HostPattern, PathPattern, UrlPattern};
pub use permissions::{NotAllowedError, Permission, PermissionKind};
pub use state::GlobalState;
pub use transaction::{Transaction, TransactionId, TxError, TxStatus};
pub use value::{SmartLock, SmartLockGuard, Value, ValueError, ValueKind};

use std::sync::Arc;

use thiserror::Error;

/// Umbrella error of the substrate; every subsystem error converts into it.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    NotAllowed(#[from] NotAllowedError),
    #[error(transparent)]
    Limit(#[from] LimitError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("filesystem: {0}")]
    Fs(#[from] rill_vfs::FsError),
    #[error(transparent)]
    LThread(#[from] LThreadError),
    #[error(transparent)]
    LThreadGroup(#[from] GroupError),
    /// Failure of an awaited lthread, as observed by a waiter.
    #[error(transparent)]
    LThreadResult(Arc<RuntimeError>),
}

impl RuntimeError {
    /// Whether the error is (possibly transitively) a cancellation.
    pub fn is_cancellation(&self) -> bool {
        match self {
            RuntimeError::Context(ContextError::Canceled)
            | RuntimeError::Context(ContextError::DeadlineExceeded) => true,
            RuntimeError::LThreadResult(inner) => inner.is_cancellation(),
            _ => false,
        }
    }
}

/// Freezes the process-wide registries (limit names, serializers).
///
/// Called once at the end of process initialization; registrations after
/// this point are an implementer bug.
pub fn mark_ready() {
    limits::mark_limit_registry_ready();
}

//! The value-model glue: what the execution substrate needs to know about
//! runtime values.
//!
//! Three capabilities live here: the serializable/transient split enforced
//! by persistent containers, share-or-clone when a value crosses into
//! another state, and the smart lock protecting shared values.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::container::{List, Object, Set};
use crate::context::{Context, ContextId};
use crate::lthread::LThread;
use crate::pattern::{AbsolutePath, Host};
use crate::state::GlobalState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("a {type_name} is transient and cannot be a member of a persistent container")]
    TransientMember { type_name: &'static str },
    #[error("value does not match the container's element constraint: expected a {expected}, got a {actual}")]
    BadValue {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("a {type_name} cannot be used as a set element key")]
    Unrepresentable { type_name: &'static str },
    #[error("index {index} is out of bounds for a sequence of length {len}")]
    OutOfBounds { index: usize, len: usize },
    #[error("the container is persisted and shared but has no URL")]
    MissingUrl,
    #[error("the container already has a URL")]
    UrlAlreadySet,
}

/// Coarse value kinds, used by container element constraints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Nil,
    Bool,
    Int,
    Float,
    Str,
    Path,
    Host,
    Duration,
    Object,
    List,
    Set,
    LThread,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "string",
            ValueKind::Path => "path",
            ValueKind::Host => "host",
            ValueKind::Duration => "duration",
            ValueKind::Object => "object",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::LThread => "lthread",
        }
    }
}

/// A runtime value, as seen by the substrate.
#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Path(AbsolutePath),
    Host(Host),
    Duration(Duration),
    Object(Object),
    List(List),
    Set(Set),
    LThread(LThread),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Path(_) => ValueKind::Path,
            Value::Host(_) => ValueKind::Host,
            Value::Duration(_) => ValueKind::Duration,
            Value::Object(_) => ValueKind::Object,
            Value::List(_) => ValueKind::List,
            Value::Set(_) => ValueKind::Set,
            Value::LThread(_) => ValueKind::LThread,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind().name()
    }

    /// Whether the value may be a member of a persistent container.
    /// Containers only admit serializable members, so containers themselves
    /// are serializable by construction; lthread handles are transient.
    pub fn is_serializable(&self) -> bool {
        !matches!(self, Value::LThread(_))
    }

    pub fn check_serializable(&self) -> Result<(), ValueError> {
        if self.is_serializable() {
            Ok(())
        } else {
            Err(ValueError::TransientMember {
                type_name: self.type_name(),
            })
        }
    }

    /// The stable key a set uses to identify an element. Only values with
    /// a canonical scalar representation are representable.
    pub fn element_key(&self) -> Result<String, ValueError> {
        match self {
            Value::Nil => Ok("nil".into()),
            Value::Bool(b) => Ok(format!("bool:{b}")),
            Value::Int(i) => Ok(format!("int:{i}")),
            Value::Float(f) => Ok(format!("float:{f}")),
            Value::Str(s) => Ok(format!("str:{s}")),
            Value::Path(p) => Ok(format!("path:{p}")),
            Value::Host(h) => Ok(format!("host:{h}")),
            Value::Duration(d) => Ok(format!("duration:{}", d.as_nanos())),
            _ => Err(ValueError::Unrepresentable {
                type_name: self.type_name(),
            }),
        }
    }

    /// When a value crosses into a context with a different owning state it
    /// is either shared (containers implement sharing) or deep-cloned.
    pub fn share_or_clone(&self, target: &Arc<GlobalState>) -> Result<Value, ValueError> {
        match self {
            Value::Object(object) => {
                object.share(target)?;
                Ok(Value::Object(object.clone()))
            }
            Value::List(list) => {
                list.share(target)?;
                Ok(Value::List(list.clone()))
            }
            Value::Set(set) => {
                set.share(target)?;
                Ok(Value::Set(set.clone()))
            }
            other => Ok(other.clone()),
        }
    }
}

// Scalars compare structurally, containers and lthreads by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Path(a), Value::Path(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.same_identity(b),
            (Value::List(a), Value::List(b)) => a.same_identity(b),
            (Value::Set(a), Value::Set(b)) => a.same_identity(b),
            (Value::LThread(a), Value::LThread(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.into())
    }
}

#[derive(Debug, Default)]
struct SmartLockState {
    owner: Option<ContextId>,
    depth: u32,
}

/// Lock protecting a shared value.
///
/// Acquisition is strictly owner-reentrant: the holding context may lock
/// again without deadlocking. A foreign context blocks until the owner
/// releases; while it waits, its CPU-time decrementation is paused so the
/// wait costs no budget.
#[derive(Debug, Default)]
pub struct SmartLock {
    state: Mutex<SmartLockState>,
    unlocked: Condvar,
}

impl SmartLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, ctx: &Context) {
        let id = ctx.id();
        let mut state = self.state.lock().unwrap();

        if state.owner == Some(id) {
            state.depth += 1;
            return;
        }

        if state.owner.is_some() {
            ctx.pause_cpu_time_decrementation();
            while state.owner.is_some() && state.owner != Some(id) {
                state = self.unlocked.wait(state).unwrap();
            }
            ctx.resume_cpu_time_decrementation();
        }

        state.owner = Some(id);
        state.depth = 1;
    }

    pub fn unlock(&self, ctx: &Context) {
        let mut state = self.state.lock().unwrap();
        if state.owner != Some(ctx.id()) {
            // Unlocking a lock held by someone else is an implementer bug.
            unreachable!("smart lock released by a non-owner context");
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.unlocked.notify_all();
        }
    }

    pub fn holder(&self) -> Option<ContextId> {
        self.state.lock().unwrap().owner
    }
}

/// RAII guard for a [`SmartLock`] acquisition.
pub struct SmartLockGuard<'a> {
    lock: &'a SmartLock,
    ctx: &'a Context,
}

impl<'a> SmartLockGuard<'a> {
    pub fn acquire(lock: &'a SmartLock, ctx: &'a Context) -> Self {
        lock.lock(ctx);
        Self { lock, ctx }
    }
}

impl Drop for SmartLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(self.ctx);
    }
}

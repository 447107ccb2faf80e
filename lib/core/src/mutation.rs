//! Path-addressed change notifications.
//!
//! Watchable entities own a [`MutationCallbacks`] registry. Mutations are
//! emitted at the entity they happen on and relayed upwards by parents
//! watching their children; the registry filters by how deep below the
//! watched entity a mutation was produced.

use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::context::Context;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    AddProp,
    UpdateProp,
    AddEntry,
    UpdateEntry,
    SetElemAtIndex,
    SetSliceAtRange,
    InsertElemAtIndex,
    InsertSequenceAtIndex,
    RemovePosition,
    RemovePositionRange,
    SpecificGraphOp,
    Unspecified,
}

/// How deep below the watched entity a watcher wants to see mutations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WatchingDepth {
    /// Mutations of the entity itself.
    Shallow,
    /// Also mutations of direct children.
    Intermediate,
    /// The full subtree.
    Deep,
}

impl WatchingDepth {
    /// Whether a mutation produced `distance` levels below the entity is
    /// visible at this depth.
    pub fn allows(self, distance: usize) -> bool {
        match self {
            WatchingDepth::Shallow => distance == 0,
            WatchingDepth::Intermediate => distance <= 1,
            WatchingDepth::Deep => true,
        }
    }
}

/// An absolute, forward-slash rooted mutation path. Property names appear
/// as `/name`, string keys as `/"key"`, indices as `/3` and ranges as
/// `/0..2` (inclusive end).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationPath(String);

impl MutationPath {
    pub fn of_prop(name: &str) -> Self {
        Self(format!("/{name}"))
    }

    pub fn of_key(key: &str) -> Self {
        Self(format!("/\"{key}\""))
    }

    pub fn of_index(index: usize) -> Self {
        Self(format!("/{index}"))
    }

    pub fn of_range(start: usize, end_inclusive: usize) -> Self {
        Self(format!("/{start}..{end_inclusive}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefixes the path with a property segment: `/a` relayed through
    /// property `inner` becomes `/inner/a`.
    pub fn prefixed_with_prop(&self, name: &str) -> Self {
        Self(format!("/{name}{}", self.0))
    }

    /// How many levels below the emitting entity's watcher the mutation
    /// happened: `/a` → 0, `/inner/a` → 1.
    pub fn distance(&self) -> usize {
        self.0.matches('/').count().saturating_sub(1)
    }
}

impl std::fmt::Display for MutationPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed delta describing one change at a path within an observable
/// entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    /// The depth at which the receiving watcher observed the mutation.
    pub depth: WatchingDepth,
    pub path: MutationPath,
    pub previous: Option<Value>,
    pub current: Option<Value>,
}

impl Mutation {
    pub fn add_prop(name: &str, value: Value) -> Self {
        Self {
            kind: MutationKind::AddProp,
            depth: WatchingDepth::Shallow,
            path: MutationPath::of_prop(name),
            previous: None,
            current: Some(value),
        }
    }

    pub fn update_prop(name: &str, previous: Value, current: Value) -> Self {
        Self {
            kind: MutationKind::UpdateProp,
            depth: WatchingDepth::Shallow,
            path: MutationPath::of_prop(name),
            previous: Some(previous),
            current: Some(current),
        }
    }

    pub fn add_entry(key: &str, value: Value) -> Self {
        Self {
            kind: MutationKind::AddEntry,
            depth: WatchingDepth::Shallow,
            path: MutationPath::of_key(key),
            previous: None,
            current: Some(value),
        }
    }

    pub fn update_entry(key: &str, previous: Value, current: Value) -> Self {
        Self {
            kind: MutationKind::UpdateEntry,
            depth: WatchingDepth::Shallow,
            path: MutationPath::of_key(key),
            previous: Some(previous),
            current: Some(current),
        }
    }

    pub fn set_elem_at_index(index: usize, previous: Value, current: Value) -> Self {
        Self {
            kind: MutationKind::SetElemAtIndex,
            depth: WatchingDepth::Shallow,
            path: MutationPath::of_index(index),
            previous: Some(previous),
            current: Some(current),
        }
    }

    pub fn set_slice_at_range(start: usize, end_inclusive: usize, current: Value) -> Self {
        Self {
            kind: MutationKind::SetSliceAtRange,
            depth: WatchingDepth::Shallow,
            path: MutationPath::of_range(start, end_inclusive),
            previous: None,
            current: Some(current),
        }
    }

    pub fn insert_elem_at_index(index: usize, value: Value) -> Self {
        Self {
            kind: MutationKind::InsertElemAtIndex,
            depth: WatchingDepth::Shallow,
            path: MutationPath::of_index(index),
            previous: None,
            current: Some(value),
        }
    }

    pub fn insert_sequence_at_index(index: usize, values: Value) -> Self {
        Self {
            kind: MutationKind::InsertSequenceAtIndex,
            depth: WatchingDepth::Shallow,
            path: MutationPath::of_index(index),
            previous: None,
            current: Some(values),
        }
    }

    pub fn remove_position(index: usize, previous: Value) -> Self {
        Self {
            kind: MutationKind::RemovePosition,
            depth: WatchingDepth::Shallow,
            path: MutationPath::of_index(index),
            previous: Some(previous),
            current: None,
        }
    }

    pub fn remove_position_range(start: usize, end_inclusive: usize) -> Self {
        Self {
            kind: MutationKind::RemovePositionRange,
            depth: WatchingDepth::Shallow,
            path: MutationPath::of_range(start, end_inclusive),
            previous: None,
            current: None,
        }
    }

    pub fn unspecified(path: MutationPath) -> Self {
        Self {
            kind: MutationKind::Unspecified,
            depth: WatchingDepth::Shallow,
            path,
            previous: None,
            current: None,
        }
    }

    /// The same mutation as seen one level up, through property `name`.
    pub fn rebased_on_prop(&self, name: &str) -> Self {
        let mut rebased = self.clone();
        rebased.path = self.path.prefixed_with_prop(name);
        rebased
    }
}

/// Handler contract: return `true` to stay registered, `false` to be
/// dropped after this invocation.
pub type MutationHandler = Arc<dyn Fn(&Context, &Mutation) -> bool + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MutationWatchingConfig {
    pub depth: WatchingDepth,
}

impl Default for WatchingDepth {
    fn default() -> Self {
        WatchingDepth::Shallow
    }
}

/// Opaque registration handle, used to remove a callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackHandle(pub(crate) usize);

struct CallbackEntry {
    handler: MutationHandler,
    config: MutationWatchingConfig,
}

/// Registry of mutation callbacks of one watchable entity.
#[derive(Default)]
pub struct MutationCallbacks {
    entries: Mutex<Slab<CallbackEntry>>,
}

impl std::fmt::Debug for MutationCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MutationCallbacks({})", self.entries.lock().unwrap().len())
    }
}

impl MutationCallbacks {
    pub fn add(&self, handler: MutationHandler, config: MutationWatchingConfig) -> CallbackHandle {
        let key = self
            .entries
            .lock()
            .unwrap()
            .insert(CallbackEntry { handler, config });
        CallbackHandle(key)
    }

    pub fn remove(&self, handle: CallbackHandle) {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains(handle.0) {
            entries.remove(handle.0);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Whether any watcher looks below the entity itself.
    pub fn has_deep_watchers(&self) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|(_, entry)| entry.config.depth > WatchingDepth::Shallow)
    }

    /// Dispatches a mutation to every watcher whose depth admits it.
    /// Handlers run synchronously on the mutating thread; a handler
    /// returning `false` is dropped.
    pub fn emit(&self, ctx: &Context, mutation: &Mutation) {
        let distance = mutation.path.distance();

        // Snapshot the handlers so they can re-enter the registry.
        let snapshot: Vec<(usize, MutationHandler, MutationWatchingConfig)> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(key, entry)| (key, entry.handler.clone(), entry.config))
            .collect();

        let mut dropped = Vec::new();
        for (key, handler, config) in snapshot {
            if !config.depth.allows(distance) {
                continue;
            }
            let mut delivered = mutation.clone();
            delivered.depth = config.depth;
            if !handler(ctx, &delivered) {
                dropped.push(key);
            }
        }

        if !dropped.is_empty() {
            let mut entries = self.entries.lock().unwrap();
            for key in dropped {
                if entries.contains(key) {
                    entries.remove(key);
                }
            }
        }
    }
}

//! The list container: a watchable sequence with positional mutations.

use std::sync::{Arc, RwLock};

use crate::context::{Context, ContextId};
use crate::mutation::{
    CallbackHandle, Mutation, MutationCallbacks, MutationHandler, MutationWatchingConfig,
};
use crate::state::GlobalState;
use crate::value::{SmartLock, SmartLockGuard, Value, ValueError, ValueKind};

#[derive(Debug, Default)]
struct ListInner {
    elements: RwLock<Vec<Value>>,
    /// Kind every appended element must have; `None` admits any value.
    constraint: Option<ValueKind>,
    watchers: MutationCallbacks,
    lock: SmartLock,
    sharer: RwLock<Option<ContextId>>,
}

/// A watchable sequence. Cloning is cheap; clones refer to the same list.
#[derive(Clone, Debug, Default)]
pub struct List {
    inner: Arc<ListInner>,
}

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constraint(kind: ValueKind) -> Self {
        Self {
            inner: Arc::new(ListInner {
                constraint: Some(kind),
                ..Default::default()
            }),
        }
    }

    /// Builds a list from initial elements; no mutations are emitted.
    pub fn from_values(values: Vec<Value>) -> Result<Self, ValueError> {
        for value in &values {
            value.check_serializable()?;
        }
        Ok(Self {
            inner: Arc::new(ListInner {
                elements: RwLock::new(values),
                ..Default::default()
            }),
        })
    }

    pub fn same_identity(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn len(&self) -> usize {
        self.inner.elements.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.elements.read().unwrap().is_empty()
    }

    pub fn elem_at(&self, index: usize) -> Option<Value> {
        self.inner.elements.read().unwrap().get(index).cloned()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.inner.elements.read().unwrap().clone()
    }

    fn check_constraint(&self, value: &Value) -> Result<(), ValueError> {
        if let Some(expected) = self.inner.constraint {
            if value.kind() != expected {
                return Err(ValueError::BadValue {
                    expected: expected.name(),
                    actual: value.type_name(),
                });
            }
        }
        Ok(())
    }

    fn check_index(&self, index: usize, len: usize) -> Result<(), ValueError> {
        if index >= len {
            Err(ValueError::OutOfBounds { index, len })
        } else {
            Ok(())
        }
    }

    pub fn set_elem_at_index(
        &self,
        ctx: &Context,
        index: usize,
        value: Value,
    ) -> Result<(), ValueError> {
        value.check_serializable()?;
        self.check_constraint(&value)?;
        let _guard = self.lock_if_shared(ctx);

        let previous = {
            let mut elements = self.inner.elements.write().unwrap();
            self.check_index(index, elements.len())?;
            std::mem::replace(&mut elements[index], value.clone())
        };

        self.inner
            .watchers
            .emit(ctx, &Mutation::set_elem_at_index(index, previous, value));
        Ok(())
    }

    /// Replaces the inclusive range `start..=end` with `values` (which must
    /// have the same length).
    pub fn set_slice_at_range(
        &self,
        ctx: &Context,
        start: usize,
        end_inclusive: usize,
        values: Vec<Value>,
    ) -> Result<(), ValueError> {
        for value in &values {
            value.check_serializable()?;
            self.check_constraint(value)?;
        }
        let _guard = self.lock_if_shared(ctx);

        {
            let mut elements = self.inner.elements.write().unwrap();
            self.check_index(end_inclusive, elements.len())?;
            if end_inclusive - start + 1 != values.len() {
                return Err(ValueError::OutOfBounds {
                    index: start + values.len(),
                    len: elements.len(),
                });
            }
            elements.splice(start..=end_inclusive, values.clone());
        }

        let slice = List::from_values(values)?;
        self.inner.watchers.emit(
            ctx,
            &Mutation::set_slice_at_range(start, end_inclusive, Value::List(slice)),
        );
        Ok(())
    }

    pub fn insert_elem_at_index(
        &self,
        ctx: &Context,
        index: usize,
        value: Value,
    ) -> Result<(), ValueError> {
        value.check_serializable()?;
        self.check_constraint(&value)?;
        let _guard = self.lock_if_shared(ctx);

        {
            let mut elements = self.inner.elements.write().unwrap();
            if index > elements.len() {
                return Err(ValueError::OutOfBounds {
                    index,
                    len: elements.len(),
                });
            }
            elements.insert(index, value.clone());
        }

        self.inner
            .watchers
            .emit(ctx, &Mutation::insert_elem_at_index(index, value));
        Ok(())
    }

    /// Splices `values` in at `index`. A splice is positional surgery: the
    /// incoming elements are checked for serializability but not against
    /// the element constraint, and existing members are never re-validated.
    pub fn insert_sequence_at_index(
        &self,
        ctx: &Context,
        index: usize,
        values: Vec<Value>,
    ) -> Result<(), ValueError> {
        for value in &values {
            value.check_serializable()?;
        }
        let _guard = self.lock_if_shared(ctx);

        {
            let mut elements = self.inner.elements.write().unwrap();
            if index > elements.len() {
                return Err(ValueError::OutOfBounds {
                    index,
                    len: elements.len(),
                });
            }
            elements.splice(index..index, values.clone());
        }

        let sequence = List::from_values(values)?;
        self.inner.watchers.emit(
            ctx,
            &Mutation::insert_sequence_at_index(index, Value::List(sequence)),
        );
        Ok(())
    }

    /// Appends `values`, validating each against the element constraint.
    pub fn append_sequence(&self, ctx: &Context, values: Vec<Value>) -> Result<(), ValueError> {
        for value in &values {
            value.check_serializable()?;
            self.check_constraint(value)?;
        }
        let _guard = self.lock_if_shared(ctx);

        let index = {
            let mut elements = self.inner.elements.write().unwrap();
            let index = elements.len();
            elements.extend(values.clone());
            index
        };

        let sequence = List::from_values(values)?;
        self.inner.watchers.emit(
            ctx,
            &Mutation::insert_sequence_at_index(index, Value::List(sequence)),
        );
        Ok(())
    }

    pub fn append(&self, ctx: &Context, value: Value) -> Result<(), ValueError> {
        let index = self.len();
        value.check_serializable()?;
        self.check_constraint(&value)?;
        let _guard = self.lock_if_shared(ctx);

        self.inner.elements.write().unwrap().push(value.clone());
        self.inner
            .watchers
            .emit(ctx, &Mutation::insert_elem_at_index(index, value));
        Ok(())
    }

    pub fn remove_position(&self, ctx: &Context, index: usize) -> Result<Value, ValueError> {
        let _guard = self.lock_if_shared(ctx);

        let removed = {
            let mut elements = self.inner.elements.write().unwrap();
            self.check_index(index, elements.len())?;
            elements.remove(index)
        };

        self.inner
            .watchers
            .emit(ctx, &Mutation::remove_position(index, removed.clone()));
        Ok(removed)
    }

    /// Removes the inclusive range `start..=end`.
    pub fn remove_position_range(
        &self,
        ctx: &Context,
        start: usize,
        end_inclusive: usize,
    ) -> Result<(), ValueError> {
        let _guard = self.lock_if_shared(ctx);

        {
            let mut elements = self.inner.elements.write().unwrap();
            self.check_index(end_inclusive, elements.len())?;
            elements.drain(start..=end_inclusive);
        }

        self.inner
            .watchers
            .emit(ctx, &Mutation::remove_position_range(start, end_inclusive));
        Ok(())
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

    pub fn share(&self, state: &Arc<GlobalState>) -> Result<(), ValueError> {
        {
            let mut sharer = self.inner.sharer.write().unwrap();
            if sharer.is_some() {
                return Ok(());
            }
            *sharer = Some(state.id());
        }
        for value in self.inner.elements.read().unwrap().iter() {
            match value {
                Value::Object(object) => object.share(state)?,
                Value::List(list) => list.share(state)?,
                Value::Set(set) => set.share(state)?,
                _ => {}
            }
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

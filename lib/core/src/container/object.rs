//! The object container: a watchable map of named properties.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::context::{Context, ContextId};
use crate::mutation::{
    CallbackHandle, Mutation, MutationCallbacks, MutationHandler, MutationWatchingConfig,
    WatchingDepth,
};
use crate::state::GlobalState;
use crate::value::{SmartLock, SmartLockGuard, Value, ValueError};

#[derive(Debug, Default)]
struct ObjectInner {
    props: RwLock<BTreeMap<String, Value>>,
    watchers: MutationCallbacks,
    // One relay per object-valued property, registered on the child's
    // callbacks; it rebases the child's mutations onto this object.
    relays: Mutex<HashMap<String, CallbackHandle>>,
    lock: SmartLock,
    sharer: RwLock<Option<ContextId>>,
    url: Mutex<Option<String>>,
}

/// A watchable property container. Cloning is cheap; clones refer to the
/// same object.
#[derive(Clone, Debug, Default)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an object from initial entries; no mutations are emitted.
    pub fn from_map(
        entries: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<Self, ValueError> {
        let object = Self::new();
        {
            let mut props = object.inner.props.write().unwrap();
            for (name, value) in entries {
                value.check_serializable()?;
                props.insert(name, value);
            }
        }
        Ok(object)
    }

    pub fn same_identity(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn len(&self) -> usize {
        self.inner.props.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.props.read().unwrap().is_empty()
    }

    pub fn prop(&self, name: &str) -> Option<Value> {
        self.inner.props.read().unwrap().get(name).cloned()
    }

    pub fn prop_names(&self) -> Vec<String> {
        self.inner.props.read().unwrap().keys().cloned().collect()
    }

    /// Sets a property, emitting an `AddProp` or `UpdateProp` mutation.
    ///
    /// If the replaced value was a watched child object, its relay is
    /// detached first: later mutations of the old child no longer reach
    /// watchers of this object.
    pub fn set_prop(&self, ctx: &Context, name: &str, value: Value) -> Result<(), ValueError> {
        value.check_serializable()?;
        let _guard = self.lock_if_shared(ctx);

        let previous = self
            .inner
            .props
            .write()
            .unwrap()
            .insert(name.to_owned(), value.clone());

        self.detach_relay(name, previous.as_ref());
        if self.inner.watchers.has_deep_watchers() {
            self.attach_relay(name, &value);
        }

        let mutation = match &previous {
            None => Mutation::add_prop(name, value),
            Some(previous) => Mutation::update_prop(name, previous.clone(), value),
        };
        self.inner.watchers.emit(ctx, &mutation);

        Ok(())
    }

    /// Registers a mutation handler. With a depth beyond `Shallow`, child
    /// objects are watched through relays so their mutations arrive with
    /// this object's property prefixed to the path.
    pub fn on_mutation(
        &self,
        _ctx: &Context,
        handler: MutationHandler,
        config: MutationWatchingConfig,
    ) -> CallbackHandle {
        let handle = self.inner.watchers.add(handler, config);
        if config.depth > WatchingDepth::Shallow {
            self.ensure_relays();
        }
        handle
    }

    pub fn remove_mutation_callback(&self, _ctx: &Context, handle: CallbackHandle) {
        self.inner.watchers.remove(handle);
    }

    fn ensure_relays(&self) {
        let props: Vec<(String, Value)> = self
            .inner
            .props
            .read()
            .unwrap()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        for (name, value) in props {
            self.attach_relay(&name, &value);
        }
    }

    fn attach_relay(&self, name: &str, value: &Value) {
        let Value::Object(child) = value else {
            return;
        };

        let mut relays = self.inner.relays.lock().unwrap();
        if relays.contains_key(name) {
            return;
        }

        let parent: Weak<ObjectInner> = Arc::downgrade(&self.inner);
        let prop_name = name.to_owned();
        let handle = child.inner.watchers.add(
            Arc::new(move |ctx, mutation| {
                if let Some(parent) = parent.upgrade() {
                    parent.watchers.emit(ctx, &mutation.rebased_on_prop(&prop_name));
                }
                true
            }),
            MutationWatchingConfig {
                depth: WatchingDepth::Deep,
            },
        );
        relays.insert(name.to_owned(), handle);
    }

    fn detach_relay(&self, name: &str, previous: Option<&Value>) {
        let Some(handle) = self.inner.relays.lock().unwrap().remove(name) else {
            return;
        };
        if let Some(Value::Object(previous)) = previous {
            previous.inner.watchers.remove(handle);
        }
    }

    // ---- sharing -----------------------------------------------------

    /// Marks the object as shared with `state`'s context; nested containers
    /// are shared transitively. Further cross-context accesses go through
    /// the smart lock.
    pub fn share(&self, state: &Arc<GlobalState>) -> Result<(), ValueError> {
        {
            let mut sharer = self.inner.sharer.write().unwrap();
            if sharer.is_some() {
                return Ok(());
            }
            *sharer = Some(state.id());
        }
        for value in self.inner.props.read().unwrap().values() {
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

    /// Explicit smart-lock acquisition; reentrant for the owner.
    pub fn lock(&self, ctx: &Context) {
        self.inner.lock.lock(ctx);
    }

    pub fn unlock(&self, ctx: &Context) {
        self.inner.lock.unlock(ctx);
    }

    // ---- identity ----------------------------------------------------

    pub fn url(&self) -> Option<String> {
        self.inner.url.lock().unwrap().clone()
    }

    /// Gives the object an identity URL; may only be done once.
    pub fn set_url(&self, url: impl Into<String>) -> Result<(), ValueError> {
        let mut slot = self.inner.url.lock().unwrap();
        if slot.is_some() {
            return Err(ValueError::UrlAlreadySet);
        }
        *slot = Some(url.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;
    use crate::mutation::MutationKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn test_ctx() -> Context {
        Context::new(ContextConfig::default()).unwrap()
    }

    fn watch(
        object: &Object,
        ctx: &Context,
        depth: WatchingDepth,
    ) -> Arc<Mutex<Vec<Mutation>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        object.on_mutation(
            ctx,
            Arc::new(move |_, mutation| {
                seen_clone.lock().unwrap().push(mutation.clone());
                true
            }),
            MutationWatchingConfig { depth },
        );
        seen
    }

    #[test]
    fn handler_is_called_when_a_property_is_added() {
        let ctx = test_ctx();
        let object = Object::new();
        let seen = watch(&object, &ctx, WatchingDepth::Shallow);

        object.set_prop(&ctx, "a", Value::Int(1)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MutationKind::AddProp);
        assert_eq!(seen[0].path.as_str(), "/a");
        assert_eq!(seen[0].current, Some(Value::Int(1)));
        assert_eq!(seen[0].depth, WatchingDepth::Shallow);
    }

    #[test]
    fn handler_is_called_when_an_existing_property_is_set() {
        let ctx = test_ctx();
        let object = Object::from_map([("a".to_owned(), Value::Int(1))]).unwrap();
        let seen = watch(&object, &ctx, WatchingDepth::Shallow);

        object.set_prop(&ctx, "a", Value::Int(2)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].kind, MutationKind::UpdateProp);
        assert_eq!(seen[0].previous, Some(Value::Int(1)));
        assert_eq!(seen[0].current, Some(Value::Int(2)));
    }

    #[test]
    fn nested_mutations_reach_intermediate_watchers_with_the_full_path() {
        let ctx = test_ctx();
        let inner = Object::from_map([("a".to_owned(), Value::Int(1))]).unwrap();
        let object = Object::from_map([("inner".to_owned(), Value::Object(inner.clone()))]).unwrap();
        let seen = watch(&object, &ctx, WatchingDepth::Intermediate);

        inner.set_prop(&ctx, "a", Value::Int(2)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MutationKind::UpdateProp);
        assert_eq!(seen[0].path.as_str(), "/inner/a");
        assert_eq!(seen[0].depth, WatchingDepth::Intermediate);
    }

    #[test]
    fn a_child_added_after_the_watcher_is_relayed_too() {
        let ctx = test_ctx();
        let object = Object::new();
        let seen = watch(&object, &ctx, WatchingDepth::Intermediate);

        let inner = Object::from_map([("a".to_owned(), Value::Int(1))]).unwrap();
        object
            .set_prop(&ctx, "inner", Value::Object(inner.clone()))
            .unwrap();
        inner.set_prop(&ctx, "a", Value::Int(2)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].path.as_str(), "/inner/a");
    }

    #[test]
    fn shallow_watchers_do_not_see_nested_mutations() {
        let ctx = test_ctx();
        let inner = Object::new();
        let object = Object::from_map([("inner".to_owned(), Value::Object(inner.clone()))]).unwrap();

        // a deep watcher forces relays to exist, the shallow one must still
        // be filtered
        watch(&object, &ctx, WatchingDepth::Deep);
        let shallow = watch(&object, &ctx, WatchingDepth::Shallow);

        inner.set_prop(&ctx, "a", Value::Int(1)).unwrap();
        assert!(shallow.lock().unwrap().is_empty());
    }

    #[test]
    fn deep_watchers_see_the_whole_subtree() {
        let ctx = test_ctx();
        let innermost = Object::new();
        let mid = Object::from_map([("leaf".to_owned(), Value::Object(innermost.clone()))]).unwrap();
        let object = Object::from_map([("mid".to_owned(), Value::Object(mid))]).unwrap();
        let seen = watch(&object, &ctx, WatchingDepth::Deep);

        innermost.set_prop(&ctx, "x", Value::Int(1)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path.as_str(), "/mid/leaf/x");
        assert_eq!(seen[0].depth, WatchingDepth::Deep);
    }

    /// Replacing a watched child must detach the old child's relay: only
    /// mutations of the new child reach the watcher afterwards.
    #[test]
    fn a_replaced_child_no_longer_reaches_the_watcher() {
        let ctx = test_ctx();
        let old_inner = Object::from_map([("a".to_owned(), Value::Int(1))]).unwrap();
        let object =
            Object::from_map([("inner".to_owned(), Value::Object(old_inner.clone()))]).unwrap();

        let seen = watch(&object, &ctx, WatchingDepth::Intermediate);

        let new_inner = Object::from_map([("a".to_owned(), Value::Int(1))]).unwrap();
        object
            .set_prop(&ctx, "inner", Value::Object(new_inner.clone()))
            .unwrap();

        // mutate the OLD child: must not fire
        old_inner.set_prop(&ctx, "a", Value::Int(99)).unwrap();
        // mutate the NEW child: must fire with /inner/a
        new_inner.set_prop(&ctx, "a", Value::Int(2)).unwrap();

        let seen = seen.lock().unwrap();
        let paths: Vec<_> = seen.iter().map(|m| m.path.as_str().to_owned()).collect();
        assert_eq!(paths, vec!["/inner", "/inner/a"]);
        assert_eq!(seen[1].current, Some(Value::Int(2)));
    }

    #[test]
    fn removed_callbacks_stop_firing() {
        let ctx = test_ctx();
        let object = Object::new();
        let called = Arc::new(AtomicBool::new(false));

        let called_clone = called.clone();
        let handle = object.on_mutation(
            &ctx,
            Arc::new(move |_, _| {
                called_clone.store(true, Ordering::SeqCst);
                true
            }),
            MutationWatchingConfig::default(),
        );
        object.remove_mutation_callback(&ctx, handle);

        object.set_prop(&ctx, "a", Value::Int(1)).unwrap();
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn a_handler_returning_false_is_dropped() {
        let ctx = test_ctx();
        let object = Object::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        object.on_mutation(
            &ctx,
            Arc::new(move |_, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                false
            }),
            MutationWatchingConfig::default(),
        );

        object.set_prop(&ctx, "a", Value::Int(1)).unwrap();
        object.set_prop(&ctx, "a", Value::Int(2)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn url_can_only_be_set_once() {
        let object = Object::new();
        assert_eq!(object.url(), None);
        object.set_url("ldb://main/objects/1").unwrap();
        assert_eq!(
            object.set_url("ldb://main/objects/2"),
            Err(ValueError::UrlAlreadySet),
        );
        assert_eq!(object.url(), Some("ldb://main/objects/1".into()));
    }
}

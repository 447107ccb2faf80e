//! The evaluator-facing state attached to a context.
//!
//! The evaluator itself lives outside this crate; the state object is the
//! seam: it owns the context, the module's global variables, and the id
//! used by smart locks to tell owner accesses from foreign ones.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::{Context, ContextId};
use crate::value::Value;

/// Per-context global scope.
pub struct GlobalState {
    ctx: Context,
    module_name: String,
    globals: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for GlobalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalState")
            .field("module", &self.module_name)
            .field("ctx", &self.ctx.id())
            .finish()
    }
}

impl GlobalState {
    pub fn new(ctx: Context, module_name: impl Into<String>) -> Arc<Self> {
        let state = Arc::new(Self {
            ctx,
            module_name: module_name.into(),
            globals: RwLock::new(HashMap::new()),
        });
        state.ctx.set_global_state(&state);
        state
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Identity of this state; smart locks key ownership on it.
    pub fn id(&self) -> ContextId {
        self.ctx.id()
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.read().unwrap().get(name).cloned()
    }

    pub fn set_global(&self, name: impl Into<String>, value: Value) {
        self.globals.write().unwrap().insert(name.into(), value);
    }

    pub fn global_names(&self) -> Vec<String> {
        self.globals.read().unwrap().keys().cloned().collect()
    }

    /// Copies the named globals into another state, cloning or sharing each
    /// value as its type requires. Used when spawning lthreads.
    pub fn copy_globals_into(
        &self,
        names: &[String],
        target: &Arc<GlobalState>,
    ) -> Result<(), crate::value::ValueError> {
        let globals = self.globals.read().unwrap();
        for name in names {
            if let Some(value) = globals.get(name) {
                target.set_global(name.clone(), value.share_or_clone(target)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;

    #[test]
    fn the_closest_state_is_found_through_the_context_chain() {
        let root = Context::new(ContextConfig::default()).unwrap();
        let state = GlobalState::new(root.clone(), "main");

        let child = root.child(ContextConfig::default()).unwrap();
        let found = child.get_closest_state().unwrap();
        assert_eq!(found.id(), state.id());
        assert_eq!(found.module_name(), "main");
    }

    #[test]
    fn globals_roundtrip() {
        let ctx = Context::new(ContextConfig::default()).unwrap();
        let state = GlobalState::new(ctx, "main");

        state.set_global("answer", Value::Int(42));
        assert_eq!(state.global("answer"), Some(Value::Int(42)));
        assert_eq!(state.global("missing"), None);
    }
}

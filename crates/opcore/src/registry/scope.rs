//! Thread-local registry overrides.

use std::cell::RefCell;
use std::sync::Arc;

use super::{global, OpRegistry};
use crate::error::Result;

thread_local! {
    static REGISTRY_STACK: RefCell<Vec<Arc<OpRegistry>>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard that keeps a registry active on this thread's stack.
pub struct RegistryGuard {
    depth: usize,
}

impl RegistryGuard {
    pub fn push(registry: Arc<OpRegistry>) -> Self {
        let depth = REGISTRY_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(registry);
            stack.len()
        });
        RegistryGuard { depth }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        REGISTRY_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(
                stack.len(),
                self.depth,
                "registry guards dropped out of order"
            );
            stack.truncate(self.depth.saturating_sub(1));
        });
    }
}

pub fn push_registry(registry: Arc<OpRegistry>) -> RegistryGuard {
    RegistryGuard::push(registry)
}

/// Runs `f` with `registry` temporarily installed on the stack.
pub fn with_registry<F, R>(registry: Arc<OpRegistry>, f: F) -> R
where
    F: FnOnce() -> R,
{
    let guard = push_registry(registry);
    let result = f();
    drop(guard);
    result
}

/// The innermost scoped registry on this thread, else the global one.
pub fn current_registry() -> Result<Arc<OpRegistry>> {
    let scoped = REGISTRY_STACK.with(|stack| stack.borrow().last().cloned());
    match scoped {
        Some(registry) => Ok(registry),
        None => global(),
    }
}

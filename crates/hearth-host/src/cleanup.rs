use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

/// Identity of a registered hook: the function and argument addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookKey {
    fun: usize,
    arg: usize,
}

impl HookKey {
    fn of<C, A>(fun: fn(&C, &A), arg: &Rc<A>) -> Self {
        Self {
            fun: fun as *const () as usize,
            arg: Rc::as_ptr(arg) as *const () as usize,
        }
    }
}

struct CleanupHook<C> {
    key: HookKey,
    callback: Rc<dyn Fn(&C)>,
}

/// Ordered cleanup hooks, run once each in reverse registration order
///
/// Hooks may add or remove other hooks while the registry is running. A hook
/// added during a run is still invoked before [`CleanupRegistry::run_all`]
/// returns; a hook removed before its turn never runs.
pub struct CleanupRegistry<C> {
    hooks: RefCell<BTreeMap<u64, CleanupHook<C>>>,
    next_seq: Cell<u64>,
}

impl<C: 'static> CleanupRegistry<C> {
    pub fn new() -> Self {
        Self {
            hooks: RefCell::new(BTreeMap::new()),
            next_seq: Cell::new(0),
        }
    }

    /// Register `fun(ctx, &arg)` to run during teardown
    pub fn add<A: 'static>(&self, fun: fn(&C, &A), arg: Rc<A>) -> HookKey {
        let key = HookKey::of(fun, &arg);
        let seq = self.next_seq.get() + 1;
        self.next_seq.set(seq);
        let callback: Rc<dyn Fn(&C)> = Rc::new(move |ctx: &C| fun(ctx, &arg));
        self.hooks
            .borrow_mut()
            .insert(seq, CleanupHook { key, callback });
        key
    }

    /// Remove the most recent unexecuted registration of `(fun, arg)`
    pub fn remove<A: 'static>(&self, fun: fn(&C, &A), arg: &Rc<A>) -> bool {
        let key = HookKey::of(fun, arg);
        let mut hooks = self.hooks.borrow_mut();
        let seq = hooks
            .iter()
            .rev()
            .find(|(_, hook)| hook.key == key)
            .map(|(seq, _)| *seq);
        match seq {
            Some(seq) => hooks.remove(&seq).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.borrow().is_empty()
    }

    /// Run every hook in reverse registration order, returning how many ran
    pub fn run_all(&self, ctx: &C) -> usize {
        let mut ran = 0;
        loop {
            // Snapshot so hooks can mutate the registry while we iterate
            let snapshot: Vec<u64> = self.hooks.borrow().keys().rev().copied().collect();
            if snapshot.is_empty() {
                break;
            }
            for seq in snapshot {
                let hook = self.hooks.borrow_mut().remove(&seq);
                if let Some(hook) = hook {
                    (hook.callback)(ctx);
                    ran += 1;
                }
            }
        }
        debug!(target: "cleanup", "Ran {} cleanup hooks", ran);
        ran
    }
}

impl<C: 'static> Default for CleanupRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Callbacks run once at final teardown, after all cleanup hooks
pub struct ExitCallbacks<C> {
    callbacks: RefCell<Vec<Box<dyn FnOnce(&C)>>>,
}

impl<C> ExitCallbacks<C> {
    pub fn new() -> Self {
        Self {
            callbacks: RefCell::new(Vec::new()),
        }
    }

    pub fn push(&self, callback: impl FnOnce(&C) + 'static) {
        self.callbacks.borrow_mut().push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.borrow().is_empty()
    }

    /// Run in reverse registration order until none remain
    pub fn run_all(&self, ctx: &C) -> usize {
        let mut ran = 0;
        loop {
            let next = self.callbacks.borrow_mut().pop();
            match next {
                Some(callback) => {
                    callback(ctx);
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl<C> Default for ExitCallbacks<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<String>>,
        registry: CleanupRegistry<Recorder>,
    }

    fn record(ctx: &Recorder, name: &String) {
        ctx.calls.borrow_mut().push(name.clone());
    }

    fn record_and_add(ctx: &Recorder, name: &String) {
        ctx.calls.borrow_mut().push(name.clone());
        ctx.registry.add(record, Rc::new(format!("{}-child", name)));
    }

    #[test]
    fn test_runs_in_reverse_registration_order() {
        let ctx = Recorder::default();
        ctx.registry.add(record, Rc::new("a".to_string()));
        ctx.registry.add(record, Rc::new("b".to_string()));
        ctx.registry.add(record, Rc::new("c".to_string()));

        assert_eq!(ctx.registry.run_all(&ctx), 3);
        assert_eq!(*ctx.calls.borrow(), vec!["c", "b", "a"]);
        assert!(ctx.registry.is_empty());

        // Already ran, nothing left
        assert_eq!(ctx.registry.run_all(&ctx), 0);
    }

    #[test]
    fn test_remove_matches_function_and_argument() {
        let ctx = Recorder::default();
        let a = Rc::new("a".to_string());
        let b = Rc::new("b".to_string());
        ctx.registry.add(record, a.clone());
        ctx.registry.add(record, b.clone());

        assert!(ctx.registry.remove(record, &a));
        assert!(!ctx.registry.remove(record, &a));
        // Same function, different argument identity
        assert!(!ctx.registry.remove(record, &Rc::new("b".to_string())));
        assert!(!ctx.registry.remove(record_and_add, &b));

        ctx.registry.run_all(&ctx);
        assert_eq!(*ctx.calls.borrow(), vec!["b"]);
    }

    #[test]
    fn test_remove_takes_most_recent_duplicate() {
        let ctx = Recorder::default();
        let a = Rc::new("a".to_string());
        ctx.registry.add(record, a.clone());
        ctx.registry.add(record, Rc::new("b".to_string()));
        ctx.registry.add(record, a.clone());

        assert!(ctx.registry.remove(record, &a));
        ctx.registry.run_all(&ctx);
        assert_eq!(*ctx.calls.borrow(), vec!["b", "a"]);
    }

    #[test]
    fn test_hooks_added_during_run_still_run() {
        let ctx = Recorder::default();
        ctx.registry.add(record, Rc::new("a".to_string()));
        ctx.registry.add(record_and_add, Rc::new("b".to_string()));

        assert_eq!(ctx.registry.run_all(&ctx), 3);
        assert_eq!(*ctx.calls.borrow(), vec!["b", "a", "b-child"]);
    }

    #[test]
    fn test_exit_callbacks_run_lifo() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let callbacks: ExitCallbacks<()> = ExitCallbacks::new();
        for i in 0..3 {
            let order = order.clone();
            callbacks.push(move |_| order.borrow_mut().push(i));
        }
        assert_eq!(callbacks.run_all(&()), 3);
        assert_eq!(*order.borrow(), vec![2, 1, 0]);
        assert!(callbacks.is_empty());
    }
}

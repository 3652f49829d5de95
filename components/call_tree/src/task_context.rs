//! Call stack propagation for async tasks
//!
//! On a multi-threaded runtime a future may resume on a different worker
//! after every `.await`, so a thread-bound stack would be attributed to the
//! wrong execution. Instead the [`CallStack`] is stored in a tokio task-local
//! slot for the duration of a future and travels with the task.
//!
//! The free functions below are the async counterparts of the `CallStack`
//! methods and, like them, do nothing outside [`scope_call_stack`] or while
//! the stack is inactive.

use std::cell::RefCell;
use std::future::Future;

use tracing::debug;

use crate::call_stack::CallStack;
use crate::tree::CallTree;

tokio::task_local! {
    static CALL_STACK: RefCell<Option<CallStack>>;
}

/// Run `future` with `stack` as the current task's call stack
///
/// Returns the stack (with whatever the future recorded) alongside the
/// future's output.
pub async fn scope_call_stack<F>(stack: CallStack, future: F) -> (CallStack, F::Output)
where
    F: Future,
{
    let fallback = stack.profiler().call_stack();
    CALL_STACK
        .scope(RefCell::new(Some(stack)), async move {
            let output = future.await;
            let stack = CALL_STACK
                .try_with(|cell| cell.borrow_mut().take())
                .ok()
                .flatten()
                .unwrap_or(fallback);
            (stack, output)
        })
        .await
}

/// Run `f` against the current task's call stack, if there is one
pub fn with_call_stack<R>(f: impl FnOnce(&mut CallStack) -> R) -> Option<R> {
    CALL_STACK
        .try_with(|cell| cell.borrow_mut().as_mut().map(f))
        .ok()
        .flatten()
}

/// Move the current task's call stack out of its context
///
/// Functions in this module are no-ops until the stack is put back with
/// [`restore_call_stack`]. Returns `None` outside [`scope_call_stack`] or
/// while the stack is already taken.
pub fn take_call_stack() -> Option<CallStack> {
    CALL_STACK.try_with(|cell| cell.borrow_mut().take()).ok().flatten()
}

/// Put a stack taken with [`take_call_stack`] back into the task's context
///
/// Outside [`scope_call_stack`] the stack is dropped, recycling any tree it
/// still holds.
pub fn restore_call_stack(stack: CallStack) {
    let mut pending = Some(stack);
    let _ = CALL_STACK.try_with(|cell| *cell.borrow_mut() = pending.take());
    if pending.is_some() {
        debug!("No task call stack to restore into; dropping it");
    }
}

/// Open a child of the current task's innermost node
pub fn start(signature: &str) {
    with_call_stack(|stack| stack.start(signature));
}

/// Close the current task's innermost node
pub fn stop() -> Option<CallTree> {
    with_call_stack(CallStack::stop).flatten()
}

/// Record an already-measured leaf in the current task's tree
pub fn add_io_call(description: &str, duration_nanos: u64) {
    with_call_stack(|stack| stack.add_io_call(description, duration_nanos));
}

/// Whether the current task is recording a tree
pub fn is_active() -> bool {
    with_call_stack(|stack| stack.is_active()).unwrap_or(false)
}

/// Open a child that is closed when the returned guard drops
///
/// The guard may be held across `.await` points.
pub fn enter(signature: &str) -> TaskScope {
    let armed = is_active();
    start(signature);
    TaskScope { armed }
}

/// Closes the node opened by [`enter`]
#[must_use = "dropping the guard immediately closes the node; bind it with `let _scope = ...`"]
pub struct TaskScope {
    armed: bool,
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        if self.armed {
            if let Some(tree) = stop() {
                tree.recycle();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_stack::Profiler;
    use crate::pool::NodePool;
    use apm_types::ManualClock;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_functions_are_noops_outside_scope() {
        start("nothing");
        add_io_call("nothing", 1);
        assert!(stop().is_none());
        assert!(!is_active());
    }

    #[tokio::test]
    async fn test_scope_records_nested_calls() {
        let clock = Arc::new(ManualClock::new());
        let profiler = Profiler::new(Arc::new(NodePool::new(true)), clock.clone(), 0);
        let mut stack = profiler.call_stack();
        stack.activate("task").unwrap();

        let (mut stack, value) = scope_call_stack(stack, async {
            assert!(is_active());
            {
                let _scope = enter("fetch");
                clock.advance_millis(4);
                tokio::task::yield_now().await;
                add_io_call("GET http://backend/", 1_000_000);
            }
            42
        })
        .await;

        assert_eq!(value, 42);
        clock.advance_millis(1);
        let tree = stack.stop().unwrap();
        let snapshot = tree.snapshot().unwrap();

        assert_eq!(snapshot.execution_time, 5_000_000);
        assert_eq!(snapshot.children.len(), 1);
        assert_eq!(snapshot.children[0].signature, "fetch");
        assert_eq!(snapshot.children[0].children[0].signature, "GET http://backend/");
        assert!(snapshot.children[0].children[0].io_call);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stack_travels_with_spawned_task() {
        let profiler = Profiler::with_defaults();
        let mut stack = profiler.call_stack();
        stack.activate("spawned").unwrap();

        let handle = tokio::spawn(scope_call_stack(stack, async {
            for _ in 0..10 {
                start("step");
                tokio::task::yield_now().await;
                stop();
            }
            is_active()
        }));

        let (mut stack, still_active) = handle.await.unwrap();
        assert!(still_active);
        assert!(stack.stop().is_some());
    }

    #[tokio::test]
    async fn test_take_and_restore_call_stack() {
        let profiler = Profiler::with_defaults();
        let mut stack = profiler.call_stack();
        stack.activate("task").unwrap();

        let (mut stack, depth) = scope_call_stack(stack, async {
            let mut taken = take_call_stack().unwrap();
            assert!(!is_active());
            assert!(take_call_stack().is_none());

            taken.start("borrowed");
            tokio::task::yield_now().await;
            taken.stop();
            restore_call_stack(taken);

            with_call_stack(|stack| stack.depth())
        })
        .await;

        assert_eq!(depth, Some(1));
        assert!(stack.stop().is_some());
    }

    #[tokio::test]
    async fn test_take_outside_scope() {
        assert!(take_call_stack().is_none());

        let profiler = Profiler::with_defaults();
        let mut stack = profiler.call_stack();
        stack.activate("orphan").unwrap();
        restore_call_stack(stack);
        assert_eq!(profiler.pool().available(), 1);
    }

    #[test]
    fn test_scope_on_blocking_executor() {
        let profiler = Profiler::with_defaults();
        let stack = profiler.call_stack();

        let (stack, active) = tokio_test::block_on(scope_call_stack(stack, async { is_active() }));

        assert!(!active);
        assert!(!stack.is_active());
    }
}

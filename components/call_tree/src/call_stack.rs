//! Per-execution call stack and the process-wide profiler handle
//!
//! A [`Profiler`] is created once per process and hands out [`CallStack`]s.
//! Each monitored execution owns exactly one `CallStack`, which is passed
//! explicitly to every instrumented call site (or carried through a task's
//! context, see [`crate::task_context`]). Instrumented code calls
//! [`CallStack::start`] / [`CallStack::stop`] in matched pairs; both are
//! no-ops while the stack is inactive, which is the fast path for every
//! unsampled execution.

use apm_types::{Clock, MonotonicClock, ProfilerConfig, ProfilerError, Result};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::node::NodeRef;
use crate::pool::NodePool;
use crate::tree::CallTree;

/// Process-wide profiler state shared by all call stacks
pub struct Profiler {
    pool: Arc<NodePool>,
    clock: Arc<dyn Clock>,
    min_execution_time_nanos: AtomicU64,
}

impl Profiler {
    /// Create a profiler
    ///
    /// # Arguments
    ///
    /// * `pool` - node pool shared by all trees
    /// * `clock` - time source for node durations
    /// * `min_execution_time_nanos` - live pruning threshold
    pub fn new(pool: Arc<NodePool>, clock: Arc<dyn Clock>, min_execution_time_nanos: u64) -> Arc<Self> {
        Arc::new(Self {
            pool,
            clock,
            min_execution_time_nanos: AtomicU64::new(min_execution_time_nanos),
        })
    }

    /// Create a profiler from configuration, using the given clock
    pub fn from_config(config: &ProfilerConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::new(
            Arc::new(NodePool::new(config.pooling_enabled())),
            clock,
            config.min_execution_time_nanos(),
        )
    }

    /// Create a profiler with the default configuration and a monotonic clock
    pub fn with_defaults() -> Arc<Self> {
        Self::from_config(&ProfilerConfig::default(), Arc::new(MonotonicClock::new()))
    }

    /// Create an inactive call stack bound to this profiler
    pub fn call_stack(self: &Arc<Self>) -> CallStack {
        CallStack {
            profiler: Arc::clone(self),
            tree: None,
            current: None,
            min_execution_time_nanos: self.min_execution_time_nanos(),
        }
    }

    /// Node pool shared by all trees
    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// Time source
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Live pruning threshold for trees activated from now on
    pub fn min_execution_time_nanos(&self) -> u64 {
        self.min_execution_time_nanos.load(Ordering::Relaxed)
    }

    /// Change the live pruning threshold; running trees keep theirs
    pub fn set_min_execution_time_nanos(&self, nanos: u64) {
        debug!("Setting minimum execution time to {} ns", nanos);
        self.min_execution_time_nanos.store(nanos, Ordering::Relaxed);
    }
}

/// Lifecycle state of a call stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStackState {
    /// Not profiling
    Inactive,
    /// Only the root is open
    RootOpen,
    /// At least one node below the root is open
    NestedOpen,
}

/// Cursor into the tree of one monitored execution
pub struct CallStack {
    profiler: Arc<Profiler>,
    tree: Option<CallTree>,
    current: Option<NodeRef>,
    min_execution_time_nanos: u64,
}

impl CallStack {
    /// Start recording a new tree
    ///
    /// Fails with [`ProfilerError::AlreadyActive`] unless the stack is inactive.
    pub fn activate(&mut self, root_signature: &str) -> Result<NodeRef> {
        if self.is_active() {
            return Err(ProfilerError::AlreadyActive(
                self.current_signature().unwrap_or_default().to_string(),
            ));
        }
        self.min_execution_time_nanos = self.profiler.min_execution_time_nanos();
        let tree = CallTree::new(
            root_signature,
            Arc::clone(&self.profiler.pool),
            Arc::clone(&self.profiler.clock),
        );
        let root = tree.root();
        self.tree = Some(tree);
        self.current = Some(root);
        Ok(root)
    }

    /// Open a child of the current node; no-op while inactive
    pub fn start(&mut self, signature: &str) {
        let (Some(tree), Some(current)) = (self.tree.as_mut(), self.current) else {
            return;
        };
        match tree.open(current, signature) {
            Ok(node) => self.current = Some(node),
            Err(e) => debug!("Ignoring start({}): {}", signature, e),
        }
    }

    /// Close the current node; no-op while inactive
    ///
    /// Returns the finished tree when the root was closed, after which the
    /// stack is inactive again.
    pub fn stop(&mut self) -> Option<CallTree> {
        self.stop_inner(None)
    }

    /// Close the current node, renaming it first
    pub fn stop_with_signature(&mut self, signature: &str) -> Option<CallTree> {
        self.stop_inner(Some(signature))
    }

    fn stop_inner(&mut self, signature: Option<&str>) -> Option<CallTree> {
        let current = self.current?;
        let tree = self.tree.as_mut()?;
        let parent = tree.get(current).and_then(|n| n.parent());

        if let Err(e) = tree.close(current, signature, self.min_execution_time_nanos) {
            debug!("Call stack out of sync, clearing it: {}", e);
            self.deactivate();
            return None;
        }

        match parent {
            Some(parent) => {
                self.current = Some(parent);
                None
            }
            None => {
                self.current = None;
                self.tree.take()
            }
        }
    }

    /// Rename the innermost open node
    ///
    /// Fails with [`ProfilerError::NotActive`] while no tree is recorded.
    pub fn set_current_signature(&mut self, signature: &str) -> Result<()> {
        let (Some(tree), Some(current)) = (self.tree.as_mut(), self.current) else {
            return Err(ProfilerError::NotActive);
        };
        tree.set_signature(current, signature)
    }

    /// Record an already-measured leaf below the current node; no-op while inactive
    ///
    /// Leaves faster than the minimum duration are not recorded, exactly as
    /// if they had been opened and closed.
    pub fn add_io_call(&mut self, description: &str, duration_nanos: u64) {
        let (Some(tree), Some(current)) = (self.tree.as_mut(), self.current) else {
            return;
        };
        if duration_nanos < self.min_execution_time_nanos {
            return;
        }
        if let Err(e) = tree.add_io_call(current, description, duration_nanos) {
            debug!("Ignoring io call {}: {}", description, e);
        }
    }

    /// Open a child that is closed when the returned guard drops
    ///
    /// The guard derefs to the stack, so nested scopes compose:
    ///
    /// ```
    /// use call_tree::Profiler;
    ///
    /// let profiler = Profiler::with_defaults();
    /// let mut stack = profiler.call_stack();
    /// stack.activate("job").unwrap();
    /// {
    ///     let mut outer = stack.scope("load");
    ///     let _inner = outer.scope("parse");
    /// }
    /// assert!(stack.stop().is_some());
    /// ```
    pub fn scope(&mut self, signature: &str) -> ScopeGuard<'_> {
        let armed = self.is_active();
        self.start(signature);
        ScopeGuard { stack: self, armed }
    }

    /// Whether a tree is being recorded
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Current lifecycle state
    pub fn state(&self) -> CallStackState {
        match (self.current, self.tree.as_ref()) {
            (Some(current), Some(tree)) if current == tree.root() => CallStackState::RootOpen,
            (Some(_), Some(_)) => CallStackState::NestedOpen,
            _ => CallStackState::Inactive,
        }
    }

    /// Number of open nodes
    pub fn depth(&self) -> usize {
        match (self.current, self.tree.as_ref()) {
            (Some(current), Some(tree)) => tree.depth(current) + 1,
            _ => 0,
        }
    }

    /// Signature of the innermost open node
    pub fn current_signature(&self) -> Option<&str> {
        let tree = self.tree.as_ref()?;
        tree.get(self.current?).map(|n| n.signature())
    }

    /// The tree being recorded
    pub fn tree(&self) -> Option<&CallTree> {
        self.tree.as_ref()
    }

    /// Profiler this stack belongs to
    pub fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    /// Force the stack back to inactive, recycling any partial tree
    pub fn deactivate(&mut self) {
        self.current = None;
        if let Some(tree) = self.tree.take() {
            tree.recycle();
        }
    }

    /// Move the recording state into a new stack, leaving this one inactive
    pub fn take(&mut self) -> CallStack {
        CallStack {
            profiler: Arc::clone(&self.profiler),
            tree: self.tree.take(),
            current: self.current.take(),
            min_execution_time_nanos: self.min_execution_time_nanos,
        }
    }
}

/// Closes the node opened by [`CallStack::scope`] on every exit path
#[must_use = "dropping the guard immediately closes the node; bind it with `let _scope = ...`"]
pub struct ScopeGuard<'a> {
    stack: &'a mut CallStack,
    armed: bool,
}

impl Deref for ScopeGuard<'_> {
    type Target = CallStack;

    fn deref(&self) -> &CallStack {
        self.stack
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut CallStack {
        self.stack
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(tree) = self.stack.stop() {
            debug!("Scope guard closed the root node; discarding the tree");
            tree.recycle();
        }
    }
}

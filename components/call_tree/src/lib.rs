//! Call tree recording engine
//!
//! This crate records, for one monitored execution at a time, a tree of
//! nested operations with self-time and total-time breakdowns.
//!
//! # Features
//!
//! - **CallTree**: generation-checked arena of [`CallNode`]s with live and
//!   post-hoc pruning of fast calls
//! - **NodePool**: shared free list that recycles nodes between trees
//! - **CallStack**: per-execution cursor with `start`/`stop` push/pop
//!   semantics that are no-ops while profiling is inactive
//! - **TreeRenderer**: indented, percentage-annotated text rendering
//! - **task_context**: call stack propagation through async tasks
//!
//! # Example
//!
//! ```
//! use call_tree::{Profiler, TreeRenderer};
//!
//! let profiler = Profiler::with_defaults();
//! let mut stack = profiler.call_stack();
//!
//! stack.activate("GET /orders").unwrap();
//! stack.start("loadOrders");
//! stack.add_io_call("SELECT * FROM orders", 2_000_000);
//! stack.stop();
//! let tree = stack.stop().expect("root closed");
//!
//! println!("{}", TreeRenderer::new(true).render(&tree));
//! tree.recycle();
//! ```

mod call_stack;
mod node;
mod pool;
mod renderer;
pub mod task_context;
mod tree;

pub use call_stack::{CallStack, CallStackState, Profiler, ScopeGuard};
pub use node::{CallNode, CallTreeSnapshot, NodeRef};
pub use pool::NodePool;
pub use renderer::TreeRenderer;
pub use tree::{CallTree, CloseOutcome};

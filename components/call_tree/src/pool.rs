//! Node recycling pool
//!
//! Recording a tree on every sampled execution would otherwise allocate a
//! node (plus its signature and children buffers) per instrumented call.
//! The pool keeps released nodes around and hands them out again, buffers
//! included. It grows without bound and never evicts.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::node::CallNode;

/// Shared free list of [`CallNode`] values
#[derive(Debug)]
pub struct NodePool {
    /// Whether released nodes are kept for reuse
    enabled: bool,
    /// Released nodes, already reset
    free: Mutex<Vec<CallNode>>,
    /// Nodes created from scratch
    allocated: AtomicU64,
    /// Nodes served from the free list
    reused: AtomicU64,
}

impl NodePool {
    /// Create a pool
    ///
    /// # Arguments
    ///
    /// * `enabled` - when false, `acquire` always allocates and released
    ///   nodes are simply dropped
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            free: Mutex::new(Vec::new()),
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Whether released nodes are reused
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Hand out a blank node, reusing a released one when available
    pub fn acquire(&self) -> CallNode {
        if self.enabled {
            if let Some(node) = self.free.lock().pop() {
                self.reused.fetch_add(1, Ordering::Relaxed);
                return node;
            }
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        CallNode::default()
    }

    /// Take a node back. Only called by the tree while recycling, after the
    /// node has been unlinked from every other node.
    pub(crate) fn release(&self, mut node: CallNode) {
        if !self.enabled {
            return;
        }
        node.reset();
        self.free.lock().push(node);
    }

    /// Number of nodes waiting in the free list
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of nodes created from scratch so far
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of acquisitions served from the free list so far
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

impl Default for NodePool {
    fn default() -> Self {
        Self::new(true)
    }
}

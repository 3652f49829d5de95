//! Call tree arena
//!
//! A [`CallTree`] owns every node recorded for one execution. Nodes are
//! stored in slots and addressed by [`NodeRef`] handles; removing a node
//! bumps its slot's generation and hands the node back to the
//! [`NodePool`], so stale handles are detected instead of aliasing a
//! recycled node. Dropping the tree recycles all remaining nodes.

use apm_types::{Clock, ProfilerError, Result};
use std::fmt;
use std::sync::Arc;

use crate::node::{CallNode, CallTreeSnapshot, NodeRef};
use crate::pool::NodePool;

/// What happened to a node when it was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The node stays in the tree
    Kept,
    /// The node was faster than the minimum duration and was discarded
    Pruned,
}

struct Slot {
    generation: u32,
    node: Option<CallNode>,
}

/// Arena holding the nodes of one execution's call tree
pub struct CallTree {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    root: NodeRef,
    pool: Arc<NodePool>,
    clock: Arc<dyn Clock>,
}

impl CallTree {
    /// Open a new tree whose root starts now
    pub fn new(root_signature: &str, pool: Arc<NodePool>, clock: Arc<dyn Clock>) -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            root: NodeRef {
                index: 0,
                generation: 0,
            },
            pool,
            clock,
        };
        let mut node = tree.pool.acquire();
        node.signature.push_str(root_signature);
        node.start = tree.clock.now_nanos();
        tree.root = tree.insert(node);
        tree
    }

    fn insert(&mut self, node: CallNode) -> NodeRef {
        match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeRef {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeRef {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Resolve a handle; `None` when the node has been recycled
    pub fn get(&self, node: NodeRef) -> Option<&CallNode> {
        self.slots
            .get(node.index as usize)
            .filter(|slot| slot.generation == node.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, node: NodeRef) -> Option<&mut CallNode> {
        self.slots
            .get_mut(node.index as usize)
            .filter(|slot| slot.generation == node.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn node_mut(&mut self, node: NodeRef) -> Result<&mut CallNode> {
        self.get_mut(node).ok_or(ProfilerError::StaleNode {
            index: node.index,
            generation: node.generation,
        })
    }

    /// Handle of the root node
    pub fn root(&self) -> NodeRef {
        self.root
    }

    /// The root node
    pub fn root_node(&self) -> Option<&CallNode> {
        self.get(self.root)
    }

    /// Gross duration of the root, zero while it is still open
    pub fn total_execution_time_nanos(&self) -> u64 {
        self.root_node().map_or(0, CallNode::execution_time_nanos)
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    /// Whether the tree has no live nodes (never true for a fresh tree)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Children of a node in call order, resolved
    pub fn children(&self, node: NodeRef) -> impl Iterator<Item = (NodeRef, &CallNode)> + '_ {
        self.get(node)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(move |child| self.get(*child).map(|c| (*child, c)))
    }

    /// Whether the node is the last child of its parent; true for the root
    pub fn is_last_child(&self, node: NodeRef) -> bool {
        match self.get(node).and_then(|n| n.parent).and_then(|p| self.get(p)) {
            Some(parent) => parent.children.last() == Some(&node),
            None => true,
        }
    }

    /// Number of ancestors of the node
    pub fn depth(&self, node: NodeRef) -> usize {
        let mut depth = 0;
        let mut current = self.get(node).and_then(|n| n.parent);
        while let Some(parent) = current {
            depth += 1;
            current = self.get(parent).and_then(|n| n.parent);
        }
        depth
    }

    /// Handles of the subtree below (and including) `from`, in pre-order
    pub fn preorder(&self, from: NodeRef) -> Vec<NodeRef> {
        let mut order = Vec::with_capacity(self.len());
        let mut pending = vec![from];
        while let Some(node) = pending.pop() {
            if let Some(n) = self.get(node) {
                order.push(node);
                pending.extend(n.children.iter().rev().copied());
            }
        }
        order
    }

    /// Open a child of `parent`, starting now
    pub fn open(&mut self, parent: NodeRef, signature: &str) -> Result<NodeRef> {
        self.node_mut(parent)?;
        let mut node = self.pool.acquire();
        node.signature.push_str(signature);
        node.start = self.clock.now_nanos();
        node.parent = Some(parent);
        let child = self.insert(node);
        self.node_mut(parent)?.children.push(child);
        Ok(child)
    }

    /// Close a node, fixing its duration
    ///
    /// A non-root node faster than `min_execution_time_nanos` is removed
    /// together with its subtree, and its time stays in the parent's net
    /// time. Otherwise its gross time is subtracted from the parent's net.
    pub fn close(
        &mut self,
        node: NodeRef,
        signature: Option<&str>,
        min_execution_time_nanos: u64,
    ) -> Result<CloseOutcome> {
        let now = self.clock.now_nanos();
        let (parent, execution_time) = {
            let n = self.node_mut(node)?;
            n.execution_time = now.saturating_sub(n.start);
            n.net_execution_time = closed_net(n.execution_time, n.net_execution_time);
            n.closed = true;
            if let Some(signature) = signature {
                n.signature.clear();
                n.signature.push_str(signature);
            }
            (n.parent, n.execution_time)
        };

        let Some(parent) = parent else {
            return Ok(CloseOutcome::Kept);
        };

        if execution_time < min_execution_time_nanos {
            self.detach(parent, node);
            self.free_subtree(node);
            return Ok(CloseOutcome::Pruned);
        }

        self.node_mut(parent)?.charge_child(execution_time);
        Ok(CloseOutcome::Kept)
    }

    /// Record an already-measured leaf below `parent`
    pub fn add_io_call(&mut self, parent: NodeRef, description: &str, duration_nanos: u64) -> Result<NodeRef> {
        self.node_mut(parent)?;
        let mut node = self.pool.acquire();
        node.signature.push_str(description);
        node.start = self.clock.now_nanos().saturating_sub(duration_nanos);
        node.execution_time = duration_nanos;
        node.net_execution_time = duration_nanos;
        node.is_io_call = true;
        node.closed = true;
        node.parent = Some(parent);
        let child = self.insert(node);

        let p = self.node_mut(parent)?;
        p.children.push(child);
        p.charge_child(duration_nanos);
        Ok(child)
    }

    /// Replace a node's signature
    pub fn set_signature(&mut self, node: NodeRef, signature: &str) -> Result<()> {
        let n = self.node_mut(node)?;
        n.signature.clear();
        n.signature.push_str(signature);
        Ok(())
    }

    /// Drop every closed descendant faster than the threshold
    ///
    /// The removed time is credited back to the parent's net time, which
    /// leaves the tree exactly as live pruning at the same threshold would
    /// have. Applying the same threshold twice changes nothing.
    pub fn remove_calls_faster_than(&mut self, threshold_nanos: u64) {
        let mut pending = vec![self.root];
        while let Some(node) = pending.pop() {
            let children = match self.get_mut(node) {
                Some(n) => std::mem::take(&mut n.children),
                None => continue,
            };

            let mut kept = Vec::with_capacity(children.len());
            let mut credited = 0u64;
            for child in children {
                let verdict = self
                    .get(child)
                    .map(|c| (c.closed && c.execution_time < threshold_nanos, c.execution_time));
                match verdict {
                    Some((true, execution_time)) => {
                        credited = credited.wrapping_add(execution_time);
                        self.free_subtree(child);
                    }
                    Some((false, _)) => {
                        kept.push(child);
                        pending.push(child);
                    }
                    None => {}
                }
            }

            let kept_time = kept
                .iter()
                .filter_map(|child| self.get(*child))
                .fold(0u64, |total, c| total.saturating_add(c.execution_time));
            if let Some(n) = self.get_mut(node) {
                n.children = kept;
                n.net_execution_time = if n.closed {
                    n.execution_time.saturating_sub(kept_time)
                } else {
                    n.net_execution_time.wrapping_add(credited)
                };
            }
        }
    }

    /// Return every node to the pool
    ///
    /// Equivalent to dropping the tree; spelled out where the hand-back is
    /// the point.
    pub fn recycle(self) {
        drop(self);
    }

    /// Owned copy of the whole tree
    pub fn snapshot(&self) -> Option<CallTreeSnapshot> {
        self.snapshot_from(self.root)
    }

    /// Owned copy of the subtree below `node`
    pub fn snapshot_from(&self, node: NodeRef) -> Option<CallTreeSnapshot> {
        let n = self.get(node)?;
        Some(CallTreeSnapshot {
            signature: n.signature.clone(),
            execution_time: n.execution_time,
            net_execution_time: n.net_execution_time,
            io_call: n.is_io_call,
            children: n
                .children
                .iter()
                .filter_map(|child| self.snapshot_from(*child))
                .collect(),
        })
    }

    fn detach(&mut self, parent: NodeRef, node: NodeRef) {
        if let Some(p) = self.get_mut(parent) {
            if p.children.last() == Some(&node) {
                p.children.pop();
            } else {
                p.children.retain(|child| *child != node);
            }
        }
    }

    fn free_subtree(&mut self, node: NodeRef) {
        let mut pending = vec![node];
        while let Some(current) = pending.pop() {
            let Some(slot) = self.slots.get_mut(current.index as usize) else {
                continue;
            };
            if slot.generation != current.generation {
                continue;
            }
            if let Some(n) = slot.node.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.vacant.push(current.index);
                pending.extend(n.children.iter().copied());
                self.pool.release(n);
            }
        }
    }
}

impl CallNode {
    /// Take a finished child's gross time out of this node's net time
    fn charge_child(&mut self, nanos: u64) {
        self.net_execution_time = if self.closed {
            self.net_execution_time.saturating_sub(nanos)
        } else {
            self.net_execution_time.wrapping_sub(nanos)
        };
    }
}

/// Net time of a node closing after `execution_time`
///
/// While open, `pending` holds minus the children's time (wrapped). Children
/// measured elsewhere, such as io calls, can add up to more than the node's
/// own duration; the net time then bottoms out at zero.
fn closed_net(execution_time: u64, pending: u64) -> u64 {
    let net = execution_time.wrapping_add(pending);
    if net > execution_time {
        0
    } else {
        net
    }
}

impl Drop for CallTree {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(node) = slot.node.take() {
                self.pool.release(node);
            }
        }
    }
}

impl fmt::Debug for CallTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTree")
            .field("root", &self.root)
            .field("len", &self.len())
            .field("total_execution_time_nanos", &self.total_execution_time_nanos())
            .finish()
    }
}

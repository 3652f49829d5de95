//! Call node value type and generation-checked handles

use serde::{Deserialize, Serialize};

/// Handle to a node inside a [`CallTree`](crate::CallTree)
///
/// The generation changes every time the slot is recycled, so a handle that
/// outlives its node resolves to nothing instead of to a stranger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeRef {
    /// Arena slot of this handle
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the handle was issued for
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// One recorded operation in a call tree
#[derive(Debug, Default)]
pub struct CallNode {
    pub(crate) signature: String,
    pub(crate) start: u64,
    pub(crate) execution_time: u64,
    // Transiently "negative" (wrapped) while open: children subtract their
    // gross time before the node's own duration is added on close.
    pub(crate) net_execution_time: u64,
    pub(crate) children: Vec<NodeRef>,
    pub(crate) parent: Option<NodeRef>,
    pub(crate) is_io_call: bool,
    pub(crate) closed: bool,
}

impl CallNode {
    /// Human readable identifier of the operation
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Clock reading when the node was opened, in nanoseconds
    pub fn start_nanos(&self) -> u64 {
        self.start
    }

    /// Gross duration; zero until the node is closed
    pub fn execution_time_nanos(&self) -> u64 {
        self.execution_time
    }

    /// Duration exclusive of the children's gross time
    pub fn net_execution_time_nanos(&self) -> u64 {
        self.net_execution_time
    }

    /// Children in call order
    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }

    /// Parent handle, `None` for the root
    pub fn parent(&self) -> Option<NodeRef> {
        self.parent
    }

    /// Whether the node was recorded as an already-measured leaf
    pub fn is_io_call(&self) -> bool {
        self.is_io_call
    }

    /// Whether the node's duration is final
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Clear every field, keeping the signature and children buffers
    pub(crate) fn reset(&mut self) {
        self.signature.clear();
        self.start = 0;
        self.execution_time = 0;
        self.net_execution_time = 0;
        self.children.clear();
        self.parent = None;
        self.is_io_call = false;
        self.closed = false;
    }

    /// Whether the node carries no data (as handed out by the pool)
    pub fn is_blank(&self) -> bool {
        self.signature.is_empty()
            && self.start == 0
            && self.execution_time == 0
            && self.net_execution_time == 0
            && self.children.is_empty()
            && self.parent.is_none()
            && !self.is_io_call
            && !self.closed
    }
}

/// Owned, serializable copy of a finished (sub)tree
///
/// Reporters that need to keep a tree beyond the execution take a snapshot;
/// the arena itself is recycled as soon as reporting is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTreeSnapshot {
    /// Operation identifier
    pub signature: String,
    /// Gross duration in nanoseconds
    pub execution_time: u64,
    /// Duration exclusive of children in nanoseconds
    pub net_execution_time: u64,
    /// Whether this is an already-measured leaf
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub io_call: bool,
    /// Children in call order
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<CallTreeSnapshot>,
}

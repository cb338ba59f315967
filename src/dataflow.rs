//! Definition of draft dataflow graphs.
//!
//! This is a "blueprint": the user (or the iteration-body builder acting
//! for them) authors plain processing stages and the edges between them
//! here, with no envelope awareness anywhere. [`crate::compile`] rewrites
//! the blueprint into the executable, envelope-aware graph the host
//! engine schedules.
//!
//! Draft nodes never form a cycle on their own; a loop is closed only by
//! an explicit [`FeedbackEdge`], which the compiler binds after both of
//! its endpoints exist.

use std::fmt::Display;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::stage::LogicBuilder;
use crate::state::KeySelector;
use crate::state::StepId;
use crate::typeinfo::TypeDescriptor;

/// Identifies one node of a draft graph and its translated counterpart.
///
/// Ids are the node's position in declaration order.
#[derive(
    Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub usize);

impl Display for NodeId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        self.0.fmt(fmt)
    }
}

// `CompileError::DanglingFeedback` has a field named `source`, which the
// `thiserror` derive unconditionally treats as the error source and
// requires to implement `std::error::Error`. Supplying this (trivial,
// default-method) impl satisfies that derive-imposed bound without
// renaming the spec-named field. `CompileError::source()` is never
// invoked, so no error-source chain behavior is observable.
impl std::error::Error for NodeId {}

/// How this stage's executable may be fused with its neighbors.
///
/// Copied verbatim onto the translated node; the host's chaining pass is
/// the consumer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Chaining {
    /// Fuse with the upstream operator whenever the host allows it.
    Always,
    /// Never fuse.
    Never,
    /// Start a new chain here; downstream operators may fuse onto it.
    Head,
}

/// Which inputs a stage declares.
///
/// This is a closed set: translation dispatches exhaustively over it, so
/// an unsupported shape is unrepresentable rather than a runtime error.
/// Channel numbering follows declaration order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputShape {
    /// No upstream node: fed from outside the loop on channel 0,
    /// typically with [`crate::record::Envelope::initial`]-wrapped
    /// payloads.
    Source,
    /// One regular input.
    OneInput(NodeId),
    /// Two regular inputs.
    TwoInput(NodeId, NodeId),
    /// One regular input (channel 0) plus one broadcast input
    /// (channel 1); the broadcast side is routed through the side-input
    /// cache rather than directly into the stage.
    BroadcastPair { regular: NodeId, broadcast: NodeId },
}

impl InputShape {
    /// Number of input channels the wrapped executable is driven on.
    ///
    /// A source still has one channel, the external feed.
    pub fn arity(&self) -> usize {
        match self {
            Self::Source | Self::OneInput(..) => 1,
            Self::TwoInput(..) | Self::BroadcastPair { .. } => 2,
        }
    }

    /// Upstream node per channel, in channel order.
    pub fn upstreams(&self) -> Vec<NodeId> {
        match self {
            Self::Source => Vec::new(),
            Self::OneInput(upstream) => vec![*upstream],
            Self::TwoInput(first, second) => vec![*first, *second],
            Self::BroadcastPair { regular, broadcast } => vec![*regular, *broadcast],
        }
    }

    /// The channel guarded by the side-input cache, if any.
    pub fn broadcast_channel(&self) -> Option<usize> {
        match self {
            Self::BroadcastPair { .. } => Some(1),
            _ => None,
        }
    }
}

/// An edge closing a loop: output of `source` re-enters `target` on input
/// `channel`.
///
/// Declared separately from the target's [`InputShape`] reference so the
/// compiler knows the forward reference is intentional.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FeedbackEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub channel: usize,
}

/// One logical processing stage of a draft graph.
pub struct DraftNode<T> {
    pub name: StepId,
    pub shape: InputShape,
    /// Builds the stage instance, optionally from a prior snapshot.
    pub logic: LogicBuilder<T>,
    /// Descriptor for the stage's (unwrapped) output type.
    pub output_type: Arc<dyn TypeDescriptor<T>>,
    /// Key selector for keyed state, over the unwrapped payload.
    pub key_selector: Option<KeySelector<T>>,
    pub parallelism: usize,
    pub chaining: Chaining,
}

impl<T> DraftNode<T> {
    pub fn new(
        name: impl Into<StepId>,
        shape: InputShape,
        logic: LogicBuilder<T>,
        output_type: Arc<dyn TypeDescriptor<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            shape,
            logic,
            output_type,
            key_selector: None,
            parallelism: 1,
            chaining: Chaining::Always,
        }
    }

    /// Declare keyed state partitioned by this selector.
    pub fn with_key_selector(mut self, key_selector: KeySelector<T>) -> Self {
        self.key_selector = Some(key_selector);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_chaining(mut self, chaining: Chaining) -> Self {
        self.chaining = chaining;
        self
    }
}

/// A user-authored graph of draft nodes plus the feedback edges closing
/// its loops.
pub struct DraftGraph<T> {
    nodes: Vec<DraftNode<T>>,
    feedback: Vec<FeedbackEdge>,
}

impl<T> DraftGraph<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            feedback: Vec::new(),
        }
    }

    /// Append a stage; the returned id is what downstream shapes (and
    /// feedback edges) reference.
    pub fn add_node(&mut self, node: DraftNode<T>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Close a loop: `source`'s output re-enters `target` on `channel`.
    ///
    /// `target.shape` must reference `source` on that channel; the
    /// compiler verifies the two declarations agree.
    pub fn add_feedback(&mut self, source: NodeId, target: NodeId, channel: usize) {
        self.feedback.push(FeedbackEdge {
            source,
            target,
            channel,
        });
    }

    pub fn nodes(&self) -> &[DraftNode<T>] {
        &self.nodes
    }

    pub fn feedback(&self) -> &[FeedbackEdge] {
        &self.feedback
    }
}

impl<T> Default for DraftGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

//! Crate-wide error taxonomy.
//!
//! Nothing in here is retried internally. Every failure is surfaced
//! synchronously to whichever caller invoked the failing operation, with
//! enough context (node, channel, round) for the host's recovery layer to
//! restart the affected instance from its last committed snapshot. A
//! compile failure aborts the whole compilation before execution starts.

use thiserror::Error;

use crate::dataflow::NodeId;
use crate::record::Round;
use crate::state::StepId;

/// Errors a user stage can surface through [`crate::stage::StageLogic`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fatal problems found while compiling a draft graph.
///
/// These indicate a malformed draft, not a transient condition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// An edge references a node id the draft graph never defined.
    #[error("node {node} references unknown node {upstream}")]
    UnknownNode { node: NodeId, upstream: NodeId },

    /// A regular input's producer had not been translated yet when its
    /// consumer was reached. Regular inputs must be declared
    /// upstream-first; only feedback edges may point forward.
    #[error("node {node} consumes node {upstream} before it is translated")]
    UntranslatedUpstream { node: NodeId, upstream: NodeId },

    /// A feedback edge names an input its target never declared.
    #[error("feedback edge {source} -> {target}.{channel} does not match the target's inputs")]
    DanglingFeedback {
        source: NodeId,
        target: NodeId,
        channel: usize,
    },
}

/// Fatal runtime problems in one operator instance.
#[derive(Debug, Error)]
pub enum StepError {
    /// An upstream producer broke the channel contract: a record arrived
    /// for a round the channel had already completed, or an epoch went
    /// backwards. Masking this would corrupt round-boundary aggregation,
    /// so the instance fails instead.
    #[error("channel {channel} completed round {completed} but then delivered round {round}")]
    OrderViolation {
        channel: usize,
        round: Round,
        completed: Round,
    },

    /// Side-input cache sequence numbers were not contiguous during
    /// replay. Single-threaded delivery makes this unreachable unless a
    /// host precondition was violated.
    #[error("broadcast cache replay expected sequence {expected}, found {found}")]
    CacheOutOfOrder { expected: u64, found: u64 },

    /// The wrapped user stage failed.
    ///
    /// Surfaced unchanged (the original error is the `source`); retry
    /// semantics belong to the host's recovery mechanism, not this crate.
    #[error("user stage in step {step} failed")]
    Logic {
        step: StepId,
        #[source]
        source: BoxError,
    },
}

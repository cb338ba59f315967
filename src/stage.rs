//! The capability interface a user processing stage exposes.
//!
//! Impl [`StageLogic`] to create a stage which can be compiled into an
//! iterative dataflow. The stage works on unwrapped payloads and never
//! sees an envelope; [`crate::wrapper::OperatorWrapper`] owns the
//! instance, drives it, and handles all round bookkeeping around it. If
//! you fulfill this API you get snapshotting and round boundaries for
//! free.
//!
//! The general idea is that you pass a **logic builder** which takes any
//! previous snapshot of the stage's state and builds an instance of your
//! logic. The instance is then snapshotted whenever the host checkpoints.

use std::sync::Arc;

use crate::errors::BoxError;
use crate::record::Round;
use crate::state::StateBytes;

/// A user processing stage, unaware of rounds.
///
/// A separate instance exists per parallel subtask (and is rebuilt per
/// key partition by the host's sharding); instances never communicate
/// except through the channels the graph defines.
pub trait StageLogic<T> {
    /// Process one payload delivered on input channel `channel`.
    ///
    /// Returned values are emitted downstream in order, stamped by the
    /// wrapper with the instance's current round.
    fn process(&mut self, channel: usize, payload: T) -> Result<Vec<T>, BoxError>;

    /// Round-boundary hook: called once per round, after every input
    /// channel has completed it.
    ///
    /// Per-round aggregation or finalization logic runs here. Returned
    /// values are emitted stamped with `round`, just before the epoch
    /// marker for `round` is forwarded downstream.
    ///
    /// The default does nothing, for stages with no per-round logic.
    fn round_complete(&mut self, round: Round) -> Result<Vec<T>, BoxError> {
        let _ = round;
        Ok(Vec::new())
    }

    /// Snapshot the internal state of this stage.
    ///
    /// Serialize everything the logic builder needs to reconstruct the
    /// stage exactly as it currently is. Called by the wrapper at
    /// checkpoint time; must be safe between any two deliveries.
    fn snapshot(&self) -> StateBytes;
}

/// Builds a stage instance, optionally from the last snapshot of its
/// state.
///
/// Deserialization here is the reverse of [`StageLogic::snapshot`]. The
/// builder is called once per instance start: with `None` on a fresh
/// start, with `Some` exactly once before the first delivery after a
/// restore.
pub type LogicBuilder<T> = Arc<dyn Fn(Option<StateBytes>) -> Box<dyn StageLogic<T>> + Send + Sync>;

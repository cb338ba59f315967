//! Run round-based iterative computations on a one-pass streaming
//! engine.
//!
//! The host engine executes strictly acyclic, watermark-driven
//! dataflows; an iterative algorithm (gradient-descent rounds, iterative
//! graph propagation, ...) needs the same stages re-run over the same
//! data until a termination condition holds. This crate closes that gap
//! without touching the engine:
//!
//! - every element between stages travels in an
//!   [`record::Envelope`], either a payload stamped with its round or an
//!   epoch marker announcing a producer finished a round on a channel;
//! - a user-authored [`dataflow::DraftGraph`] of round-oblivious
//!   [`stage::StageLogic`] stages is rewritten by [`compile::compile`]
//!   into an [`compile::ActualGraph`] whose every executable is the stage
//!   behind a [`wrapper::OperatorWrapper`], preserving topology,
//!   parallelism, key partitioning, and chaining hints;
//! - broadcast side-inputs that arrive before their backing variable is
//!   materialized wait in a [`cache::BroadcastCache`] and replay in
//!   arrival order.
//!
//! Round completion propagates purely by message flow: each wrapper
//! forwards an epoch the moment all of its own inputs finished that
//! round, so global progress and termination fall out of the channel
//! traffic with no stage ever needing the whole topology.
//!
//! The engine's scheduler, checkpoint store, and transport stay external:
//! the host drives each wrapped instance by delivering envelopes and
//! control signals, and reads state only through `snapshot()`.

pub mod cache;
pub mod compile;
pub mod dataflow;
pub mod errors;
pub mod operators;
pub mod record;
pub mod stage;
pub mod state;
pub mod tracing;
pub mod typeinfo;
pub mod wrapper;

pub use crate::cache::BroadcastCache;
pub use crate::compile::compile;
pub use crate::compile::ActualGraph;
pub use crate::compile::ActualNode;
pub use crate::dataflow::DraftGraph;
pub use crate::dataflow::DraftNode;
pub use crate::dataflow::InputShape;
pub use crate::errors::CompileError;
pub use crate::errors::StepError;
pub use crate::record::Envelope;
pub use crate::record::Round;
pub use crate::stage::StageLogic;
pub use crate::state::StateBytes;
pub use crate::state::StateKey;
pub use crate::state::StepId;
pub use crate::typeinfo::EnvelopeTypeInfo;
pub use crate::typeinfo::TypeDescriptor;
pub use crate::wrapper::OperatorWrapper;

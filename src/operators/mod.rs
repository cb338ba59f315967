//! Ready-made [`crate::stage::StageLogic`] implementations.
//!
//! These are ordinary stages with full snapshot support; nothing in here
//! is special-cased by the wrapper or the compiler. They double as the
//! reference pattern for writing your own stages.

pub(crate) mod reduce_per_round;
pub(crate) mod stateful_map;

pub use reduce_per_round::ReducePerRoundLogic;
pub use stateful_map::StatefulMapLogic;

//! Implements the per-round reduce operator.

use crate::errors::BoxError;
use crate::record::Round;
use crate::stage::StageLogic;
use crate::state::StateBytes;

/// Two-input reduce that reports its aggregate at every round boundary.
///
/// Channel 0 carries control values: each passes through incremented, to
/// drive the next round of the loop. Channel 1 records fold into a
/// running sum, and the sum to date is emitted from the round-boundary
/// hook so a coordinator outside the loop can watch per-round progress
/// and decide termination.
pub struct ReducePerRoundLogic {
    sum: i64,
}

impl ReducePerRoundLogic {
    /// Returns a closure that can also deserialize the result of
    /// [`StageLogic::snapshot`].
    pub fn builder() -> impl Fn(Option<StateBytes>) -> Self {
        |resume_snapshot| {
            let sum = resume_snapshot.map(StateBytes::de::<i64>).unwrap_or(0);
            Self { sum }
        }
    }
}

impl StageLogic<i64> for ReducePerRoundLogic {
    fn process(&mut self, channel: usize, payload: i64) -> Result<Vec<i64>, BoxError> {
        match channel {
            0 => Ok(vec![payload + 1]),
            _ => {
                self.sum += payload;
                Ok(Vec::new())
            }
        }
    }

    fn round_complete(&mut self, _round: Round) -> Result<Vec<i64>, BoxError> {
        Ok(vec![self.sum])
    }

    fn snapshot(&self) -> StateBytes {
        StateBytes::ser(&self.sum)
    }
}

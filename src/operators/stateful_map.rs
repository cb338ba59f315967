//! Implements the stateful map operator.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::BoxError;
use crate::stage::StageLogic;
use crate::state::StateBytes;

/// Map over values one at a time, threading an accumulator between
/// calls.
///
/// The accumulator is built lazily on the first value and carried across
/// rounds; because it lives in the stage's declared state it survives
/// snapshot/restore.
pub struct StatefulMapLogic<T, A> {
    builder: Arc<dyn Fn() -> A + Send + Sync>,
    mapper: Arc<dyn Fn(A, T) -> (A, T) + Send + Sync>,
    acc: Option<A>,
}

impl<T, A> StatefulMapLogic<T, A>
where
    A: Serialize + DeserializeOwned + 'static,
{
    /// Returns a closure that can also deserialize the result of
    /// [`StageLogic::snapshot`].
    pub fn builder(
        builder: Arc<dyn Fn() -> A + Send + Sync>,
        mapper: Arc<dyn Fn(A, T) -> (A, T) + Send + Sync>,
    ) -> impl Fn(Option<StateBytes>) -> Self {
        move |resume_snapshot| {
            let acc = resume_snapshot.and_then(StateBytes::de::<Option<A>>);
            Self {
                builder: builder.clone(),
                mapper: mapper.clone(),
                acc,
            }
        }
    }
}

impl<T, A> StageLogic<T> for StatefulMapLogic<T, A>
where
    A: Serialize + DeserializeOwned + 'static,
{
    fn process(&mut self, _channel: usize, payload: T) -> Result<Vec<T>, BoxError> {
        let acc = self.acc.take().unwrap_or_else(|| (self.builder)());
        let (acc, out) = (self.mapper)(acc, payload);
        self.acc = Some(acc);
        Ok(vec![out])
    }

    fn snapshot(&self) -> StateBytes {
        StateBytes::ser(&self.acc)
    }
}

//! The runtime shim giving a host-agnostic stage round-awareness.
//!
//! An [`OperatorWrapper`] adapts a [`StageLogic`] (which expects and
//! emits unwrapped payloads) into an executable the rest of the compiled
//! graph can drive purely with [`Envelope`]s. The wrapper tracks the
//! current round per instance (and per key for keyed stages), fires the
//! stage's round-boundary hook once all input channels complete a round,
//! and re-wraps everything the stage emits. The stage itself never sees a
//! round except through that hook.
//!
//! Execution is single-threaded-cooperative per instance: one envelope or
//! control signal is processed to completion before the next is accepted,
//! and nothing here blocks waiting on another instance.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::cache::BroadcastCache;
use crate::cache::Offer;
use crate::errors::StepError;
use crate::record::Envelope;
use crate::record::Round;
use crate::stage::LogicBuilder;
use crate::stage::StageLogic;
use crate::state::KeySelector;
use crate::state::SnapshotReader;
use crate::state::SnapshotWriter;
use crate::state::StateBytes;
use crate::state::StateKey;
use crate::state::StepId;

/// Construction-time description of one wrapped instance.
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    pub step_id: StepId,
    /// Number of input channels the instance is driven on. Sources are
    /// driven on a single external channel.
    pub num_inputs: usize,
    /// Channel guarded by a [`BroadcastCache`], if the stage declares a
    /// broadcast input.
    pub broadcast_channel: Option<usize>,
}

/// One entry of the persisted round-tracking state.
///
/// The snapshot's first section is a sequence of `(RoundKey, Round)`
/// pairs; entries whose round was never set are simply absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum RoundKey {
    /// The instance-wide high-water mark outputs are stamped with.
    Current,
    /// The highest round the boundary hook has fired for.
    Fired,
    /// The highest round completed on one input channel.
    Channel(usize),
    /// The high-water mark for one state key of a keyed stage.
    Keyed(StateKey),
}

/// Runtime shim around one parallel instance of a user stage.
pub struct OperatorWrapper<T> {
    step_id: StepId,
    logic: Box<dyn StageLogic<T>>,
    key_selector: Option<KeySelector<T>>,
    /// Highest round completed per input channel.
    completed: Vec<Option<Round>>,
    /// Highest round the boundary hook has fired for.
    fired: Option<Round>,
    /// High-water mark of record rounds seen by this instance.
    current_round: Round,
    /// Per-key high-water marks, for keyed stages only.
    key_rounds: HashMap<StateKey, Round>,
    /// Guards the broadcast channel, when the stage declares one.
    broadcast: Option<(usize, BroadcastCache<T>)>,
}

impl<T> OperatorWrapper<T> {
    /// Build an instance, restoring from a snapshot if one is given.
    ///
    /// Restore happens here, exactly once, before the first delivery: the
    /// snapshot's round-tracking section is consumed first, then the
    /// stage section is handed to the logic builder, mirroring the order
    /// [`Self::snapshot`] writes them.
    pub fn build(
        config: WrapperConfig,
        key_selector: Option<KeySelector<T>>,
        logic_builder: &LogicBuilder<T>,
        resume_snapshot: Option<StateBytes>,
    ) -> Self {
        let mut completed = vec![None; config.num_inputs];
        let mut fired = None;
        let mut current_round = Round::ZERO;
        let mut key_rounds = HashMap::new();

        let stage_snapshot = resume_snapshot.map(|snapshot| {
            let mut reader = SnapshotReader::new(&snapshot);
            for (key, round) in reader.section().de::<Vec<(RoundKey, Round)>>() {
                match key {
                    RoundKey::Current => current_round = round,
                    RoundKey::Fired => fired = Some(round),
                    RoundKey::Channel(channel) => completed[channel] = Some(round),
                    RoundKey::Keyed(key) => {
                        key_rounds.insert(key, round);
                    }
                }
            }
            reader.section()
        });

        Self {
            step_id: config.step_id,
            logic: logic_builder(stage_snapshot),
            key_selector,
            completed,
            fired,
            current_round,
            key_rounds,
            broadcast: config
                .broadcast_channel
                .map(|channel| (channel, BroadcastCache::new())),
        }
    }

    /// Drive the instance with one envelope from the host.
    ///
    /// Returns the envelopes to forward downstream, in emission order.
    /// Arrivals on a guarded broadcast channel are held in the cache
    /// until the readiness signal.
    pub fn on_envelope(
        &mut self,
        channel: usize,
        envelope: Envelope<T>,
    ) -> Result<Vec<Envelope<T>>, StepError> {
        if let Some((guarded, cache)) = &mut self.broadcast {
            if channel == *guarded {
                return match cache.offer(envelope) {
                    Offer::Delivered(envelope) => self.apply(channel, envelope),
                    Offer::Buffered => Ok(Vec::new()),
                };
            }
        }
        self.apply(channel, envelope)
    }

    /// The broadcast variable backing the guarded channel is ready:
    /// replay the backlog through the stage in arrival order.
    pub fn on_broadcast_ready(&mut self) -> Result<Vec<Envelope<T>>, StepError> {
        let Some((channel, cache)) = &mut self.broadcast else {
            return Ok(Vec::new());
        };
        let channel = *channel;
        let backlog = cache.on_broadcast_ready()?;

        let mut out = Vec::new();
        for envelope in backlog {
            out.extend(self.apply(channel, envelope)?);
        }
        Ok(out)
    }

    /// Snapshot this instance: the round-tracking state, then the
    /// stage's own snapshot, as fixed-order length-prefixed sections.
    ///
    /// Safe to call between any two deliveries.
    pub fn snapshot(&self) -> StateBytes {
        let mut rounds = vec![(RoundKey::Current, self.current_round)];
        if let Some(fired) = self.fired {
            rounds.push((RoundKey::Fired, fired));
        }
        for (channel, completed) in self.completed.iter().enumerate() {
            if let Some(completed) = completed {
                rounds.push((RoundKey::Channel(channel), *completed));
            }
        }
        let mut keyed: Vec<_> = self.key_rounds.iter().collect();
        keyed.sort();
        rounds.extend(
            keyed
                .into_iter()
                .map(|(key, round)| (RoundKey::Keyed(key.clone()), *round)),
        );

        let mut writer = SnapshotWriter::new();
        writer.section(&StateBytes::ser(&rounds));
        writer.section(&self.logic.snapshot());
        writer.finish()
    }

    fn apply(&mut self, channel: usize, envelope: Envelope<T>) -> Result<Vec<Envelope<T>>, StepError> {
        match envelope {
            Envelope::Record { payload, round } => {
                if let Some(completed) = self.completed[channel] {
                    if completed >= round {
                        return Err(StepError::OrderViolation {
                            channel,
                            round,
                            completed,
                        });
                    }
                }
                self.current_round = self.current_round.max(round);

                // Keyed stages stamp outputs with the key's own round so
                // a slow key is not dragged forward by a fast one.
                let stamp = match &self.key_selector {
                    Some(selector) => {
                        let key = selector(&payload);
                        let tracked = self.key_rounds.entry(key).or_insert(round);
                        *tracked = (*tracked).max(round);
                        *tracked
                    }
                    None => self.current_round,
                };

                let span =
                    tracing::debug_span!("operator", operator = self.step_id.0.clone(), channel);
                let output = span
                    .in_scope(|| self.logic.process(channel, payload))
                    .map_err(|source| StepError::Logic {
                        step: self.step_id.clone(),
                        source,
                    })?;
                Ok(output
                    .into_iter()
                    .map(|payload| Envelope::Record {
                        payload,
                        round: stamp,
                    })
                    .collect())
            }
            Envelope::Epoch { round } => {
                if let Some(completed) = self.completed[channel] {
                    if round < completed {
                        return Err(StepError::OrderViolation {
                            channel,
                            round,
                            completed,
                        });
                    }
                }
                tracing::trace!(
                    operator = self.step_id.0.clone(),
                    channel,
                    round = round.0,
                    "channel completed round"
                );
                self.completed[channel] = Some(round);
                self.advance()
            }
        }
    }

    /// Fire the boundary hook for every round newly completed on all
    /// channels, in ascending order, each exactly once.
    ///
    /// Firing covers empty rounds too, so the outgoing epoch stream stays
    /// gapless however sparsely upstream epochs arrive.
    fn advance(&mut self) -> Result<Vec<Envelope<T>>, StepError> {
        let mut aligned = Round(u32::MAX);
        for completed in &self.completed {
            match completed {
                Some(round) => aligned = aligned.min(*round),
                None => return Ok(Vec::new()),
            }
        }

        let mut out = Vec::new();
        let mut round = match self.fired {
            Some(fired) => fired.next(),
            None => Round::ZERO,
        };
        while round <= aligned {
            tracing::trace!(
                operator = self.step_id.0.clone(),
                round = round.0,
                "round complete on all channels"
            );
            let finals = self
                .logic
                .round_complete(round)
                .map_err(|source| StepError::Logic {
                    step: self.step_id.clone(),
                    source,
                })?;
            out.extend(finals.into_iter().map(|payload| Envelope::Record {
                payload,
                round,
            }));
            out.push(Envelope::Epoch { round });
            self.fired = Some(round);
            round = round.next();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::errors::BoxError;

    fn config(step_id: &str, num_inputs: usize) -> WrapperConfig {
        WrapperConfig {
            step_id: StepId::from(step_id),
            num_inputs,
            broadcast_channel: None,
        }
    }

    fn record(payload: i64, round: u32) -> Envelope<i64> {
        Envelope::Record {
            payload,
            round: Round(round),
        }
    }

    fn epoch(round: u32) -> Envelope<i64> {
        Envelope::Epoch {
            round: Round(round),
        }
    }

    /// Stateless increment, any channel.
    struct Increment;

    impl StageLogic<i64> for Increment {
        fn process(&mut self, _channel: usize, payload: i64) -> Result<Vec<i64>, BoxError> {
            Ok(vec![payload + 1])
        }

        fn snapshot(&self) -> StateBytes {
            StateBytes::ser(&())
        }
    }

    fn increment_builder() -> LogicBuilder<i64> {
        Arc::new(|_resume| Box::new(Increment))
    }

    /// Sums everything it sees and reports the sum at each boundary.
    struct RunningSum {
        sum: i64,
    }

    impl StageLogic<i64> for RunningSum {
        fn process(&mut self, _channel: usize, payload: i64) -> Result<Vec<i64>, BoxError> {
            self.sum += payload;
            Ok(Vec::new())
        }

        fn round_complete(&mut self, _round: Round) -> Result<Vec<i64>, BoxError> {
            Ok(vec![self.sum])
        }

        fn snapshot(&self) -> StateBytes {
            StateBytes::ser(&self.sum)
        }
    }

    fn running_sum_builder() -> LogicBuilder<i64> {
        Arc::new(|resume| {
            let sum = resume.map(StateBytes::de::<i64>).unwrap_or(0);
            Box::new(RunningSum { sum })
        })
    }

    #[test]
    fn increment_scenario_preserves_order() {
        let mut wrapper =
            OperatorWrapper::build(config("inc", 1), None, &increment_builder(), None);

        let mut found = Vec::new();
        found.extend(wrapper.on_envelope(0, record(5, 0)).unwrap());
        found.extend(wrapper.on_envelope(0, record(6, 0)).unwrap());
        found.extend(wrapper.on_envelope(0, epoch(0)).unwrap());

        let expected = vec![record(6, 0), record(7, 0), epoch(0)];
        assert_eq!(found, expected);
    }

    #[test]
    fn record_after_closing_epoch_is_fatal() {
        let mut wrapper =
            OperatorWrapper::build(config("inc", 1), None, &increment_builder(), None);

        wrapper.on_envelope(0, record(1, 0)).unwrap();
        wrapper.on_envelope(0, epoch(1)).unwrap();

        let found = wrapper.on_envelope(0, record(2, 1));
        assert!(matches!(
            found,
            Err(StepError::OrderViolation {
                channel: 0,
                round: Round(1),
                completed: Round(1),
            }),
        ));
    }

    #[test]
    fn epoch_regression_is_fatal() {
        let mut wrapper =
            OperatorWrapper::build(config("inc", 1), None, &increment_builder(), None);

        wrapper.on_envelope(0, epoch(3)).unwrap();

        let found = wrapper.on_envelope(0, epoch(2));
        assert!(matches!(
            found,
            Err(StepError::OrderViolation {
                channel: 0,
                round: Round(2),
                completed: Round(3),
            }),
        ));
    }

    #[test]
    fn round_boundary_waits_for_every_channel() {
        let mut wrapper =
            OperatorWrapper::build(config("sum", 2), None, &running_sum_builder(), None);

        // Epoch on A alone must not fire the boundary.
        assert_eq!(wrapper.on_envelope(0, epoch(0)).unwrap(), Vec::new());
        wrapper.on_envelope(1, record(2, 0)).unwrap();
        wrapper.on_envelope(1, record(3, 0)).unwrap();
        wrapper.on_envelope(1, record(4, 0)).unwrap();

        // The second epoch completes the round: hook output, then the
        // epoch, exactly once.
        let found = wrapper.on_envelope(1, epoch(0)).unwrap();
        let expected = vec![record(9, 0), epoch(0)];
        assert_eq!(found, expected);

        // Nothing re-fires for the same round.
        assert_eq!(wrapper.on_envelope(0, epoch(1)).unwrap(), Vec::new());
    }

    #[test]
    fn epoch_jump_fires_each_skipped_round_once() {
        let mut wrapper =
            OperatorWrapper::build(config("sum", 1), None, &running_sum_builder(), None);

        wrapper.on_envelope(0, record(5, 0)).unwrap();
        let found = wrapper.on_envelope(0, epoch(2)).unwrap();

        let expected = vec![
            record(5, 0),
            epoch(0),
            record(5, 1),
            epoch(1),
            record(5, 2),
            epoch(2),
        ];
        assert_eq!(found, expected);
    }

    #[test]
    fn keyed_outputs_are_stamped_with_the_keys_round() {
        let selector: KeySelector<i64> = Arc::new(|payload| {
            StateKey::Hash(if payload % 2 == 0 { "even" } else { "odd" }.to_owned())
        });
        let mut wrapper = OperatorWrapper::build(
            config("inc", 1),
            Some(selector),
            &increment_builder(),
            None,
        );

        // The even key races ahead to round 2.
        let found = wrapper.on_envelope(0, record(4, 2)).unwrap();
        assert_eq!(found, vec![record(5, 2)]);

        // The odd key is still in round 0 and must not be dragged along.
        let found = wrapper.on_envelope(0, record(3, 0)).unwrap();
        assert_eq!(found, vec![record(4, 0)]);
    }

    #[test]
    fn snapshot_restore_reproduces_behavior() {
        let selector: KeySelector<i64> = Arc::new(|payload| {
            StateKey::Hash(if payload % 2 == 0 { "even" } else { "odd" }.to_owned())
        });
        let mut original = OperatorWrapper::build(
            config("sum", 2),
            Some(selector.clone()),
            &running_sum_builder(),
            None,
        );

        original.on_envelope(0, record(10, 0)).unwrap();
        original.on_envelope(1, record(7, 1)).unwrap();
        original.on_envelope(0, epoch(0)).unwrap();

        let mut restored = OperatorWrapper::build(
            config("sum", 2),
            Some(selector),
            &running_sum_builder(),
            Some(original.snapshot()),
        );

        // Identical suffix produces identical output from both.
        let suffix: Vec<(usize, Envelope<i64>)> = vec![
            (1, record(4, 1)),
            (0, record(5, 1)),
            (1, epoch(1)),
            (0, epoch(1)),
        ];
        for (channel, envelope) in suffix {
            let found = restored.on_envelope(channel, envelope.clone()).unwrap();
            let expected = original.on_envelope(channel, envelope).unwrap();
            assert_eq!(found, expected);
        }
    }

    #[test]
    fn broadcast_channel_holds_until_ready() {
        let config = WrapperConfig {
            step_id: StepId::from("model"),
            num_inputs: 2,
            broadcast_channel: Some(1),
        };
        let mut wrapper = OperatorWrapper::build(config, None, &increment_builder(), None);

        // The broadcast side arrives first and is held.
        assert_eq!(wrapper.on_envelope(1, record(100, 0)).unwrap(), Vec::new());
        assert_eq!(wrapper.on_envelope(1, record(200, 0)).unwrap(), Vec::new());

        // The regular side is unaffected.
        assert_eq!(
            wrapper.on_envelope(0, record(1, 0)).unwrap(),
            vec![record(2, 0)],
        );

        // Readiness replays the backlog through the stage in order.
        let found = wrapper.on_broadcast_ready().unwrap();
        let expected = vec![record(101, 0), record(201, 0)];
        assert_eq!(found, expected);

        // After readiness the channel is live.
        assert_eq!(
            wrapper.on_envelope(1, record(300, 0)).unwrap(),
            vec![record(301, 0)],
        );
    }

    #[test]
    fn user_stage_failure_propagates_with_context() {
        struct Failing;

        impl StageLogic<i64> for Failing {
            fn process(&mut self, _channel: usize, _payload: i64) -> Result<Vec<i64>, BoxError> {
                Err("poison payload".into())
            }

            fn snapshot(&self) -> StateBytes {
                StateBytes::ser(&())
            }
        }

        let builder: LogicBuilder<i64> = Arc::new(|_resume| Box::new(Failing));
        let mut wrapper = OperatorWrapper::build(config("fail", 1), None, &builder, None);

        let found = wrapper.on_envelope(0, record(1, 0));
        match found {
            Err(StepError::Logic { step, source }) => {
                assert_eq!(step, StepId::from("fail"));
                assert_eq!(source.to_string(), "poison payload");
            }
            other => panic!("expected a logic failure, got {other:?}"),
        }
    }
}

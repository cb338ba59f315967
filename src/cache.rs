//! Buffers broadcast side-input traffic arriving before the backing
//! broadcast variable is ready.
//!
//! A broadcast channel's variable is materialized asynchronously relative
//! to channel traffic, so envelopes can land on a consumer that cannot
//! process them yet. The cache holds those arrivals, each stamped with a
//! strictly increasing sequence number, and replays them in original
//! arrival order on the readiness signal. It never reorders, drops, or
//! duplicates.
//!
//! Readiness is **sticky**: after the first readiness signal, later
//! signals (a refreshed broadcast variable) are no-ops and nothing is
//! ever buffered again; arrivals keep flowing straight through.

use std::collections::VecDeque;

use crate::errors::StepError;
use crate::record::Envelope;

/// What [`BroadcastCache::offer`] did with an envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum Offer<T> {
    /// The variable is ready; deliver this to the stage now.
    Delivered(Envelope<T>),
    /// Held back until the readiness signal.
    Buffered,
}

/// Per-instance holding pen for one broadcast input channel.
#[derive(Debug)]
pub struct BroadcastCache<T> {
    ready: bool,
    next_seq: u64,
    buffer: VecDeque<(u64, Envelope<T>)>,
}

impl<T> BroadcastCache<T> {
    pub fn new() -> Self {
        Self {
            ready: false,
            next_seq: 0,
            buffer: VecDeque::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Hand the cache one arrival.
    ///
    /// Pass-through once ready, otherwise buffered in arrival order.
    pub fn offer(&mut self, envelope: Envelope<T>) -> Offer<T> {
        if self.ready {
            Offer::Delivered(envelope)
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            tracing::trace!(seq, "buffering broadcast arrival before readiness");
            self.buffer.push_back((seq, envelope));
            Offer::Buffered
        }
    }

    /// Mark the broadcast variable materialized and drain the backlog in
    /// ascending sequence order.
    ///
    /// Each buffered envelope comes back exactly once. Sequence numbers
    /// must replay contiguously from zero; a gap means the host violated
    /// single-threaded delivery and the instance must die rather than
    /// feed the stage reordered data.
    pub fn on_broadcast_ready(&mut self) -> Result<Vec<Envelope<T>>, StepError> {
        if self.ready {
            // Sticky policy: a refreshed variable changes nothing.
            return Ok(Vec::new());
        }
        self.ready = true;

        tracing::debug!(
            backlog = self.buffer.len(),
            "broadcast variable ready, replaying backlog"
        );
        let mut drained = Vec::with_capacity(self.buffer.len());
        for (expected, (seq, envelope)) in self.buffer.drain(..).enumerate() {
            let expected = expected as u64;
            if seq != expected {
                return Err(StepError::CacheOutOfOrder {
                    expected,
                    found: seq,
                });
            }
            drained.push(envelope);
        }
        Ok(drained)
    }
}

impl<T> Default for BroadcastCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::Round;

    fn record(payload: i64, round: u32) -> Envelope<i64> {
        Envelope::Record {
            payload,
            round: Round(round),
        }
    }

    #[test]
    fn replays_in_offer_order_across_readiness() {
        let mut cache = BroadcastCache::new();

        // Three arrivals before readiness, interleaved with a marker.
        assert_eq!(cache.offer(record(10, 0)), Offer::Buffered);
        assert_eq!(
            cache.offer(Envelope::Epoch { round: Round(0) }),
            Offer::Buffered,
        );
        assert_eq!(cache.offer(record(11, 1)), Offer::Buffered);

        let found = cache.on_broadcast_ready().unwrap();
        let expected = vec![
            record(10, 0),
            Envelope::Epoch { round: Round(0) },
            record(11, 1),
        ];
        assert_eq!(found, expected);

        // Two more after readiness pass straight through.
        assert_eq!(cache.offer(record(12, 1)), Offer::Delivered(record(12, 1)));
        assert_eq!(cache.offer(record(13, 1)), Offer::Delivered(record(13, 1)));
    }

    #[test]
    fn readiness_is_sticky() {
        let mut cache = BroadcastCache::new();

        cache.offer(record(1, 0));
        assert_eq!(cache.on_broadcast_ready().unwrap().len(), 1);

        // A refreshed variable is a no-op and nothing re-buffers.
        assert_eq!(cache.on_broadcast_ready().unwrap(), Vec::new());
        assert_eq!(cache.offer(record(2, 0)), Offer::Delivered(record(2, 0)));
    }

    #[test]
    fn replay_gap_is_fatal() {
        let mut cache = BroadcastCache::new();

        cache.offer(record(1, 0));
        cache.offer(record(2, 0));
        // Simulate a violated delivery precondition.
        cache.buffer.remove(0);

        let found = cache.on_broadcast_ready();
        assert!(matches!(
            found,
            Err(StepError::CacheOutOfOrder {
                expected: 0,
                found: 1,
            }),
        ));
    }
}

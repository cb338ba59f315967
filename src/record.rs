//! The tagged record model flowing along every compiled edge.
//!
//! Once a draft graph has been compiled, no raw user payload travels
//! between stages anymore: everything is an [`Envelope`], either one
//! payload stamped with the round it belongs to or an [`Envelope::Epoch`]
//! progress marker. Epochs are how round completion travels through an
//! arbitrarily deep graph without any stage needing global knowledge of
//! the topology.

use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

/// One cycle of an iterative computation.
///
/// Rounds are totally ordered and only ever advance.
#[derive(
    Debug, Copy, Clone, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Round(pub u32);

impl Round {
    /// The round all data is in before any feedback has happened.
    pub const ZERO: Round = Round(0);

    /// The round after this one.
    pub fn next(&self) -> Round {
        Round(self.0 + 1)
    }
}

impl Display for Round {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        self.0.fmt(fmt)
    }
}

/// The envelope around every element on a compiled edge.
///
/// Channel contract: per producer-consumer channel, epoch rounds are
/// non-decreasing and no `Record { round: r, .. }` may follow an
/// `Epoch { round: r' }` with `r' >= r`. The consuming wrapper surfaces a
/// violation as [`crate::errors::StepError::OrderViolation`] rather than
/// silently reordering.
///
/// An envelope has a single owner and is moved along the pipeline; it is
/// never shared mutably between stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope<T> {
    /// One user data element, produced in (and valid for) `round`.
    Record { payload: T, round: Round },
    /// All records for `round` from this producer have been emitted on
    /// this channel; nothing at `round` or below will follow.
    Epoch { round: Round },
}

impl<T> Envelope<T> {
    /// Wrap a payload entering the loop from the surrounding graph.
    ///
    /// External feeders know nothing about rounds; everything they hand
    /// in starts in round zero.
    pub fn initial(payload: T) -> Self {
        Self::Record {
            payload,
            round: Round::ZERO,
        }
    }

    /// The round this envelope is stamped with.
    pub fn round(&self) -> Round {
        match self {
            Self::Record { round, .. } => *round,
            Self::Epoch { round } => *round,
        }
    }

    /// Is this a progress marker rather than data?
    pub fn is_epoch(&self) -> bool {
        matches!(self, Self::Epoch { .. })
    }
}

#[test]
fn initial_wraps_at_round_zero() {
    let found: Vec<_> = (0..5).map(Envelope::initial).collect();

    let expected: Vec<_> = (0..5)
        .map(|payload| Envelope::Record {
            payload,
            round: Round(0),
        })
        .collect();
    assert_eq!(found, expected);
}

#[test]
fn round_accessor_covers_both_variants() {
    let record = Envelope::Record {
        payload: "x",
        round: Round(3),
    };
    let epoch: Envelope<&str> = Envelope::Epoch { round: Round(7) };

    assert_eq!(record.round(), Round(3));
    assert_eq!(epoch.round(), Round(7));
    assert!(!record.is_epoch());
    assert!(epoch.is_epoch());
}

//! Type descriptors for payloads and envelopes.
//!
//! The host engine needs to serialize, order, and hash everything that
//! crosses one of its channels. A [`TypeDescriptor`] bundles those
//! capabilities for one payload type; [`EnvelopeTypeInfo`] lifts a payload
//! descriptor over [`Envelope`] so a compiled edge can carry wrapped
//! traffic with no cooperation from the payload type itself.

use std::any::type_name;
use std::any::Any;
use std::cmp::Ordering;
use std::hash::Hash;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::sync::Arc;

use seahash::SeaHasher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::errors::BoxError;
use crate::record::Envelope;
use crate::record::Round;

/// Codec failures surfaced by a [`TypeDescriptor`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated input while decoding {ty}")]
    Truncated { ty: &'static str },

    #[error("unknown envelope discriminant {found}")]
    BadDiscriminant { found: u8 },

    #[error("payload codec failed for {ty}")]
    Payload {
        ty: &'static str,
        #[source]
        source: BoxError,
    },
}

/// Serialize/deserialize/compare/hash capabilities for a channel type.
///
/// Descriptors are compared structurally, not by identity: the engine's
/// operator-reuse logic treats two descriptors that claim equality as
/// interchangeable, so [`TypeDescriptor::eq_descriptor`] must only say
/// yes when the wire formats genuinely match.
///
/// Wire-format evolution is each descriptor's own responsibility;
/// wrapping descriptors propagate it unchanged.
pub trait TypeDescriptor<T>: Send + Sync {
    /// Append the serialized form of `value` to `out`.
    fn write(&self, value: &T, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Decode one value from the front of `input`, advancing it past the
    /// consumed bytes.
    fn read(&self, input: &mut &[u8]) -> Result<T, CodecError>;

    /// Total order used by the engine for sorting and merging.
    fn compare(&self, a: &T, b: &T) -> Ordering;

    /// Stable hash used for routing.
    fn hash(&self, value: &T) -> u64;

    /// Does `other` describe the same type with the same wire format?
    fn eq_descriptor(&self, other: &dyn Any) -> bool;

    /// Hash consistent with [`Self::eq_descriptor`].
    fn descriptor_hash(&self) -> u64;

    /// Self as [`Any`], for the other side of [`Self::eq_descriptor`].
    fn as_any(&self) -> &dyn Any;
}

/// Descriptor for any serde-able, ordered, hashable payload.
///
/// Backed by the same bincode encoding the snapshot layer uses; two
/// instances over the same `T` are always equal.
pub struct SerdeTypeInfo<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeTypeInfo<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeTypeInfo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SerdeTypeInfo<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "SerdeTypeInfo<{}>", type_name::<T>())
    }
}

impl<T> TypeDescriptor<T> for SerdeTypeInfo<T>
where
    T: Serialize + DeserializeOwned + Ord + Hash + 'static,
{
    fn write(&self, value: &T, out: &mut Vec<u8>) -> Result<(), CodecError> {
        bincode::serialize_into(out, value).map_err(|err| CodecError::Payload {
            ty: type_name::<T>(),
            source: err,
        })
    }

    fn read(&self, input: &mut &[u8]) -> Result<T, CodecError> {
        bincode::deserialize_from(input).map_err(|err| CodecError::Payload {
            ty: type_name::<T>(),
            source: err,
        })
    }

    fn compare(&self, a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }

    fn hash(&self, value: &T) -> u64 {
        let mut hasher = SeaHasher::default();
        value.hash(&mut hasher);
        hasher.finish()
    }

    fn eq_descriptor(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<Self>().is_some()
    }

    fn descriptor_hash(&self) -> u64 {
        let mut hasher = SeaHasher::default();
        type_name::<T>().hash(&mut hasher);
        hasher.finish()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

const RECORD_TAG: u8 = 0;
const EPOCH_TAG: u8 = 1;

/// Descriptor for [`Envelope<T>`], parameterized by the payload's own
/// descriptor.
///
/// Wire layout: one discriminant byte, a fixed-width little-endian round,
/// then (records only) the payload via the wrapped descriptor. Two
/// envelope descriptors are equal iff their wrapped payload descriptors
/// are, so the engine reuses operators across structurally identical
/// wrapped types.
pub struct EnvelopeTypeInfo<T> {
    payload: Arc<dyn TypeDescriptor<T>>,
}

impl<T> EnvelopeTypeInfo<T> {
    pub fn new(payload: Arc<dyn TypeDescriptor<T>>) -> Self {
        Self { payload }
    }

    /// The payload descriptor this wraps.
    pub fn payload_type(&self) -> &Arc<dyn TypeDescriptor<T>> {
        &self.payload
    }
}

impl<T> Clone for EnvelopeTypeInfo<T> {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
        }
    }
}

impl<T> std::fmt::Debug for EnvelopeTypeInfo<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "EnvelopeTypeInfo<{}>", type_name::<T>())
    }
}

impl<T: 'static> PartialEq for EnvelopeTypeInfo<T> {
    fn eq(&self, other: &Self) -> bool {
        self.payload.eq_descriptor(other.payload.as_any())
    }
}

impl<T: 'static> TypeDescriptor<Envelope<T>> for EnvelopeTypeInfo<T> {
    fn write(&self, value: &Envelope<T>, out: &mut Vec<u8>) -> Result<(), CodecError> {
        match value {
            Envelope::Record { payload, round } => {
                out.push(RECORD_TAG);
                out.extend(round.0.to_le_bytes());
                self.payload.write(payload, out)
            }
            Envelope::Epoch { round } => {
                out.push(EPOCH_TAG);
                out.extend(round.0.to_le_bytes());
                Ok(())
            }
        }
    }

    fn read(&self, input: &mut &[u8]) -> Result<Envelope<T>, CodecError> {
        let ty = type_name::<Envelope<T>>();
        if input.len() < 5 {
            return Err(CodecError::Truncated { ty });
        }
        let (header, rest) = input.split_at(5);
        *input = rest;
        let round = Round(u32::from_le_bytes(header[1..5].try_into().unwrap()));
        match header[0] {
            RECORD_TAG => {
                let payload = self.payload.read(input)?;
                Ok(Envelope::Record { payload, round })
            }
            EPOCH_TAG => Ok(Envelope::Epoch { round }),
            found => Err(CodecError::BadDiscriminant { found }),
        }
    }

    /// Rounds order first; data sorts before the marker that closes its
    /// round; two records fall back to the payload order.
    fn compare(&self, a: &Envelope<T>, b: &Envelope<T>) -> Ordering {
        a.round()
            .cmp(&b.round())
            .then_with(|| match (a, b) {
                (Envelope::Record { payload: a, .. }, Envelope::Record { payload: b, .. }) => {
                    self.payload.compare(a, b)
                }
                (Envelope::Record { .. }, Envelope::Epoch { .. }) => Ordering::Less,
                (Envelope::Epoch { .. }, Envelope::Record { .. }) => Ordering::Greater,
                (Envelope::Epoch { .. }, Envelope::Epoch { .. }) => Ordering::Equal,
            })
    }

    /// Records hash by payload only, so routing never depends on the
    /// round. Epochs are routed to every partition anyway; hashing the
    /// round keeps the impl total.
    fn hash(&self, value: &Envelope<T>) -> u64 {
        match value {
            Envelope::Record { payload, .. } => self.payload.hash(payload),
            Envelope::Epoch { round } => {
                let mut hasher = SeaHasher::default();
                round.hash(&mut hasher);
                hasher.finish()
            }
        }
    }

    fn eq_descriptor(&self, other: &dyn Any) -> bool {
        other
            .downcast_ref::<Self>()
            .map(|other| self.payload.eq_descriptor(other.payload.as_any()))
            .unwrap_or(false)
    }

    fn descriptor_hash(&self) -> u64 {
        self.payload.descriptor_hash()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

//! Data model for state routing and wrapper snapshots.
//!
//! Wrapped stage state is a K-V mapping from [`StateKey`] to opaque
//! [`StateBytes`]; the checkpoint mechanism only ever sees bytes so each
//! stage can persist custom types without generic gymnastics at the
//! storage boundary.

use std::any::type_name;
use std::fmt::Display;
use std::hash::Hash;
use std::hash::Hasher;

use seahash::SeaHasher;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

/// Unique ID for a step in a dataflow.
///
/// Snapshots and runtime errors are labelled with this so state is never
/// mixed between operators.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepId(pub String);

impl Display for StepId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for StepId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Index of one parallel instance of a stage.
#[derive(
    Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct InstanceIndex(pub usize);

/// Key to route state within a dataflow step.
///
/// Partitioning is computed over this, never over the round, so all
/// records for one logical key land on the same instance regardless of
/// which round produced them. Round-scoped aggregation depends on that:
/// a key's accumulator must see every round's records on one instance.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateKey {
    /// Route by hash of an arbitrary string key.
    Hash(String),
    /// Route to a specific parallel instance.
    Instance(InstanceIndex),
}

/// Extracts the routing key from an unwrapped payload.
pub type KeySelector<T> = std::sync::Arc<dyn Fn(&T) -> StateKey + Send + Sync>;

/// How to map a routing key onto the key space the host shards over.
pub trait Route {
    /// A stable u64 the host takes modulo the parallelism.
    fn route(&self) -> u64;
}

impl Route for StateKey {
    fn route(&self) -> u64 {
        match self {
            Self::Hash(key) => {
                let mut hasher = SeaHasher::default();
                key.hash(&mut hasher);
                hasher.finish()
            }
            Self::Instance(index) => index.0 as u64,
        }
    }
}

/// A snapshot of state for a specific key within a step.
///
/// The checkpoint mechanism only deals in bytes; what they decode to is
/// private to the stage that wrote them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    /// Serialize a stage's state object into checkpointable bytes.
    pub fn ser<T: Serialize>(obj: &T) -> Self {
        let t_name = type_name::<T>();
        Self(
            bincode::serialize(obj)
                .unwrap_or_else(|_| panic!("state type {t_name} failed to serialize")),
        )
    }

    /// Deserialize checkpointed bytes back into a state object.
    ///
    /// A snapshot that does not decode is unrecoverable, so this panics
    /// rather than pretending the instance could continue.
    pub fn de<T: DeserializeOwned>(self) -> T {
        let t_name = type_name::<T>();
        bincode::deserialize(&self.0)
            .unwrap_or_else(|_| panic!("state type {t_name} failed to deserialize"))
    }
}

/// Writer for the fixed-order, length-prefixed snapshot layout.
///
/// A wrapper snapshot is sections concatenated in a fixed order, each a
/// little-endian `u64` byte length followed by that many bytes. The layout
/// is opaque to the host; only [`SnapshotReader`] consumes it, in the same
/// section order it was written.
#[derive(Debug, Default)]
pub struct SnapshotWriter(Vec<u8>);

impl SnapshotWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one section.
    pub fn section(&mut self, bytes: &StateBytes) {
        self.0.extend((bytes.0.len() as u64).to_le_bytes());
        self.0.extend(&bytes.0);
    }

    pub fn finish(self) -> StateBytes {
        StateBytes(self.0)
    }
}

/// Reader consuming sections in the order [`SnapshotWriter`] wrote them.
pub struct SnapshotReader<'a>(&'a [u8]);

impl<'a> SnapshotReader<'a> {
    pub fn new(bytes: &'a StateBytes) -> Self {
        Self(&bytes.0)
    }

    /// Take the next section.
    ///
    /// Panics on truncation; a mangled snapshot cannot be recovered from.
    pub fn section(&mut self) -> StateBytes {
        assert!(self.0.len() >= 8, "snapshot truncated inside a length prefix");
        let (len_bytes, rest) = self.0.split_at(8);
        let len = u64::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        assert!(rest.len() >= len, "snapshot truncated inside a section");
        let (section, rest) = rest.split_at(len);
        self.0 = rest;
        StateBytes(section.to_vec())
    }
}

#[test]
fn route_is_stable_per_key() {
    let key = StateKey::Hash("sensor-17".to_owned());

    assert_eq!(key.route(), key.route());
    assert_eq!(
        StateKey::Instance(InstanceIndex(4)).route(),
        4,
    );
}

#[test]
fn state_bytes_round_trips() {
    let state = vec![("a".to_owned(), 1_u32), ("b".to_owned(), 2_u32)];

    let found = StateBytes::ser(&state).de::<Vec<(String, u32)>>();

    assert_eq!(found, state);
}

#[test]
fn snapshot_sections_read_back_in_order() {
    let mut writer = SnapshotWriter::new();
    writer.section(&StateBytes(vec![1, 2, 3]));
    writer.section(&StateBytes(vec![]));
    writer.section(&StateBytes(vec![9]));
    let snapshot = writer.finish();

    let mut reader = SnapshotReader::new(&snapshot);
    assert_eq!(reader.section(), StateBytes(vec![1, 2, 3]));
    assert_eq!(reader.section(), StateBytes(vec![]));
    assert_eq!(reader.section(), StateBytes(vec![9]));
}

#[test]
#[should_panic(expected = "snapshot truncated")]
fn snapshot_reader_rejects_truncation() {
    let mut writer = SnapshotWriter::new();
    writer.section(&StateBytes(vec![1, 2, 3]));
    let mut snapshot = writer.finish();
    snapshot.0.pop();

    SnapshotReader::new(&snapshot).section();
}

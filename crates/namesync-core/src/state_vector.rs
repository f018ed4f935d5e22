//! State vectors.
//!
//! A [`StateVector`] maps each participant's name to the highest sequence
//! number known for it. A missing entry reads as 0. Comparing two vectors
//! yields [`SyncUpdate`] ranges describing what one side is missing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::name::Name;

/// A contiguous range of missing sequence numbers for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncUpdate {
    /// Participant the range belongs to.
    pub id: Name,
    /// First missing sequence number (inclusive).
    pub lo: u64,
    /// Last missing sequence number (inclusive).
    pub hi: u64,
}

impl SyncUpdate {
    pub fn new(id: Name, lo: u64, hi: u64) -> Self {
        Self { id, lo, hi }
    }

    /// Number of sequence numbers in the range.
    pub fn count(&self) -> u64 {
        self.hi.saturating_sub(self.lo) + 1
    }
}

/// Participant name to latest sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVector {
    entries: BTreeMap<Name, u64>,
}

#[derive(Serialize, Deserialize)]
struct Entry {
    id: Name,
    seq: u64,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sequence number for `id`, 0 if absent.
    pub fn get(&self, id: &Name) -> u64 {
        self.entries.get(id).copied().unwrap_or(0)
    }

    /// Set the entry for `id`. Callers own monotonicity.
    pub fn set(&mut self, id: Name, seq: u64) {
        self.entries.insert(id, seq);
    }

    /// Raise the entry for `id` to `seq` if it is higher. Returns whether
    /// the vector changed.
    pub fn raise(&mut self, id: &Name, seq: u64) -> bool {
        if seq > self.get(id) {
            self.entries.insert(id.clone(), seq);
            true
        } else {
            false
        }
    }

    /// Element-wise maximum with `other`.
    pub fn merge(&mut self, other: &StateVector) {
        for (id, &seq) in &other.entries {
            self.raise(id, seq);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, u64)> {
        self.entries.iter().map(|(id, &seq)| (id, seq))
    }

    /// Whether any entry in `self` is ahead of the same entry in `other`.
    pub fn newer_than(&self, other: &StateVector) -> bool {
        self.iter().any(|(id, seq)| seq > other.get(id))
    }

    /// Ranges present in `self` but not in `older`.
    ///
    /// For every participant whose sequence here exceeds the one in `older`,
    /// yields `(id, older + 1, self)`. Entries that are equal or behind
    /// produce nothing.
    pub fn diff_ranges(&self, older: &StateVector) -> Vec<SyncUpdate> {
        self.iter()
            .filter_map(|(id, seq)| {
                let known = older.get(id);
                (seq > known).then(|| SyncUpdate::new(id.clone(), known + 1, seq))
            })
            .collect()
    }

    /// Encode to CBOR as a list of `{id, seq}` entries.
    pub fn encode(&self) -> bytes::Bytes {
        let entries: Vec<Entry> = self
            .iter()
            .map(|(id, seq)| Entry {
                id: id.clone(),
                seq,
            })
            .collect();
        crate::to_cbor(&entries)
    }

    /// Decode from CBOR. Duplicate ids keep the highest sequence.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let entries: Vec<Entry> = crate::from_cbor(bytes)?;
        let mut sv = Self::new();
        for entry in entries {
            sv.raise(&entry.id, entry.seq);
        }
        Ok(sv)
    }
}

impl FromIterator<(Name, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (Name, u64)>>(iter: I) -> Self {
        let mut sv = Self::new();
        for (id, seq) in iter {
            sv.raise(&id, seq);
        }
        sv
    }
}

//! Power table: participant identities, storage power, and scaled voting
//! weights.
//!
//! Raw storage power is arbitrary-precision. To keep quorum arithmetic in
//! plain signed 64-bit integers, every entry is rescaled to
//! `power * 0xffff / total` on construction; the scaled total is therefore at
//! most `0xffff` and any sum the protocol forms stays far from overflow.

use crate::crypto::PubKey;
use crate::{ActorId, StoragePower};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

/// Upper bound of the scaled power range.
pub const SCALED_POWER_RANGE: i64 = 0xffff;

/// Errors produced by power table construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PowerError {
    #[error("power table must not be empty")]
    Empty,

    #[error("duplicate power table entry for actor {0}")]
    DuplicateEntry(ActorId),

    #[error("actor {0} has non-positive power")]
    NonPositivePower(ActorId),

    #[error("actor {0} has an empty public key")]
    EmptyPublicKey(ActorId),
}

/// One participant's entry in the power table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerEntry {
    pub id: ActorId,
    pub power: StoragePower,
    pub pub_key: PubKey,
}

impl PartialOrd for PowerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PowerEntry {
    /// Descending by power, ties broken ascending by actor id.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .power
            .cmp(&self.power)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// An ordered list of power entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerEntries(pub Vec<PowerEntry>);

impl PowerEntries {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PowerEntry> {
        self.0.iter()
    }

    /// Total raw power across all entries.
    pub fn total(&self) -> StoragePower {
        self.0.iter().map(|e| &e.power).sum()
    }
}

/// The power table for one protocol instance.
///
/// Entry ordering (power-descending, actor-ascending), scaled weights, and the
/// id → index lookup are all fixed at construction for the instance's
/// lifetime. Certificate signer bitfields index into this ordering.
#[derive(Debug, Clone)]
pub struct PowerTable {
    /// Canonically ordered entries.
    pub entries: PowerEntries,
    /// Scaled power of each entry, parallel to `entries`.
    pub scaled_power: Vec<i64>,
    /// Sum of all scaled powers; at most [`SCALED_POWER_RANGE`].
    pub scaled_total: i64,
    /// Actor id to entry index.
    lookup: HashMap<ActorId, usize>,
}

impl PowerTable {
    /// Build a power table from entries, sorting them canonically and
    /// precomputing scaled weights.
    pub fn new(mut entries: PowerEntries) -> Result<Self, PowerError> {
        if entries.is_empty() {
            return Err(PowerError::Empty);
        }
        for entry in entries.iter() {
            if !entry.power.is_positive() {
                return Err(PowerError::NonPositivePower(entry.id));
            }
            if entry.pub_key.is_empty() {
                return Err(PowerError::EmptyPublicKey(entry.id));
            }
        }
        entries.0.sort();

        let mut lookup = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            if lookup.insert(entry.id, index).is_some() {
                return Err(PowerError::DuplicateEntry(entry.id));
            }
        }

        let total: BigInt = entries.total();
        let mut scaled_power = Vec::with_capacity(entries.len());
        let mut scaled_total = 0i64;
        for entry in entries.iter() {
            let scaled = scale_power(&entry.power, &total);
            scaled_total += scaled;
            scaled_power.push(scaled);
        }

        Ok(Self {
            entries,
            scaled_power,
            scaled_total,
            lookup,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scaled power of an actor; zero for unknown actors.
    pub fn get(&self, id: ActorId) -> i64 {
        self.lookup
            .get(&id)
            .map(|&index| self.scaled_power[index])
            .unwrap_or(0)
    }

    /// Index of an actor in the canonical ordering.
    pub fn index_of(&self, id: ActorId) -> Option<usize> {
        self.lookup.get(&id).copied()
    }

    pub fn has(&self, id: ActorId) -> bool {
        self.lookup.contains_key(&id)
    }

    /// The entry at a canonical index.
    pub fn entry(&self, index: usize) -> Option<&PowerEntry> {
        self.entries.0.get(index)
    }
}

/// Rescale one entry's power into the scaled range.
fn scale_power(power: &StoragePower, total: &StoragePower) -> i64 {
    if total.is_zero() {
        return 0;
    }
    let scaled = (power * SCALED_POWER_RANGE) / total;
    scaled.to_i64().unwrap_or(0)
}

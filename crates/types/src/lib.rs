//! Core types for Granite consensus.
//!
//! This crate provides the foundational types used throughout the finality
//! gadget:
//!
//! - **Chain model**: [`TipSet`], [`ECChain`], [`ChainKey`], [`Cid`]
//! - **Power table**: [`PowerEntry`], [`PowerTable`] with scaled voting power
//! - **Wire payloads**: [`Payload`], [`GMessage`], [`Justification`]
//! - **Capabilities**: the [`Aggregate`] signature-aggregation trait
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod chain;
mod crypto;
mod payload;
mod power;

pub use chain::{
    ChainError, ChainKey, Cid, ECChain, TipSet, CHAIN_MAX_LEN, CID_MAX_LEN, TIPSET_KEY_MAX_LEN,
};
pub use crypto::{Aggregate, AggregateError, PubKey};
pub use payload::{
    GMessage, Justification, Payload, Phase, SupplementalData, DOMAIN_SEPARATION_TAG,
};
pub use power::{PowerEntries, PowerEntry, PowerError, PowerTable, SCALED_POWER_RANGE};

use serde::{Deserialize, Serialize};

/// Storage power of a participant, as reported by the external chain.
///
/// Raw power is arbitrary-precision; all quorum arithmetic runs on the scaled
/// form computed by [`PowerTable`].
pub type StoragePower = num_bigint::BigInt;

/// Identifier of a consensus participant (an on-chain actor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(pub u64);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of the network this protocol instance belongs to.
///
/// Mixed into every signed payload for domain separation, so votes cannot be
/// replayed across networks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkName(pub String);

impl NetworkName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NetworkName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use num_bigint::BigInt;

    /// Create a test tipset at the given epoch with a key derived from a seed.
    pub fn test_tipset(epoch: i64, seed: u8) -> TipSet {
        TipSet {
            epoch,
            key: vec![seed; 12],
            power_table: Cid::dag_cbor_blake2b(&[seed]),
            commitments: [0u8; 32],
        }
    }

    /// Create a valid test chain with one tipset per given epoch.
    ///
    /// The first epoch becomes the base. Keys are derived from the epoch so
    /// distinct epochs produce distinct tipsets.
    pub fn test_chain(epochs: &[i64]) -> ECChain {
        let tipsets: Vec<TipSet> = epochs
            .iter()
            .map(|&e| test_tipset(e, (e % 251) as u8))
            .collect();
        ECChain::new_unvalidated(tipsets)
    }

    /// Create a power table with `n` participants of equal power.
    ///
    /// Actor ids are `0..n` and public keys are single-byte placeholders.
    pub fn test_power_table(n: u64) -> PowerTable {
        let entries: Vec<PowerEntry> = (0..n)
            .map(|i| PowerEntry {
                id: ActorId(i),
                power: BigInt::from(1u64),
                pub_key: PubKey(vec![i as u8 + 1]),
            })
            .collect();
        PowerTable::new(PowerEntries(entries)).expect("test power table must be valid")
    }

    /// Create a power table with the given (actor, power) pairs.
    pub fn test_power_table_weighted(weights: &[(u64, u64)]) -> PowerTable {
        let entries: Vec<PowerEntry> = weights
            .iter()
            .map(|&(id, w)| PowerEntry {
                id: ActorId(id),
                power: BigInt::from(w),
                pub_key: PubKey(vec![id as u8 + 1]),
            })
            .collect();
        PowerTable::new(PowerEntries(entries)).expect("test power table must be valid")
    }
}

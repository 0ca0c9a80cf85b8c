//! Chain model: tipsets, chains and their canonical keys.
//!
//! An [`ECChain`] is a base tipset (the last finalised tipset the chain
//! extends from) followed by a possibly-empty suffix. The empty chain is the
//! distinguished "bottom" value used in PREPARE/COMMIT votes to signal
//! no-commitment.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

type Blake2b256 = Blake2b<U32>;

/// Maximum length of a CID in bytes.
pub const CID_MAX_LEN: usize = 38;

/// Maximum number of tipsets in a chain (base included).
pub const CHAIN_MAX_LEN: usize = 128;

/// Maximum length of a tipset key. The limit allows ample space for an
/// impossibly-unlikely number of blocks in a tipset while keeping a practical
/// bound against abuse.
pub const TIPSET_KEY_MAX_LEN: usize = 20 * CID_MAX_LEN;

/// Multibase prefix of a v1-DagCBOR-Blake2b256-32 CID:
/// version 1, dag-cbor codec, blake2b-256 multihash, 32-byte digest.
const DAG_CBOR_BLAKE2B_PREFIX: [u8; 6] = [0x01, 0x71, 0xa0, 0xe4, 0x02, 0x20];

/// Errors produced by chain and tipset validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("tipset key must not be empty")]
    EmptyTipsetKey,

    #[error("tipset key too long: {0} > {TIPSET_KEY_MAX_LEN}")]
    TipsetKeyTooLong(usize),

    #[error("power table CID must not be empty")]
    UndefinedPowerTableCid,

    #[error("power table CID too long: {0} > {CID_MAX_LEN}")]
    PowerTableCidTooLong(usize),

    #[error("chain too long: {0} > {CHAIN_MAX_LEN}")]
    ChainTooLong(usize),

    #[error("cannot extend the bottom chain")]
    ExtendBottom,

    #[error("chain must have strictly increasing epochs: {0} after {1}")]
    NonIncreasingEpochs(i64, i64),

    #[error("tipset {index}: {source}")]
    InvalidTipset {
        index: usize,
        #[source]
        source: Box<ChainError>,
    },
}

/// A content identifier, stored as raw bytes.
///
/// The zero value is "undefined" and fails validation wherever a CID is
/// required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cid(#[serde(with = "serde_bytes")] Vec<u8>);

impl Cid {
    /// Wrap raw CID bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Build the CID of DagCBOR-encoded data: v1, dag-cbor, blake2b-256.
    pub fn dag_cbor_blake2b(data: &[u8]) -> Self {
        let digest = Blake2b256::digest(data);
        let mut bytes = Vec::with_capacity(CID_MAX_LEN);
        bytes.extend_from_slice(&DAG_CBOR_BLAKE2B_PREFIX);
        bytes.extend_from_slice(&digest);
        Self(bytes)
    }

    /// Whether this CID carries any bytes at all.
    pub fn is_defined(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0.iter().take(8) {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A single tipset produced by the external chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSet {
    /// The EC epoch (strictly increasing along a chain).
    pub epoch: i64,
    /// Canonically ordered concatenation of the tipset's block CIDs.
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    /// CID of the CBOR-encoded power table used to validate the next instance.
    pub power_table: Cid,
    /// Root of the commitments merkle tree for the next instance.
    pub commitments: [u8; 32],
}

impl TipSet {
    /// Validate a tipset. The zero value is invalid.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.key.is_empty() {
            return Err(ChainError::EmptyTipsetKey);
        }
        if self.key.len() > TIPSET_KEY_MAX_LEN {
            return Err(ChainError::TipsetKeyTooLong(self.key.len()));
        }
        if !self.power_table.is_defined() {
            return Err(ChainError::UndefinedPowerTableCid);
        }
        if self.power_table.len() > CID_MAX_LEN {
            return Err(ChainError::PowerTableCidTooLong(self.power_table.len()));
        }
        Ok(())
    }

    /// Serialise the tipset for signing:
    /// big-endian `epoch ‖ commitments ‖ CID(CBOR(key)) ‖ power_table`.
    pub fn marshal_for_signing(&self) -> Vec<u8> {
        let key_cbor = fvm_ipld_encoding::to_vec(&serde_bytes::ByteBuf::from(self.key.clone()))
            .expect("byte buffer encoding is infallible");
        let key_cid = Cid::dag_cbor_blake2b(&key_cbor);

        let mut buf =
            Vec::with_capacity(8 + 32 + key_cid.len() + self.power_table.len());
        buf.extend_from_slice(&self.epoch.to_be_bytes());
        buf.extend_from_slice(&self.commitments);
        buf.extend_from_slice(key_cid.as_bytes());
        buf.extend_from_slice(self.power_table.as_bytes());
        buf
    }
}

impl std::fmt::Display for TipSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.key.iter().take(8) {
            write!(f, "{b:02x}")?;
        }
        write!(f, "@{}", self.epoch)
    }
}

/// A map key that completely determines the sequence of tipsets in a chain.
///
/// The empty key denotes the bottom chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainKey(#[serde(with = "serde_bytes")] Vec<u8>);

impl ChainKey {
    /// The key of the bottom (empty) chain.
    pub fn bottom() -> Self {
        Self(Vec::new())
    }

    pub fn is_bottom(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A chain of tipsets: a base followed by a possibly-empty suffix.
///
/// Tipsets are assumed to be built contiguously on each other, though epochs
/// may be missing due to null rounds. The empty chain is the "bottom" value
/// and is a valid vote value, never a valid proposal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ECChain(Vec<TipSet>);

impl ECChain {
    /// Create a validated chain from a base and suffix.
    pub fn new(base: TipSet, suffix: impl IntoIterator<Item = TipSet>) -> Result<Self, ChainError> {
        let mut tipsets = vec![base];
        tipsets.extend(suffix);
        let chain = Self(tipsets);
        chain.validate()?;
        Ok(chain)
    }

    /// Wrap tipsets without validation. Intended for tests and codecs that
    /// validate separately.
    pub fn new_unvalidated(tipsets: Vec<TipSet>) -> Self {
        Self(tipsets)
    }

    /// The bottom (empty) chain.
    pub fn bottom() -> Self {
        Self(Vec::new())
    }

    pub fn is_bottom(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_suffix(&self) -> bool {
        self.0.len() > 1
    }

    /// The base tipset, `None` for bottom.
    pub fn base(&self) -> Option<&TipSet> {
        self.0.first()
    }

    /// The tipsets after the base.
    pub fn suffix(&self) -> &[TipSet] {
        if self.is_bottom() {
            &[]
        } else {
            &self.0[1..]
        }
    }

    /// The last tipset of the chain (the base when there is no suffix).
    pub fn head(&self) -> Option<&TipSet> {
        self.0.last()
    }

    /// A new chain with the same base and no suffix. Bottom for bottom.
    pub fn base_chain(&self) -> ECChain {
        match self.base() {
            Some(base) => ECChain(vec![base.clone()]),
            None => ECChain::bottom(),
        }
    }

    /// Extend the chain with tipsets at consecutive epochs, inheriting the
    /// head's power table CID. Bottom chains cannot be extended.
    pub fn extend(&self, keys: impl IntoIterator<Item = Vec<u8>>) -> Result<ECChain, ChainError> {
        let head = self.head().ok_or(ChainError::ExtendBottom)?;
        let offset = head.epoch + 1;
        let power_table = head.power_table.clone();
        let mut tipsets = self.0.clone();
        for (i, key) in keys.into_iter().enumerate() {
            tipsets.push(TipSet {
                epoch: offset + i as i64,
                key,
                power_table: power_table.clone(),
                commitments: [0u8; 32],
            });
        }
        let chain = ECChain(tipsets);
        chain.validate()?;
        Ok(chain)
    }

    /// The chain truncated to the base plus the first `to` suffix tipsets.
    /// `prefix(0)` is the base chain. Bottom for bottom.
    ///
    /// The returned chain owns its tipsets; mutating it cannot affect this
    /// chain.
    pub fn prefix(&self, to: usize) -> ECChain {
        if self.is_bottom() {
            return ECChain::bottom();
        }
        let len = (to + 1).min(self.0.len());
        ECChain(self.0[..len].to_vec())
    }

    /// Whether this chain is non-bottom and has the given tipset as its base.
    pub fn has_base(&self, tipset: &TipSet) -> bool {
        self.base().is_some_and(|base| base == tipset)
    }

    /// Validate the chain: bottom is valid; otherwise the chain must not
    /// exceed [`CHAIN_MAX_LEN`], every tipset must validate, and epochs must
    /// strictly increase.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.is_bottom() {
            return Ok(());
        }
        if self.0.len() > CHAIN_MAX_LEN {
            return Err(ChainError::ChainTooLong(self.0.len()));
        }
        let mut last_epoch = -1i64;
        for (index, tipset) in self.0.iter().enumerate() {
            tipset.validate().map_err(|source| ChainError::InvalidTipset {
                index,
                source: Box::new(source),
            })?;
            if tipset.epoch <= last_epoch {
                return Err(ChainError::NonIncreasingEpochs(tipset.epoch, last_epoch));
            }
            last_epoch = tipset.epoch;
        }
        Ok(())
    }

    /// A deterministic identifier for the chain, suitable for use as a map
    /// key. Completely determines the sequence of tipsets.
    pub fn key(&self) -> ChainKey {
        let mut capacity = 0;
        for ts in &self.0 {
            capacity += 8 + 32 + 4 + ts.key.len() + ts.power_table.len();
        }
        let mut buf = Vec::with_capacity(capacity);
        for ts in &self.0 {
            buf.extend_from_slice(&ts.epoch.to_be_bytes());
            buf.extend_from_slice(&ts.commitments);
            buf.extend_from_slice(&(ts.key.len() as u32).to_be_bytes());
            buf.extend_from_slice(&ts.key);
            buf.extend_from_slice(ts.power_table.as_bytes());
        }
        ChainKey(buf)
    }

    /// Iterate over the tipsets of the chain, base first.
    pub fn tipsets(&self) -> impl Iterator<Item = &TipSet> {
        self.0.iter()
    }
}

impl std::fmt::Display for ECChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_bottom() {
            return f.write_str("⊥");
        }
        f.write_str("[")?;
        for (i, ts) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if i >= 4 && self.0.len() > 5 {
                f.write_str("...")?;
                break;
            }
            write!(f, "{ts}")?;
        }
        write!(f, "]len({})", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_chain, test_tipset};

    #[test]
    fn test_tipset_validate() {
        let ts = test_tipset(3, 7);
        assert!(ts.validate().is_ok());

        let mut empty_key = ts.clone();
        empty_key.key = vec![];
        assert_eq!(empty_key.validate(), Err(ChainError::EmptyTipsetKey));

        let mut long_key = ts.clone();
        long_key.key = vec![0u8; TIPSET_KEY_MAX_LEN + 1];
        assert!(matches!(
            long_key.validate(),
            Err(ChainError::TipsetKeyTooLong(_))
        ));

        let mut no_cid = ts.clone();
        no_cid.power_table = Cid::default();
        assert_eq!(no_cid.validate(), Err(ChainError::UndefinedPowerTableCid));

        let mut long_cid = ts;
        long_cid.power_table = Cid::from_bytes(vec![1u8; CID_MAX_LEN + 1]);
        assert!(matches!(
            long_cid.validate(),
            Err(ChainError::PowerTableCidTooLong(_))
        ));
    }

    #[test]
    fn test_bottom_chain_is_valid() {
        let bottom = ECChain::bottom();
        assert!(bottom.is_bottom());
        assert!(bottom.validate().is_ok());
        assert!(bottom.key().is_bottom());
        assert!(bottom.base().is_none());
        assert!(bottom.prefix(3).is_bottom());
    }

    #[test]
    fn test_chain_validate_rejects_non_increasing_epochs() {
        let chain = ECChain::new_unvalidated(vec![test_tipset(5, 1), test_tipset(5, 2)]);
        assert!(matches!(
            chain.validate(),
            Err(ChainError::NonIncreasingEpochs(5, 5))
        ));

        let chain = ECChain::new_unvalidated(vec![test_tipset(5, 1), test_tipset(4, 2)]);
        assert!(chain.validate().is_err());
    }

    #[test]
    fn test_chain_validate_rejects_overlong_chain() {
        let tipsets: Vec<TipSet> = (0..=CHAIN_MAX_LEN as i64).map(|e| test_tipset(e, 1)).collect();
        let chain = ECChain::new_unvalidated(tipsets);
        assert!(matches!(chain.validate(), Err(ChainError::ChainTooLong(_))));
    }

    #[test]
    fn test_prefix_is_ownership_isolated() {
        let chain = test_chain(&[10, 11, 12, 13]);
        let mut prefix = chain.prefix(1);
        assert_eq!(prefix.len(), 2);

        // Extending the prefix must not disturb the original chain.
        prefix = prefix.extend([vec![0xAA; 4]]).unwrap();
        assert_eq!(prefix.len(), 3);
        assert_eq!(chain.len(), 4);
        assert_eq!(chain.tipsets().nth(2).unwrap().key, test_tipset(12, 12).key);
    }

    #[test]
    fn test_prefix_zero_is_base_chain() {
        let chain = test_chain(&[10, 11, 12]);
        assert_eq!(chain.prefix(0), chain.base_chain());
        assert_eq!(chain.prefix(100), chain);
    }

    #[test]
    fn test_extend_inherits_power_table_and_epochs() {
        let chain = test_chain(&[10]);
        let extended = chain.extend([vec![1u8; 4], vec![2u8; 4]]).unwrap();
        assert_eq!(extended.len(), 3);
        let head = extended.head().unwrap();
        assert_eq!(head.epoch, 12);
        assert_eq!(head.power_table, chain.head().unwrap().power_table);
    }

    #[test]
    fn test_has_base() {
        let chain = test_chain(&[10, 11]);
        let base = chain.base().unwrap().clone();
        assert!(chain.has_base(&base));
        assert!(!chain.has_base(&test_tipset(11, 11)));
        assert!(!ECChain::bottom().has_base(&base));
    }

    #[test]
    fn test_chain_key_determines_contents() {
        let a = test_chain(&[10, 11]);
        let b = test_chain(&[10, 11]);
        let c = test_chain(&[10, 12]);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_ne!(a.key(), a.prefix(0).key());
    }

    #[test]
    fn test_marshal_for_signing_layout() {
        let ts = test_tipset(0x0102, 9);
        let marshalled = ts.marshal_for_signing();
        // epoch (8) ‖ commitments (32) ‖ key CID (38) ‖ power table CID (38)
        assert_eq!(marshalled.len(), 8 + 32 + 38 + ts.power_table.len());
        assert_eq!(&marshalled[..8], &0x0102i64.to_be_bytes());
    }

    #[test]
    fn test_dag_cbor_blake2b_cid_shape() {
        let cid = Cid::dag_cbor_blake2b(b"payload");
        assert_eq!(cid.len(), CID_MAX_LEN);
        assert!(cid.is_defined());
        // Deterministic for identical input.
        assert_eq!(cid, Cid::dag_cbor_blake2b(b"payload"));
        assert_ne!(cid, Cid::dag_cbor_blake2b(b"other"));
    }
}

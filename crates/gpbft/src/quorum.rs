//! Incremental quorum accounting for one (round, phase).
//!
//! Accumulates values from a collection of senders and incrementally tracks
//! which values have reached a strong quorum of support. Supports receiving
//! multiple values from a sender at once (QUALITY prefixes), and hence
//! multiple strong quorum values. Subsequent messages from a single sender
//! are dropped.

use crate::error::GpbftError;
use fvm_ipld_bitfield::BitField;
use granite_types::{
    ActorId, Aggregate, AggregateError, ChainKey, ECChain, Justification, Phase, PowerTable,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

fn div_ceil(a: i64, b: i64) -> i64 {
    let quo = a / b;
    if a % b != 0 {
        quo + 1
    } else {
        quo
    }
}

/// Whether a portion of power is a strong quorum (≥ ⌈2/3⌉) of the total.
pub fn is_strong_quorum(part: i64, whole: i64) -> bool {
    part >= div_ceil(2 * whole, 3)
}

/// Whether a portion of power is a weak quorum (> ⌈1/3⌉) of the total.
///
/// Strictly greater: at exactly one third there could still be a strong
/// quorum among the rest.
pub fn has_weak_quorum(part: i64, whole: i64) -> bool {
    part > div_ceil(whole, 3)
}

/// Support accumulated for one chain value.
#[derive(Debug, Clone)]
struct ChainSupport {
    chain: ECChain,
    power: i64,
    /// Per-sender signatures. Empty signatures are stored for QUALITY
    /// prefixes, which can never justify anything downstream.
    signatures: BTreeMap<ActorId, Vec<u8>>,
    has_strong_quorum: bool,
}

/// A strong quorum of signers over one value, ready for aggregation.
#[derive(Debug, Clone)]
pub struct QuorumResult {
    /// Indices into the power table, ascending.
    pub signers: Vec<u64>,
    /// Signatures, parallel to `signers`.
    pub signatures: Vec<Vec<u8>>,
}

impl QuorumResult {
    /// Aggregate the quorum's signatures into one certificate signature.
    pub fn aggregate(&self, aggregate: &dyn Aggregate) -> Result<Vec<u8>, AggregateError> {
        aggregate.aggregate(&self.signers, &self.signatures)
    }

    /// The signer set as a bitfield over power table indices.
    pub fn signers_bitfield(&self) -> BitField {
        let mut bitfield = BitField::new();
        for &signer in &self.signers {
            bitfield.set(signer);
        }
        bitfield
    }
}

/// Per-(round, phase) quorum accumulator.
#[derive(Debug, Clone)]
pub struct QuorumState {
    /// Senders from which a message has been received.
    senders: BTreeSet<ActorId>,
    /// Total power of all distinct senders seen so far.
    senders_total_power: i64,
    /// The power supporting each chain so far.
    chain_support: BTreeMap<ChainKey, ChainSupport>,
    /// Table of senders' power.
    power_table: Arc<PowerTable>,
    /// First justification received for each value.
    received_justification: BTreeMap<ChainKey, Justification>,
}

impl QuorumState {
    /// Create a new, empty quorum state.
    pub fn new(power_table: Arc<PowerTable>) -> Self {
        Self {
            senders: BTreeSet::new(),
            senders_total_power: 0,
            chain_support: BTreeMap::new(),
            power_table,
            received_justification: BTreeMap::new(),
        }
    }

    /// Receive a chain from a sender. Any subsequent value from a sender
    /// already seen is ignored.
    pub fn receive(&mut self, sender: ActorId, value: &ECChain, signature: Vec<u8>) {
        let Some(sender_power) = self.receive_sender(sender) else {
            trace!(%sender, "duplicate sender, vote ignored");
            return;
        };
        self.receive_inner(sender, value, sender_power, signature);
    }

    /// Receive each prefix of a chain as a distinct value from a sender.
    ///
    /// Signatures are not stored, so these prefixes can never be aggregated
    /// into a certificate. Intended for the QUALITY phase only.
    pub fn receive_each_prefix(&mut self, sender: ActorId, values: &ECChain) {
        let Some(sender_power) = self.receive_sender(sender) else {
            trace!(%sender, "duplicate sender, QUALITY vote ignored");
            return;
        };
        for length in 1..=values.suffix().len() {
            let prefix = values.prefix(length);
            self.receive_inner(sender, &prefix, sender_power, Vec::new());
        }
    }

    /// Add the sender's power to the total the first time it is seen.
    /// Returns the sender's power, or `None` for a repeat sender.
    fn receive_sender(&mut self, sender: ActorId) -> Option<i64> {
        if !self.senders.insert(sender) {
            return None;
        }
        let power = self.power_table.get(sender);
        self.senders_total_power += power;
        Some(power)
    }

    fn receive_inner(&mut self, sender: ActorId, value: &ECChain, power: i64, signature: Vec<u8>) {
        let key = value.key();
        let support = self
            .chain_support
            .entry(key)
            .or_insert_with(|| ChainSupport {
                chain: value.clone(),
                power: 0,
                signatures: BTreeMap::new(),
                has_strong_quorum: false,
            });
        support.power += power;
        debug_assert!(
            !support.signatures.contains_key(&sender),
            "duplicate message should have been dropped"
        );
        support.signatures.insert(sender, signature);
        support.has_strong_quorum =
            is_strong_quorum(support.power, self.power_table.scaled_total);
    }

    /// Store a justification for a value, keeping only the first received.
    pub fn receive_justification(&mut self, value: &ECChain, justification: Justification) {
        self.received_justification
            .entry(value.key())
            .or_insert(justification);
    }

    /// All values received from any sender. Ordered by chain key.
    pub fn list_values(&self) -> impl Iterator<Item = &ECChain> {
        self.chain_support.values().map(|support| &support.chain)
    }

    /// Whether messages have been received from a strong quorum of senders.
    pub fn received_from_strong_quorum(&self) -> bool {
        is_strong_quorum(self.senders_total_power, self.power_table.scaled_total)
    }

    /// Whether messages have been received from a weak quorum of senders.
    pub fn received_from_weak_quorum(&self) -> bool {
        has_weak_quorum(self.senders_total_power, self.power_table.scaled_total)
    }

    /// Whether a chain has reached a strong quorum of support.
    pub fn has_strong_quorum_for(&self, key: &ChainKey) -> bool {
        self.chain_support
            .get(key)
            .is_some_and(|support| support.has_strong_quorum)
    }

    /// Whether the given chain could still reach a strong quorum given the
    /// messages received so far.
    ///
    /// With `with_adversary`, an additional ⅓ of total power is added to the
    /// possible support, representing an equivocating adversary: appropriate
    /// for testing whether any *other* participant could have observed a
    /// strong quorum. The adversary term double-counts power that may already
    /// be in the support, so the sum is capped at the table total.
    pub fn could_reach_strong_quorum_for(&self, key: &ChainKey, with_adversary: bool) -> bool {
        let supporting_power = self
            .chain_support
            .get(key)
            .map(|support| support.power)
            .unwrap_or(0);
        let unvoted_power = self.power_table.scaled_total - self.senders_total_power;
        let adversary_power = if with_adversary {
            self.power_table.scaled_total / 3
        } else {
            0
        };
        let possible_support = (supporting_power + unvoted_power + adversary_power)
            .min(self.power_table.scaled_total);
        is_strong_quorum(possible_support, self.power_table.scaled_total)
    }

    /// Find a strong quorum of signers for a chain, if one exists.
    ///
    /// Scans signers in ascending power-table index order (power-descending,
    /// actor-ascending) and cuts off once the cumulative scaled power crosses
    /// the threshold. Entries are ordered by decreasing power, so the first
    /// quorum found is the smallest, which minimises certificate size and
    /// yields a deterministic certificate for identical inputs.
    pub fn find_strong_quorum_for(
        &self,
        key: &ChainKey,
    ) -> Result<Option<QuorumResult>, GpbftError> {
        let Some(support) = self.chain_support.get(key) else {
            return Ok(None);
        };
        if !support.has_strong_quorum {
            return Ok(None);
        }

        let mut signers = Vec::with_capacity(support.signatures.len());
        for &id in support.signatures.keys() {
            let index = self
                .power_table
                .index_of(id)
                .ok_or(GpbftError::Invariant("signer not found in power table"))?;
            signers.push(index);
        }
        signers.sort_unstable();

        let mut signatures = Vec::with_capacity(signers.len());
        let mut quorum_power = 0i64;
        for (count, &index) in signers.iter().enumerate() {
            let entry = self
                .power_table
                .entry(index)
                .ok_or(GpbftError::Invariant("signer index out of range"))?;
            quorum_power += self.power_table.scaled_power[index];
            signatures.push(support.signatures[&entry.id].clone());
            if is_strong_quorum(quorum_power, self.power_table.scaled_total) {
                return Ok(Some(QuorumResult {
                    signers: signers[..=count].iter().map(|&i| i as u64).collect(),
                    signatures,
                }));
            }
        }
        // `has_strong_quorum` was true, so the scan must have found one.
        Err(GpbftError::Invariant(
            "strong quorum exists but could not be found",
        ))
    }

    /// The unique chain with a strong quorum of support, if any.
    ///
    /// Appropriate for PREPARE/COMMIT/DECIDE, where each participant casts a
    /// single vote. Two chains with strong quorum signal a violated safety
    /// assumption and are fatal.
    pub fn find_strong_quorum_value(&self) -> Result<Option<ECChain>, GpbftError> {
        let mut quorum_value = None;
        for support in self.chain_support.values() {
            if support.has_strong_quorum {
                if quorum_value.is_some() {
                    return Err(GpbftError::Invariant(
                        "multiple chains with strong quorum",
                    ));
                }
                quorum_value = Some(support.chain.clone());
            }
        }
        Ok(quorum_value)
    }

    /// The longest prefix of `preferred` with a strong quorum, falling back
    /// to its base chain.
    pub fn find_strong_quorum_value_for_longest_prefix_of(&self, preferred: &ECChain) -> ECChain {
        if self.has_strong_quorum_for(&preferred.key()) {
            return preferred.clone();
        }
        for length in (0..preferred.len()).rev() {
            let prefix = preferred.prefix(length);
            if self.has_strong_quorum_for(&prefix.key()) {
                return prefix;
            }
        }
        preferred.base_chain()
    }

    /// Whether a justification of the given phase exists for a chain key.
    pub fn has_justification_of(&self, phase: Phase, key: &ChainKey) -> bool {
        self.get_justification_of(phase, key).is_some()
    }

    /// The justification of the given phase for a chain key, if stored.
    ///
    /// A bottom key asks for any justification of a bottom value in that
    /// phase.
    pub fn get_justification_of(&self, phase: Phase, key: &ChainKey) -> Option<&Justification> {
        if key.is_bottom() {
            return self.received_justification.values().find(|justification| {
                justification.vote.value.is_bottom() && justification.vote.phase == phase
            });
        }
        self.received_justification
            .get(key)
            .filter(|justification| justification.vote.phase == phase)
    }

    /// The stored justification for a chain key, regardless of phase.
    pub fn received_justification_for(&self, key: &ChainKey) -> Option<&Justification> {
        self.received_justification.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granite_types::test_utils::{test_chain, test_power_table, test_power_table_weighted};
    use granite_types::{Payload, SupplementalData};

    fn justification(phase: Phase, value: ECChain) -> Justification {
        Justification {
            vote: Payload::new(0, 0, phase, SupplementalData::default(), value),
            signers: BitField::new(),
            signature: vec![0xAA],
        }
    }

    #[test]
    fn test_strong_quorum_boundary() {
        // part ≥ ⌈2·whole/3⌉
        assert!(is_strong_quorum(2, 3));
        assert!(!is_strong_quorum(1, 3));
        assert!(is_strong_quorum(3, 4));
        assert!(!is_strong_quorum(2, 4));
        assert!(is_strong_quorum(7, 10));
        assert!(!is_strong_quorum(6, 10));
    }

    #[test]
    fn test_weak_quorum_boundary() {
        // part > ⌈whole/3⌉
        assert!(has_weak_quorum(2, 3));
        assert!(!has_weak_quorum(1, 3));
        assert!(has_weak_quorum(5, 12));
        assert!(!has_weak_quorum(4, 12));
    }

    #[test]
    fn test_two_of_three_equal_power_is_strong_quorum() {
        let table = Arc::new(test_power_table(3));
        let mut state = QuorumState::new(table);
        let chain = test_chain(&[10, 11]);

        state.receive(ActorId(0), &chain, vec![1]);
        assert!(!state.has_strong_quorum_for(&chain.key()));
        assert!(!state.received_from_strong_quorum());

        state.receive(ActorId(1), &chain, vec![2]);
        assert!(state.has_strong_quorum_for(&chain.key()));
        assert!(state.received_from_strong_quorum());
    }

    #[test]
    fn test_duplicate_sender_is_dropped() {
        let table = Arc::new(test_power_table(3));
        let mut state = QuorumState::new(table);
        let chain_a = test_chain(&[10, 11]);
        let chain_b = test_chain(&[10, 12]);

        state.receive(ActorId(0), &chain_a, vec![1]);
        state.receive(ActorId(0), &chain_b, vec![1]);
        state.receive(ActorId(0), &chain_a, vec![1]);

        assert_eq!(state.senders.len(), 1);
        // The equivocating second vote left no trace.
        assert!(state.chain_support.get(&chain_b.key()).is_none());
        assert_eq!(
            state.chain_support[&chain_a.key()].power,
            state.senders_total_power
        );
    }

    #[test]
    fn test_receive_each_prefix_registers_all_suffix_prefixes() {
        let table = Arc::new(test_power_table(3));
        let mut state = QuorumState::new(table);
        let chain = test_chain(&[10, 11, 12]);

        state.receive_each_prefix(ActorId(0), &chain);
        state.receive_each_prefix(ActorId(1), &chain);

        assert!(state.has_strong_quorum_for(&chain.key()));
        assert!(state.has_strong_quorum_for(&chain.prefix(1).key()));
        // The bare base is not registered by prefix reception.
        assert!(state.chain_support.get(&chain.prefix(0).key()).is_none());
    }

    #[test]
    fn test_longest_prefix_with_quorum() {
        let table = Arc::new(test_power_table(3));
        let mut state = QuorumState::new(table);
        let full = test_chain(&[10, 11, 12]);
        let shorter = full.prefix(1);

        // One sender supports the full chain, one only a prefix of it.
        state.receive_each_prefix(ActorId(0), &full);
        state.receive_each_prefix(ActorId(1), &shorter);

        let longest = state.find_strong_quorum_value_for_longest_prefix_of(&full);
        assert_eq!(longest, shorter);

        // With no quorum anywhere, fall back to the base.
        let empty = QuorumState::new(Arc::new(test_power_table(3)));
        assert_eq!(
            empty.find_strong_quorum_value_for_longest_prefix_of(&full),
            full.base_chain()
        );
    }

    #[test]
    fn test_find_strong_quorum_is_smallest_certificate() {
        // Actor 0 holds 3/5 of the power, the rest hold 1/5 each.
        let table = Arc::new(test_power_table_weighted(&[(0, 3), (1, 1), (2, 1)]));
        let mut state = QuorumState::new(Arc::clone(&table));
        let chain = test_chain(&[10, 11]);

        state.receive(ActorId(2), &chain, vec![2]);
        state.receive(ActorId(0), &chain, vec![0]);
        state.receive(ActorId(1), &chain, vec![1]);

        let quorum = state
            .find_strong_quorum_for(&chain.key())
            .unwrap()
            .expect("strong quorum must exist");
        // Actor 0 is entry 0; one of the light actors completes the quorum.
        assert_eq!(quorum.signers, vec![0, 1]);
        assert_eq!(quorum.signatures.len(), 2);
        let bitfield = quorum.signers_bitfield();
        assert!(bitfield.get(0) && bitfield.get(1) && !bitfield.get(2));
    }

    #[test]
    fn test_find_strong_quorum_value_unique() {
        let table = Arc::new(test_power_table(3));
        let mut state = QuorumState::new(table);
        let chain = test_chain(&[10, 11]);

        assert!(state.find_strong_quorum_value().unwrap().is_none());
        state.receive(ActorId(0), &chain, vec![0]);
        state.receive(ActorId(1), &chain, vec![1]);
        assert_eq!(state.find_strong_quorum_value().unwrap(), Some(chain));
    }

    #[test]
    fn test_multiple_strong_quorum_values_are_fatal() {
        let table = Arc::new(test_power_table(3));
        let mut state = QuorumState::new(table);
        let chain = test_chain(&[10, 11, 12]);

        // Prefix reception gives two distinct values a strong quorum each,
        // which single-vote phases must treat as a broken safety assumption.
        state.receive_each_prefix(ActorId(0), &chain);
        state.receive_each_prefix(ActorId(1), &chain);
        assert!(matches!(
            state.find_strong_quorum_value(),
            Err(GpbftError::Invariant(_))
        ));
    }

    #[test]
    fn test_could_reach_strong_quorum() {
        let table = Arc::new(test_power_table(3));
        let mut state = QuorumState::new(Arc::clone(&table));
        let chain_a = test_chain(&[10, 11]);
        let chain_b = test_chain(&[10, 12]);

        // Nothing received: anything could still reach quorum.
        assert!(state.could_reach_strong_quorum_for(&chain_a.key(), false));

        // Two of three voted B: A cannot reach a quorum on honest votes
        // alone, but an equivocating adversary could still hand it one.
        state.receive(ActorId(0), &chain_b, vec![0]);
        state.receive(ActorId(1), &chain_b, vec![1]);
        assert!(!state.could_reach_strong_quorum_for(&chain_a.key(), false));
        assert!(state.could_reach_strong_quorum_for(&chain_a.key(), true));

        // B itself has the quorum either way; the adversary bonus is capped
        // at total power.
        assert!(state.could_reach_strong_quorum_for(&chain_b.key(), true));
    }

    #[test]
    fn test_justification_storage_keeps_first() {
        let table = Arc::new(test_power_table(3));
        let mut state = QuorumState::new(table);
        let chain = test_chain(&[10, 11]);

        let first = justification(Phase::Prepare, chain.clone());
        let mut second = justification(Phase::Prepare, chain.clone());
        second.signature = vec![0xBB];

        state.receive_justification(&chain, first);
        state.receive_justification(&chain, second);

        let stored = state
            .get_justification_of(Phase::Prepare, &chain.key())
            .expect("justification must be stored");
        assert_eq!(stored.signature, vec![0xAA]);
        // Phase mismatch finds nothing.
        assert!(state.get_justification_of(Phase::Commit, &chain.key()).is_none());
    }

    #[test]
    fn test_bottom_key_finds_bottom_justification() {
        let table = Arc::new(test_power_table(3));
        let mut state = QuorumState::new(table);
        let bottom = ECChain::bottom();

        state.receive_justification(&bottom, justification(Phase::Commit, ECChain::bottom()));

        assert!(state.has_justification_of(Phase::Commit, &ChainKey::bottom()));
        assert!(!state.has_justification_of(Phase::Prepare, &ChainKey::bottom()));
    }
}

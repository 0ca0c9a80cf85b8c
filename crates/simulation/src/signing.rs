//! Signing backend for simulated participants.
//!
//! Each participant holds a deterministically derived Ed25519 key. Payload
//! signatures and CONVERGE tickets are real signatures over the protocol's
//! signing marshal; certificate aggregation is a plain concatenation, which
//! is enough for a harness whose host verifies nothing by construction.

use ed25519_dalek::{Signer, SigningKey};
use granite_types::{
    ActorId, Aggregate, AggregateError, NetworkName, Payload, PowerEntries, PowerEntry,
    PowerError, PowerTable, PubKey, StoragePower,
};

/// Derive the signing key for one participant from the simulation seed.
fn derive_key(seed: u64, index: u32) -> SigningKey {
    let mut bytes = [0u8; 32];
    let mixed = seed
        .wrapping_add(index as u64)
        .wrapping_mul(0x517c_c1b7_2722_0a95);
    bytes[..8].copy_from_slice(&mixed.to_le_bytes());
    bytes[8..16].copy_from_slice(&(index as u64).to_le_bytes());
    SigningKey::from_bytes(&bytes)
}

/// Keys and signing operations for all simulated participants.
pub struct SigningBackend {
    keys: Vec<SigningKey>,
    network: NetworkName,
}

impl SigningBackend {
    pub fn new(seed: u64, participants: u32, network: NetworkName) -> Self {
        let keys = (0..participants).map(|i| derive_key(seed, i)).collect();
        Self { keys, network }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn public_key(&self, index: u32) -> PubKey {
        PubKey(self.keys[index as usize].verifying_key().to_bytes().to_vec())
    }

    /// Sign a payload on behalf of a participant.
    pub fn sign_payload(&self, index: u32, payload: &Payload) -> Vec<u8> {
        let message = payload.marshal_for_signing(&self.network);
        self.keys[index as usize].sign(&message).to_bytes().to_vec()
    }

    /// Derive a CONVERGE ticket: a signature over the beacon and round,
    /// standing in for a VRF.
    pub fn make_ticket(&self, index: u32, beacon: &[u8], round: u64) -> Vec<u8> {
        let mut message = Vec::with_capacity(beacon.len() + 8);
        message.extend_from_slice(beacon);
        message.extend_from_slice(&round.to_be_bytes());
        self.keys[index as usize].sign(&message).to_bytes().to_vec()
    }

    /// Build the power table for these participants with the given weights.
    pub fn power_table(&self, weights: &[u64]) -> Result<PowerTable, PowerError> {
        let entries: Vec<PowerEntry> = weights
            .iter()
            .enumerate()
            .map(|(index, &weight)| PowerEntry {
                id: ActorId(index as u64),
                power: StoragePower::from(weight),
                pub_key: self.public_key(index as u32),
            })
            .collect();
        PowerTable::new(PowerEntries(entries))
    }
}

/// Concatenating signature aggregation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatAggregate;

impl Aggregate for ConcatAggregate {
    fn aggregate(
        &self,
        signer_indices: &[u64],
        signatures: &[Vec<u8>],
    ) -> Result<Vec<u8>, AggregateError> {
        if signer_indices.len() != signatures.len() {
            return Err(AggregateError::CountMismatch {
                signers: signer_indices.len(),
                signatures: signatures.len(),
            });
        }
        Ok(signatures.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granite_types::test_utils::test_chain;
    use granite_types::{Phase, SupplementalData};

    #[test]
    fn test_key_derivation_is_deterministic_and_distinct() {
        let a = SigningBackend::new(42, 3, NetworkName::new("test"));
        let b = SigningBackend::new(42, 3, NetworkName::new("test"));
        assert_eq!(a.public_key(0), b.public_key(0));
        assert_ne!(a.public_key(0), a.public_key(1));

        let other_seed = SigningBackend::new(43, 3, NetworkName::new("test"));
        assert_ne!(a.public_key(0), other_seed.public_key(0));
    }

    #[test]
    fn test_signatures_bind_to_payload() {
        let backend = SigningBackend::new(1, 2, NetworkName::new("test"));
        let payload = Payload::new(
            0,
            0,
            Phase::Quality,
            SupplementalData::default(),
            test_chain(&[100, 101]),
        );
        let mut other = payload.clone();
        other.round = 1;

        assert_eq!(
            backend.sign_payload(0, &payload),
            backend.sign_payload(0, &payload)
        );
        assert_ne!(
            backend.sign_payload(0, &payload),
            backend.sign_payload(0, &other)
        );
        assert_ne!(
            backend.sign_payload(0, &payload),
            backend.sign_payload(1, &payload)
        );
    }

    #[test]
    fn test_power_table_uses_backend_keys() {
        let backend = SigningBackend::new(9, 3, NetworkName::new("test"));
        let table = backend.power_table(&[1, 1, 1]).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.entry(table.index_of(ActorId(2)).unwrap()).unwrap().pub_key,
            backend.public_key(2)
        );
    }

    #[test]
    fn test_concat_aggregate_checks_counts() {
        let aggregate = ConcatAggregate;
        let combined = aggregate
            .aggregate(&[0, 2], &[vec![1, 2], vec![3]])
            .unwrap();
        assert_eq!(combined, vec![1, 2, 3]);
        assert!(aggregate.aggregate(&[0], &[]).is_err());
    }
}

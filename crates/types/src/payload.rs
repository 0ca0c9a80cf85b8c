//! Wire payloads: votes, messages and justifications.

use crate::chain::{Cid, ECChain};
use crate::{ActorId, NetworkName};
use fvm_ipld_bitfield::BitField;
use serde::{Deserialize, Serialize};

/// Domain separation tag mixed into every signed payload.
pub const DOMAIN_SEPARATION_TAG: &str = "GPBFT";

/// The phases of one protocol instance.
///
/// Phase advances only along
/// `INITIAL → QUALITY → PREPARE → COMMIT → (CONVERGE → PREPARE → COMMIT)* →
/// DECIDE → TERMINATED`.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum Phase {
    Initial = 0,
    Quality = 1,
    Converge = 2,
    Prepare = 3,
    Commit = 4,
    Decide = 5,
    Terminated = 6,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initial => "INITIAL",
            Phase::Quality => "QUALITY",
            Phase::Converge => "CONVERGE",
            Phase::Prepare => "PREPARE",
            Phase::Commit => "COMMIT",
            Phase::Decide => "DECIDE",
            Phase::Terminated => "TERMINATED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> u8 {
        phase as u8
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Phase::Initial),
            1 => Ok(Phase::Quality),
            2 => Ok(Phase::Converge),
            3 => Ok(Phase::Prepare),
            4 => Ok(Phase::Commit),
            5 => Ok(Phase::Decide),
            6 => Ok(Phase::Terminated),
            other => Err(format!("invalid phase {other}")),
        }
    }
}

/// Instance-specific data all correct participants agree on a priori.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplementalData {
    /// Root of the commitments merkle tree for the next instance.
    pub commitments: [u8; 32],
    /// CID of the power table used to validate the next instance.
    pub power_table: Cid,
}

/// The fields of a message that make up the signature payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Instance number.
    pub instance: u64,
    /// Round number. DECIDE votes always carry round 0 so that votes decided
    /// in different rounds aggregate.
    pub round: u64,
    /// Protocol phase this vote belongs to.
    pub phase: Phase,
    /// Agreed-upon data for the next instance.
    pub supplemental_data: SupplementalData,
    /// The voted chain; bottom expresses no-commitment in PREPARE/COMMIT.
    pub value: ECChain,
}

impl Payload {
    pub fn new(
        instance: u64,
        round: u64,
        phase: Phase,
        supplemental_data: SupplementalData,
        value: ECChain,
    ) -> Self {
        Self {
            instance,
            round,
            phase,
            supplemental_data,
            value,
        }
    }

    /// Serialise the payload for signing, with domain separation:
    /// `tag ‖ network ‖ instance ‖ round ‖ phase ‖ supplement ‖ tipsets`,
    /// integers big-endian.
    pub fn marshal_for_signing(&self, network: &NetworkName) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.value.len() * 128);
        buf.extend_from_slice(DOMAIN_SEPARATION_TAG.as_bytes());
        buf.push(b':');
        buf.extend_from_slice(network.as_str().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(&self.instance.to_be_bytes());
        buf.extend_from_slice(&self.round.to_be_bytes());
        buf.push(self.phase as u8);
        buf.extend_from_slice(&self.supplemental_data.commitments);
        buf.extend_from_slice(self.supplemental_data.power_table.as_bytes());
        for tipset in self.value.tipsets() {
            buf.extend_from_slice(&tipset.marshal_for_signing());
        }
        buf
    }
}

/// A message in the Granite protocol.
///
/// The same message structure is used for all phases; the ticket is present
/// only on CONVERGE messages and the justification only where the phase
/// demands one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GMessage {
    /// The participant who sent this message.
    pub sender: ActorId,
    /// The payload the sender signed.
    pub vote: Payload,
    /// Signature over the signing marshal of `vote`.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// VRF ticket for CONVERGE (rounds ≥ 1 only).
    #[serde(default, with = "serde_bytes")]
    pub ticket: Option<Vec<u8>>,
    /// Proof the vote is allowed: a strong quorum from an earlier phase.
    pub justification: Option<Justification>,
}

/// An aggregate-signature proof that a strong quorum voted one payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Justification {
    /// The payload a strong quorum signed.
    pub vote: Payload,
    /// Indices into the power table of the participants that signed.
    pub signers: BitField,
    /// Aggregate signature over the vote's signing marshal.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_chain;

    #[test]
    fn test_phase_round_trips_through_u8() {
        for phase in [
            Phase::Initial,
            Phase::Quality,
            Phase::Converge,
            Phase::Prepare,
            Phase::Commit,
            Phase::Decide,
            Phase::Terminated,
        ] {
            assert_eq!(Phase::try_from(phase as u8).unwrap(), phase);
        }
        assert!(Phase::try_from(7u8).is_err());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Quality.to_string(), "QUALITY");
        assert_eq!(Phase::Terminated.to_string(), "TERMINATED");
    }

    #[test]
    fn test_signing_marshal_separates_domains() {
        let payload = Payload::new(
            3,
            1,
            Phase::Prepare,
            SupplementalData::default(),
            test_chain(&[10, 11]),
        );
        let a = payload.marshal_for_signing(&NetworkName::new("testnet"));
        let b = payload.marshal_for_signing(&NetworkName::new("mainnet"));
        assert_ne!(a, b);

        let mut other_round = payload.clone();
        other_round.round = 2;
        assert_ne!(a, other_round.marshal_for_signing(&NetworkName::new("testnet")));
    }
}

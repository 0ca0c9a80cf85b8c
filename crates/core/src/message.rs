//! Outbound message construction and instance progress reporting.

use granite_types::{Justification, NetworkName, Payload, Phase, PowerTable};
use std::sync::Arc;

/// Everything the host needs to sign and transmit one protocol message.
///
/// The instance never signs anything itself: it hands the host a builder and
/// the host attaches the sender's payload signature (and, when
/// `beacon_for_ticket` is set, a VRF ticket drawn from the beacon) before
/// transmitting.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    /// Network the message belongs to, mixed into the signing domain.
    pub network_name: NetworkName,
    /// Power table of the instance, for signer lookups during signing.
    pub power_table: Arc<PowerTable>,
    /// The payload to sign and send.
    pub payload: Payload,
    /// Justification to attach, where the phase demands one.
    pub justification: Option<Justification>,
    /// When present, the host must derive a CONVERGE ticket from this beacon
    /// and the payload's round.
    pub beacon_for_ticket: Option<Vec<u8>>,
}

/// Names one previously-broadcast message for rebroadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instant {
    pub id: u64,
    pub round: u64,
    pub phase: Phase,
}

impl std::fmt::Display for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}@{}/{}", self.id, self.round, self.phase)
    }
}

/// A snapshot of how far an instance has progressed, for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProgress {
    pub id: u64,
    pub round: u64,
    pub phase: Phase,
}

impl std::fmt::Display for InstanceProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}, round {}, phase {}", self.id, self.round, self.phase)
    }
}

//! Action types for the deterministic state machine.

use crate::message::{Instant, InstanceProgress, MessageBuilder};
use granite_types::Justification;
use std::time::Duration;

/// Actions the instance wants the host to perform.
///
/// Actions are **commands** - they describe something to do.
/// The host executes actions; failures of fire-and-forget actions are logged
/// by the host and retried only through the rebroadcast cycle.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Sign and broadcast a new message to all participants.
    RequestBroadcast { builder: MessageBuilder },

    /// Re-transmit a previously broadcast message, identified by instance,
    /// round and phase. Unknown instants are silently ignored by the host.
    RequestRebroadcast { instant: Instant },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Schedule the alarm at an absolute virtual time.
    ///
    /// An instance has at most one pending alarm; a new request overrides
    /// the previous one.
    SetAlarm { at: Duration },

    // ═══════════════════════════════════════════════════════════════════════
    // External Notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Report progression to a new (round, phase). Observational only.
    NotifyProgress { progress: InstanceProgress },

    /// The instance terminated with this decision certificate.
    ///
    /// Emitted exactly once, alongside the transition to TERMINATED. The
    /// host feeds the certificate to the next instance.
    Decided { decision: Justification },
}

impl Action {
    /// Check if this action transmits on the network.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Action::RequestBroadcast { .. } | Action::RequestRebroadcast { .. }
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::RequestBroadcast { .. } => "RequestBroadcast",
            Action::RequestRebroadcast { .. } => "RequestRebroadcast",
            Action::SetAlarm { .. } => "SetAlarm",
            Action::NotifyProgress { .. } => "NotifyProgress",
            Action::Decided { .. } => "Decided",
        }
    }
}

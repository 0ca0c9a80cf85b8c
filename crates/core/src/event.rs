//! Event types for the deterministic state machine.

use granite_types::GMessage;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same virtual time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// Alarms precede network deliveries so a phase that has timed out is
/// completed before new votes for it arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Alarm events: scheduled by the instance itself.
    Alarm = 0,

    /// Network events: messages from other participants.
    Network = 1,
}

/// All possible events an instance can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The instance processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    /// The pending alarm fired.
    AlarmFired,

    /// A single validated message arrived from the network.
    ///
    /// Cryptographic verification (signatures, aggregate signatures on
    /// justifications) has already been performed by the host; only
    /// instance-bound validation (supplement, base) remains.
    MessageReceived { msg: Box<GMessage> },

    /// A batch of queued messages arrived, ordered by round for most
    /// effective processing.
    ///
    /// Equivalent to a sequence of single deliveries except that skip-ahead
    /// evaluation runs once over the distinct rounds touched.
    BatchReceived { msgs: Vec<GMessage> },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::AlarmFired => EventPriority::Alarm,
            Event::MessageReceived { .. } | Event::BatchReceived { .. } => EventPriority::Network,
        }
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::AlarmFired => "AlarmFired",
            Event::MessageReceived { .. } => "MessageReceived",
            Event::BatchReceived { .. } => "BatchReceived",
        }
    }
}

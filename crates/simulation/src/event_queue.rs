//! Deterministic ordering of simulation events.

use crate::NodeIndex;
use granite_core::{Event, EventPriority};
use std::time::Duration;

/// Ordering key for the global event queue.
///
/// Events are processed by time, then priority (alarms before network
/// deliveries), then node index, then insertion sequence. The sequence makes
/// every key unique and the whole order total, which is what keeps runs
/// reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node: NodeIndex,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            node,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_time_then_priority_then_node() {
        let alarm = Event::AlarmFired;
        let network = Event::BatchReceived { msgs: vec![] };

        let early = EventKey::new(Duration::from_secs(1), &network, 9, 5);
        let late = EventKey::new(Duration::from_secs(2), &alarm, 0, 1);
        assert!(early < late);

        // Same time: the alarm wins regardless of node index.
        let alarm_key = EventKey::new(Duration::from_secs(1), &alarm, 9, 7);
        let network_key = EventKey::new(Duration::from_secs(1), &network, 0, 6);
        assert!(alarm_key < network_key);

        // Full tie broken by sequence.
        let a = EventKey::new(Duration::from_secs(1), &alarm, 1, 1);
        let b = EventKey::new(Duration::from_secs(1), &alarm, 1, 2);
        assert!(a < b);
    }
}

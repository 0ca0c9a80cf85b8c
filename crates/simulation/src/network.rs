//! Simulated network with deterministic latency, packet loss, and partitions.

use crate::NodeIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Number of participants.
    pub num_participants: u32,
    /// Base one-way message latency.
    pub base_latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this
    /// probability.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_participants: 3,
            base_latency: Duration::from_millis(100),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        }
    }
}

/// Simulated network for deterministic message delivery.
///
/// Supports:
/// - Configurable latency with seeded jitter
/// - Packet loss (probabilistic message drops)
/// - Directional partitions between node pairs
///
/// Self-delivery (a node's broadcast looping back to itself) is immediate and
/// exempt from loss and partitions, matching a local gossip loopback.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Partitioned node pairs. If (a, b) is in this set, messages from a to b
    /// are dropped. Partitions are directional.
    partitions: HashSet<(NodeIndex, NodeIndex)>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// All node indices in the network.
    pub fn all_nodes(&self) -> impl Iterator<Item = NodeIndex> {
        0..self.config.num_participants
    }

    // ─── Partition Management ───

    /// Whether a message from `from` to `to` would be dropped.
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Drop messages from `from` to `to`.
    pub fn partition_unidirectional(&mut self, from: NodeIndex, to: NodeIndex) {
        self.partitions.insert((from, to));
    }

    /// Drop messages between two nodes in both directions.
    pub fn partition_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Cut a node off from every other node.
    pub fn isolate_node(&mut self, node: NodeIndex) {
        for other in 0..self.config.num_participants {
            if other != node {
                self.partitions.insert((node, other));
                self.partitions.insert((other, node));
            }
        }
    }

    /// Reconnect a node to every other node.
    pub fn heal_node(&mut self, node: NodeIndex) {
        self.partitions
            .retain(|&(from, to)| from != node && to != node);
    }

    /// Restore full connectivity.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    // ─── Delivery Model ───

    /// Whether to drop a packet, from the seeded loss rate.
    pub fn should_drop_packet(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate
    }

    /// Sample the one-way latency for a delivery.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.base_latency.as_secs_f64();
        let jitter = if self.config.jitter_fraction > 0.0 {
            base * self.config.jitter_fraction * rng.gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_partitions_are_directional() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.partition_unidirectional(0, 1);
        assert!(network.is_partitioned(0, 1));
        assert!(!network.is_partitioned(1, 0));

        network.partition_bidirectional(1, 2);
        assert!(network.is_partitioned(1, 2));
        assert!(network.is_partitioned(2, 1));
    }

    #[test]
    fn test_isolate_and_heal_node() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.isolate_node(1);
        assert!(network.is_partitioned(0, 1));
        assert!(network.is_partitioned(1, 2));
        assert_eq!(network.partition_count(), 4);

        network.heal_node(1);
        assert_eq!(network.partition_count(), 0);
    }

    #[test]
    fn test_latency_jitter_stays_near_base() {
        let network = SimulatedNetwork::new(NetworkConfig {
            base_latency: Duration::from_millis(100),
            jitter_fraction: 0.2,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..100 {
            let latency = network.sample_latency(&mut rng);
            assert!(latency >= Duration::from_millis(80));
            assert!(latency <= Duration::from_millis(120));
        }
    }

    #[test]
    fn test_same_seed_same_latencies() {
        let network = SimulatedNetwork::new(NetworkConfig::default());
        let mut rng_a = ChaCha8Rng::seed_from_u64(42);
        let mut rng_b = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..50 {
            assert_eq!(
                network.sample_latency(&mut rng_a),
                network.sample_latency(&mut rng_b)
            );
        }
    }
}

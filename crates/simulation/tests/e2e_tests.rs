//! End-to-end scenarios over the deterministic simulation.
//!
//! These tests run whole committees through multiple consensus instances
//! with simulated time. No tokio runtime, no real I/O: `run_until` advances
//! the virtual clock, and the same seed always produces the same run.

use granite_gpbft::GpbftConfig;
use granite_simulation::{NetworkConfig, NodeIndex, SimulationRunner};
use granite_types::Phase;
use std::time::Duration;
use tracing_test::traced_test;

/// A small, fast, lossless network.
fn fast_network(participants: u32) -> NetworkConfig {
    NetworkConfig {
        num_participants: participants,
        base_latency: Duration::from_millis(10),
        jitter_fraction: 0.1,
        packet_loss_rate: 0.0,
    }
}

/// Assert that every listed node decided the same non-bottom value for each
/// of the first `instances` instances.
fn assert_agreement(runner: &SimulationRunner, nodes: &[NodeIndex], instances: usize) {
    for i in 0..instances {
        let reference = &runner.certs(nodes[0])[i];
        assert_eq!(reference.vote.instance, i as u64);
        assert_eq!(reference.vote.phase, Phase::Decide);
        assert_eq!(reference.vote.round, 0);
        assert!(
            !reference.vote.value.is_bottom(),
            "instance {i} decided bottom"
        );
        for &node in &nodes[1..] {
            let cert = &runner.certs(node)[i];
            assert_eq!(
                cert.vote.value, reference.vote.value,
                "node {node} disagrees at instance {i}"
            );
        }
    }
}

/// Scenario: two participants with equal power decide instance after
/// instance at round zero, and the latest certificate advances accordingly.
#[traced_test]
#[test]
fn test_two_participants_decide_five_instances() {
    let mut runner = SimulationRunner::new(fast_network(2), GpbftConfig::default(), 42);
    runner.start_all();

    let done = runner.run_until_nodes_reach(&[0, 1], 5, Duration::from_secs(600));
    assert!(done, "both nodes should decide five instances");

    assert_agreement(&runner, &[0, 1], 5);
    // The fifth certificate is for instance 4.
    assert_eq!(runner.certs(0)[4].vote.instance, 4);
    assert_eq!(runner.stats().fatal_errors, 0);
    // The happy path needs no round escalation, so every decision lands
    // within a couple of message delays.
    assert!(runner.now() < Duration::from_secs(10), "now {:?}", runner.now());
}

/// Three equal participants, light packet loss: decisions keep flowing with
/// rebroadcast and the background certificate exchange covering the gaps.
#[test]
fn test_three_participants_progress_under_packet_loss() {
    let network = NetworkConfig {
        num_participants: 3,
        base_latency: Duration::from_millis(50),
        jitter_fraction: 0.2,
        packet_loss_rate: 0.02,
    };
    let mut runner = SimulationRunner::new(network, GpbftConfig::default(), 7);
    runner.start_all();

    let nodes = [0, 1, 2];
    let mut done = false;
    for _ in 0..40 {
        if runner.run_until_nodes_reach(&nodes, 3, runner.now() + Duration::from_secs(30)) {
            done = true;
            break;
        }
        // The external certificate exchange runs continuously in a real
        // deployment; model it as a periodic sweep.
        runner.exchange_certificates();
    }
    assert!(done, "all nodes should hold three certificates");
    assert_agreement(&runner, &nodes, 3);
    assert_eq!(runner.stats().fatal_errors, 0);
}

/// Scenario: a paused participant misses several instances and catches back
/// up through certificate exchange once resumed.
#[traced_test]
#[test]
fn test_paused_participant_catches_up() {
    let mut runner = SimulationRunner::new(fast_network(3), GpbftConfig::default(), 11);
    runner.start_all();
    runner.pause(2);

    // The live pair keeps deciding without the paused node.
    let done = runner.run_until_nodes_reach(&[0, 1], 3, Duration::from_secs(300));
    assert!(done, "remaining quorum should keep deciding");
    assert!(runner.certs(2).is_empty());

    runner.resume(2);
    let nodes = [0, 1, 2];
    let mut done = false;
    for _ in 0..20 {
        runner.exchange_certificates();
        if runner.run_until_nodes_reach(&nodes, 5, runner.now() + Duration::from_secs(30)) {
            done = true;
            break;
        }
    }
    assert!(done, "resumed node should reach the frontier");
    assert_agreement(&runner, &nodes, 5);
    assert_eq!(runner.stats().fatal_errors, 0);
}

/// Scenario: a participant holding more than a third of the power drops out
/// of gossip; everyone stalls and rebroadcasts. After reconnection the
/// rebroadcasts alone carry the committee to a decision, with no external
/// catch-up.
#[traced_test]
#[test]
fn test_isolated_heavy_participant_recovers_via_rebroadcast() {
    // Node 2 holds 3/7 of the power: no strong quorum forms without it.
    let mut runner = SimulationRunner::new_weighted(
        fast_network(3),
        GpbftConfig::default(),
        23,
        &[2, 2, 3],
    );
    runner.network_mut().isolate_node(2);
    runner.start_all();

    // Many phase timeouts pass with no decision anywhere.
    runner.run_until(Duration::from_secs(60));
    assert!(runner.certs(0).is_empty());
    assert!(runner.certs(1).is_empty());
    assert!(runner.certs(2).is_empty());
    assert!(
        runner.stats().rebroadcasts > 0,
        "stalled nodes should be rebroadcasting"
    );

    // Reconnect: accumulated rebroadcasts deliver the missing QUALITY and
    // PREPARE votes, and the instance completes for everyone.
    runner.network_mut().heal_node(2);
    let nodes = [0, 1, 2];
    let done = runner.run_until_nodes_reach(&nodes, 1, Duration::from_secs(300));
    assert!(done, "reconnection should unblock the instance");
    assert_agreement(&runner, &nodes, 1);

    // With the network whole again, the next instance decides the full
    // proposal promptly.
    let done = runner.run_until_nodes_reach(&nodes, 2, runner.now() + Duration::from_secs(60));
    assert!(done, "next instance should decide promptly");
    assert_agreement(&runner, &nodes, 2);
    assert_eq!(runner.certs(0)[1].vote.value.len(), 2);
    assert_eq!(runner.stats().fatal_errors, 0);
}

/// Certificates chain across instances: each instance's decision extends the
/// previous decision's head.
#[test]
fn test_decisions_chain_across_instances() {
    let mut runner = SimulationRunner::new(fast_network(3), GpbftConfig::default(), 5);
    runner.start_all();
    let nodes = [0, 1, 2];
    assert!(runner.run_until_nodes_reach(&nodes, 4, Duration::from_secs(600)));

    for node in nodes {
        let certs = runner.certs(node);
        for window in certs.windows(2) {
            let previous_head = window[0].vote.value.head().expect("non-bottom decision");
            let next_base = window[1].vote.value.base().expect("non-bottom decision");
            assert_eq!(next_base, previous_head, "instances must chain");
        }
    }
}

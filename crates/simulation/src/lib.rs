//! Deterministic simulation harness for Granite consensus.
//!
//! Runs a set of participants over a simulated network with a virtual clock.
//! Events are processed in a deterministic order and all randomness (latency
//! jitter, packet loss) is drawn from a seeded generator: given the same
//! seed, a simulation produces identical results every run.

mod event_queue;
mod network;
mod runner;
mod signing;

pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationRunner, SimulationStats};
pub use signing::{ConcatAggregate, SigningBackend};

/// Index of a participant in the simulation.
pub type NodeIndex = u32;

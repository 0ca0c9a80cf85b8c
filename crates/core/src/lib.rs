//! Core types for the Granite host boundary.
//!
//! This crate defines the contract between a consensus instance and its host:
//!
//! - [`Event`]: All possible inputs to the instance
//! - [`Action`]: All possible outputs from the instance
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait the instance implements
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the host (simulation or production) which:
//! 1. Sets the instance's virtual time
//! 2. Delivers events to the instance
//! 3. Executes the returned actions (signing, transmitting, scheduling the
//!    single pending alarm)

mod action;
mod event;
mod message;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use message::{Instant, InstanceProgress, MessageBuilder};

use std::time::Duration;

/// A synchronous, host-driven state machine.
///
/// The host is the only caller and drives the machine serially from one event
/// loop; implementations are never entered concurrently.
pub trait StateMachine {
    /// The error type surfaced by event handling.
    type Error;

    /// Inject the current virtual time. Called by the host before every
    /// `handle`.
    fn set_time(&mut self, now: Duration);

    /// Process one event and return the actions it produced.
    fn handle(&mut self, event: Event) -> Result<Vec<Action>, Self::Error>;
}

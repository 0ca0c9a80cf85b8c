//! Granite consensus state machine.
//!
//! This crate provides the per-instance consensus core: a synchronous state
//! machine that layers deterministic finality on top of an
//! eventually-consistent chain.
//!
//! # Architecture
//!
//! The instance processes events synchronously:
//!
//! - `Event::MessageReceived` → ingest one vote, try to complete the phase
//! - `Event::BatchReceived` → ingest many votes, then evaluate skip-ahead once
//! - `Event::AlarmFired` → complete a timed-out phase or rebroadcast
//!
//! All I/O is performed by the host via returned `Action`s.
//!
//! # Protocol
//!
//! One instance decides one chain. Round zero starts with QUALITY, where
//! participants whittle the input down to the longest prefix with a strong
//! quorum of support. Every round then runs PREPARE and COMMIT; a strong
//! quorum of COMMITs for a value decides it, a strong quorum for bottom moves
//! to the next round, which opens with CONVERGE: a power-weighted ticket
//! lottery that collapses diverging proposals back to one.
//!
//! ## Safety
//!
//! - At most one message per (sender, round, phase) is counted; later values
//!   from the same sender are dropped silently (equivocation handling).
//! - A COMMIT accumulator stays open forever: a late strong quorum must still
//!   decide in its round, no matter how far the instance has moved on.
//! - Every non-bottom COMMIT and every CONVERGE carries a justification — an
//!   aggregate-signature certificate of the strong quorum that allows it.
//!
//! ## Liveness
//!
//! - Phase timeouts grow exponentially with the round number.
//! - Messages from future rounds can pull the instance forward (skip-to-round
//!   on weak-quorum evidence, skip-to-decide on any valid DECIDE).
//! - Rebroadcast requests repeat with exponential backoff once a phase
//!   lingers past its timeout.

mod config;
mod converge;
mod error;
mod instance;
mod quorum;
mod ticket;

pub use config::{ConfigError, GpbftConfig};
pub use converge::{ConvergeState, ConvergeValue};
pub use error::GpbftError;
pub use instance::{Instance, RoundState};
pub use quorum::{has_weak_quorum, is_strong_quorum, QuorumResult, QuorumState};
pub use ticket::compute_ticket_rank;

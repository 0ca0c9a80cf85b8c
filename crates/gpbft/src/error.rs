//! Error taxonomy of the consensus core.

use granite_types::{AggregateError, ChainError, Phase};
use thiserror::Error;

/// Errors surfaced by an instance.
///
/// Three kinds, with different handling:
///
/// - **Validation** errors reject a message at ingress. In batch mode they
///   are logged and the batch continues; in single mode they surface to the
///   caller. See [`GpbftError::is_validation`].
/// - **After-termination** deliveries are surfaced but benign; the host
///   should stop delivering.
/// - **Fatal** errors mean a broken safety assumption or host. The instance
///   must be dropped and never restarted on the same input. See
///   [`GpbftError::is_fatal`].
#[derive(Debug, Error)]
pub enum GpbftError {
    #[error("message for instance {got}, expected {expected}")]
    WrongInstance { got: u64, expected: u64 },

    #[error("message supplemental data differs from this instance's")]
    WrongSupplement,

    #[error("message value does not extend this instance's base")]
    WrongBase,

    #[error("{0} message with bottom value")]
    BottomVote(Phase),

    #[error("{0} message without required justification")]
    MissingJustification(Phase),

    #[error("unexpected message phase {0}")]
    UnexpectedMessagePhase(Phase),

    #[error("message or alarm received after termination")]
    ReceivedAfterTermination,

    #[error("input chain must not be bottom")]
    EmptyInput,

    #[error("invalid input chain: {0}")]
    InvalidInput(#[from] ChainError),

    #[error("signature aggregation failed: {0}")]
    Aggregation(#[from] AggregateError),

    #[error("invariant violation: {0}")]
    Invariant(&'static str),
}

impl GpbftError {
    /// Whether this is a recoverable per-message validation error.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GpbftError::WrongInstance { .. }
                | GpbftError::WrongSupplement
                | GpbftError::WrongBase
                | GpbftError::BottomVote(_)
                | GpbftError::MissingJustification(_)
                | GpbftError::UnexpectedMessagePhase(_)
        )
    }

    /// Whether this error aborts the instance.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GpbftError::Invariant(_) | GpbftError::Aggregation(_)
        )
    }
}

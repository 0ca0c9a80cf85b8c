//! Cryptographic capability surface.
//!
//! The core never performs cryptography itself: signing and verification of
//! individual messages happen in the host before delivery. The one operation
//! invoked synchronously inside the core is signature aggregation while
//! building a justification, expressed by the [`Aggregate`] capability.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A participant's public key, as raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKey(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl PubKey {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Errors produced by signature aggregation.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("signer index {0} out of power table range")]
    SignerOutOfRange(u64),

    #[error("{signatures} signatures for {signers} signers")]
    CountMismatch { signers: usize, signatures: usize },

    #[error("aggregation backend: {0}")]
    Backend(String),
}

/// Aggregates signatures over one payload into a single certificate
/// signature.
///
/// Implementations are read-only from the core's perspective and must be
/// usable from the instance's thread during justification building. A failure
/// here is fatal to the instance: a strong quorum attested the payload, so an
/// unaggregatable quorum indicates a broken host.
pub trait Aggregate: Send + Sync {
    /// Aggregate `signatures`, one per entry of `signer_indices` (indices
    /// into the canonical power table ordering, ascending).
    fn aggregate(
        &self,
        signer_indices: &[u64],
        signatures: &[Vec<u8>],
    ) -> Result<Vec<u8>, AggregateError>;
}

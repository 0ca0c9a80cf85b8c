//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! CBOR(GMessage)            plain codec
//! zstd(CBOR(GMessage))      compressed codec
//! ```
//!
//! Both directions enforce [`MAX_DECOMPRESSED_SIZE`]: encoding refuses
//! bodies that could not be decompressed by a peer, decoding caps the
//! decompressor's output.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use granite_types::GMessage;
use thiserror::Error;

type Blake2b256 = Blake2b<U32>;

/// Maximum decompressed message size: the default maximum message size in
/// the gossip layer.
pub const MAX_DECOMPRESSED_SIZE: usize = 1 << 20;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoded message too large: {0} > {MAX_DECOMPRESSED_SIZE}")]
    TooLarge(usize),

    #[error("CBOR encode error: {0}")]
    Encode(String),

    #[error("CBOR decode error: {0}")]
    Decode(String),

    #[error("zstd error: {0}")]
    Compression(#[from] std::io::Error),
}

/// Encodes and decodes protocol messages for transport.
pub trait GMessageCodec {
    fn encode(&self, msg: &GMessage) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<GMessage, CodecError>;
}

/// Plain CBOR codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl GMessageCodec for CborCodec {
    fn encode(&self, msg: &GMessage) -> Result<Vec<u8>, CodecError> {
        fvm_ipld_encoding::to_vec(msg).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<GMessage, CodecError> {
        fvm_ipld_encoding::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// CBOR wrapped in a Zstandard frame.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl GMessageCodec for ZstdCodec {
    fn encode(&self, msg: &GMessage) -> Result<Vec<u8>, CodecError> {
        let body = CborCodec.encode(msg)?;
        // Refuse early anything a peer could not decompress.
        if body.len() > MAX_DECOMPRESSED_SIZE {
            return Err(CodecError::TooLarge(body.len()));
        }
        Ok(zstd::bulk::compress(&body, self.level)?)
    }

    fn decode(&self, data: &[u8]) -> Result<GMessage, CodecError> {
        let body = zstd::bulk::decompress(data, MAX_DECOMPRESSED_SIZE)?;
        CborCodec.decode(&body)
    }
}

/// Content-derived message id for gossip deduplication.
///
/// Hashes the canonical encoding of the whole message, so identical
/// retransmissions deduplicate while any change in content (a rebroadcast
/// with a different justification, a different vote) yields a fresh id.
/// Never a prefix of the raw frame: compressed frames share long prefixes.
pub fn message_fingerprint(msg: &GMessage) -> Result<[u8; 32], CodecError> {
    let body = CborCodec.encode(msg)?;
    Ok(Blake2b256::digest(&body).into())
}

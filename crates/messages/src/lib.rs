//! Wire encoding for Granite protocol messages.
//!
//! Messages travel as canonical CBOR, optionally wrapped in a Zstandard
//! frame. Decompression is bounded to the gossip layer's maximum message
//! size, so a hostile frame cannot balloon in memory.

mod wire;

pub use wire::{
    message_fingerprint, CborCodec, CodecError, GMessageCodec, ZstdCodec, MAX_DECOMPRESSED_SIZE,
};

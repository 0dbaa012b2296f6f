//! courier-chunks: fixed-size chunking and chunk integrity hashing
//!
//! # Overview
//! - `fixed`: split a byte stream into fixed-size indexed blocks and join them back in index order
//! - `digest`: SHA-256 over chunk ciphertext, with a full-length comparison for verification

pub mod digest;
pub mod fixed;

pub use digest::{digest, digest_from_hex, digest_to_hex, verify};
pub use fixed::{join, split, validate_sequence, ChunkSize, RawChunk};

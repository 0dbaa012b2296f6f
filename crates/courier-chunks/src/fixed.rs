//! Fixed-size chunking
//!
//! A file is cut into consecutive blocks of exactly `chunk_size` bytes; only
//! the final block may be shorter. Empty input produces no chunks. Indices are
//! 0-based and dense, and reassembly always follows index order regardless of
//! the order chunks arrive in.

use std::num::NonZeroUsize;

use courier_core::config::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use courier_core::{CourierError, CourierResult, SequenceError};

/// Validated chunk size in bytes (1..=64 MiB)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSize(NonZeroUsize);

impl ChunkSize {
    pub fn new(bytes: usize) -> CourierResult<Self> {
        match NonZeroUsize::new(bytes) {
            Some(n) if bytes <= MAX_CHUNK_SIZE => Ok(Self(n)),
            _ => Err(CourierError::Configuration(format!(
                "chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes (got {bytes})"
            ))),
        }
    }

    pub fn get(self) -> usize {
        self.0.get()
    }

    /// Number of chunks `len` plaintext bytes split into
    pub fn chunk_count(self, len: usize) -> usize {
        len.div_ceil(self.get())
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        // DEFAULT_CHUNK_SIZE is a non-zero constant
        Self(NonZeroUsize::new(DEFAULT_CHUNK_SIZE).unwrap_or(NonZeroUsize::MIN))
    }
}

/// A plaintext block borrowed from the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawChunk<'a> {
    pub index: u64,
    pub data: &'a [u8],
}

/// Split `data` into consecutive blocks of at most `size` bytes.
pub fn split(data: &[u8], size: ChunkSize) -> Vec<RawChunk<'_>> {
    data.chunks(size.get())
        .enumerate()
        .map(|(i, block)| RawChunk {
            index: i as u64,
            data: block,
        })
        .collect()
}

/// Check that `indices`, given in ascending order, are exactly `0, 1, ..., N-1`.
pub fn validate_sequence<I>(indices: I) -> Result<(), SequenceError>
where
    I: IntoIterator<Item = u64>,
{
    let mut expected = 0u64;
    for index in indices {
        if index < expected {
            return Err(SequenceError::Duplicate { index });
        }
        if index > expected {
            return Err(SequenceError::Gap {
                expected,
                found: index,
            });
        }
        expected += 1;
    }
    Ok(())
}

/// Concatenate chunk payloads in ascending index order.
///
/// `chunks` may arrive in any order; it must contain each index in `[0, N)`
/// exactly once.
pub fn join(mut chunks: Vec<(u64, Vec<u8>)>) -> Result<Vec<u8>, SequenceError> {
    chunks.sort_by_key(|(index, _)| *index);
    validate_sequence(chunks.iter().map(|(index, _)| *index))?;

    let total = chunks.iter().map(|(_, payload)| payload.len()).sum();
    let mut out = Vec::with_capacity(total);
    for (_, payload) in chunks {
        out.extend_from_slice(&payload);
    }
    Ok(out)
}

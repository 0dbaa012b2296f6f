//! Transfer encoding and decoding
//!
//! Encode: session key → wrap under recipient key → split → encrypt + hash each
//! chunk (in parallel) → record.
//!
//! Decode: unwrap session key → check index sequence → verify every chunk hash
//! → decrypt every chunk (in parallel) → join in index order.
//!
//! Both directions are all-or-nothing: either a complete record / complete
//! plaintext is returned, or an error and nothing else.

use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use tracing::debug;

use courier_chunks::{digest, join, split, validate_sequence, verify, ChunkSize};
use courier_core::config::TransferConfig;
use courier_core::types::{validate_filename, validate_identity};
use courier_core::{Chunk, CourierError, CourierResult, TransferRecord};

use crate::directory::PublicKeyDirectory;
use crate::envelope::{unwrap_key, wrap_key};
use crate::keys::{generate_session_key, RecipientPrivateKey, RecipientPublicKey};
use crate::symmetric::{decrypt_chunk, encrypt_chunk};

/// Progress callback type (chunks_done, chunks_total). Called from worker threads.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Builds [`TransferRecord`]s from plaintext.
#[derive(Debug, Clone)]
pub struct TransferEncoder {
    chunk_size: ChunkSize,
    min_rsa_bits: usize,
}

impl Default for TransferEncoder {
    fn default() -> Self {
        Self {
            chunk_size: ChunkSize::default(),
            min_rsa_bits: courier_core::config::MIN_RSA_BITS,
        }
    }
}

impl TransferEncoder {
    pub fn new(chunk_size: ChunkSize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    pub fn from_config(config: &TransferConfig) -> CourierResult<Self> {
        config.validate()?;
        Ok(Self {
            chunk_size: ChunkSize::new(config.chunk_size)?,
            min_rsa_bits: config.min_rsa_bits,
        })
    }

    /// Same policy, different chunk size.
    pub fn with_chunk_size(mut self, chunk_size: ChunkSize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    pub fn min_rsa_bits(&self) -> usize {
        self.min_rsa_bits
    }

    /// Encrypt `plaintext` for the holder of `recipient_key`.
    pub fn encode(
        &self,
        plaintext: &[u8],
        sender_id: &str,
        recipient_id: &str,
        filename: &str,
        recipient_key: &RecipientPublicKey,
    ) -> CourierResult<TransferRecord> {
        self.encode_with_progress(plaintext, sender_id, recipient_id, filename, recipient_key, None)
    }

    /// Resolve the recipient's key through `directory`, then encode.
    ///
    /// An unknown recipient fails before any session key or chunk exists.
    pub fn encode_for<D>(
        &self,
        directory: &D,
        plaintext: &[u8],
        sender_id: &str,
        recipient_id: &str,
        filename: &str,
    ) -> CourierResult<TransferRecord>
    where
        D: PublicKeyDirectory + ?Sized,
    {
        let recipient_key = directory.public_key(recipient_id)?;
        self.encode(plaintext, sender_id, recipient_id, filename, &recipient_key)
    }

    pub fn encode_with_progress(
        &self,
        plaintext: &[u8],
        sender_id: &str,
        recipient_id: &str,
        filename: &str,
        recipient_key: &RecipientPublicKey,
        progress: Option<&ProgressFn>,
    ) -> CourierResult<TransferRecord> {
        validate_identity(sender_id)?;
        validate_identity(recipient_id)?;
        validate_filename(filename)?;
        if recipient_key.bits() < self.min_rsa_bits {
            return Err(CourierError::Configuration(format!(
                "recipient key for '{recipient_id}' is {} bits; at least {} required",
                recipient_key.bits(),
                self.min_rsa_bits
            )));
        }

        let session_key = generate_session_key();
        let wrapped_key = wrap_key(&session_key, recipient_key)?;

        let blocks = split(plaintext, self.chunk_size);
        let total = blocks.len() as u64;
        let done = AtomicU64::new(0);

        // Indexed parallel collect keeps index order.
        let chunks: Vec<Chunk> = blocks
            .par_iter()
            .map(|block| {
                let ciphertext = encrypt_chunk(&session_key, block.data);
                let integrity_hash = digest(&ciphertext);
                debug!(index = block.index, bytes = block.data.len(), "chunk encrypted");
                if let Some(cb) = progress {
                    cb(done.fetch_add(1, Ordering::Relaxed) + 1, total);
                }
                Chunk {
                    index: block.index,
                    ciphertext,
                    integrity_hash,
                }
            })
            .collect();

        Ok(TransferRecord {
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            filename: filename.to_string(),
            wrapped_key,
            chunks,
        })
    }
}

/// Recover and verify the plaintext of `record`. Fails closed.
pub fn decode_transfer(
    record: &TransferRecord,
    recipient_key: &RecipientPrivateKey,
) -> CourierResult<Vec<u8>> {
    decode_transfer_with_progress(record, recipient_key, None)
}

pub fn decode_transfer_with_progress(
    record: &TransferRecord,
    recipient_key: &RecipientPrivateKey,
    progress: Option<&ProgressFn>,
) -> CourierResult<Vec<u8>> {
    let session_key = unwrap_key(&record.wrapped_key, recipient_key)?;

    let mut ordered: Vec<&Chunk> = record.chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);
    validate_sequence(ordered.iter().map(|c| c.index))?;

    // Every hash is checked before any chunk is decrypted; find_first reports
    // the lowest failing index.
    if let Some(bad) = ordered
        .par_iter()
        .find_first(|c| !verify(&c.ciphertext, &c.integrity_hash))
    {
        return Err(CourierError::Integrity { index: bad.index });
    }

    let total = ordered.len() as u64;
    let done = AtomicU64::new(0);

    let decrypted: Vec<CourierResult<(u64, Vec<u8>)>> = ordered
        .par_iter()
        .map(|c| {
            let plaintext = decrypt_chunk(&session_key, &c.ciphertext).map_err(|source| {
                CourierError::Cipher {
                    index: c.index,
                    source,
                }
            })?;
            if let Some(cb) = progress {
                cb(done.fetch_add(1, Ordering::Relaxed) + 1, total);
            }
            Ok((c.index, plaintext))
        })
        .collect();

    // First failure in index order wins.
    let payloads = decrypted.into_iter().collect::<CourierResult<Vec<_>>>()?;

    Ok(join(payloads)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_keys::{alice, bob};
    use proptest::prelude::*;

    const MIB: usize = 1024 * 1024;

    fn small_encoder() -> TransferEncoder {
        TransferEncoder::new(ChunkSize::new(64).unwrap())
    }

    fn encode_for_bob(encoder: &TransferEncoder, plaintext: &[u8]) -> TransferRecord {
        encoder
            .encode(plaintext, "alice", "bob", "notes.txt", bob().public_key())
            .unwrap()
    }

    #[test]
    fn test_roundtrip_multi_chunk() {
        let plaintext: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let record = encode_for_bob(&small_encoder(), &plaintext);

        assert_eq!(record.chunks.len(), 16);
        assert_eq!(record.sender_id, "alice");
        assert_eq!(record.recipient_id, "bob");
        assert_eq!(record.filename, "notes.txt");

        let decoded = decode_transfer(&record, bob().private_key()).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn test_empty_file_has_zero_chunks() {
        let record = encode_for_bob(&small_encoder(), b"");
        assert!(record.chunks.is_empty());
        assert!(!record.wrapped_key.is_empty());

        let decoded = decode_transfer(&record, bob().private_key()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_two_and_a_half_mib_scenario() {
        let plaintext: Vec<u8> = (0..(2 * MIB + MIB / 2)).map(|i| (i * 31 % 256) as u8).collect();
        let encoder = TransferEncoder::new(ChunkSize::new(MIB).unwrap());
        let record = encode_for_bob(&encoder, &plaintext);

        assert_eq!(record.chunks.len(), 3);
        // IV + padded payload: full chunks gain one pad block, the half chunk too
        assert_eq!(record.chunks[0].ciphertext.len(), 16 + MIB + 16);
        assert_eq!(record.chunks[1].ciphertext.len(), 16 + MIB + 16);
        assert_eq!(record.chunks[2].ciphertext.len(), 16 + MIB / 2 + 16);

        let decoded = decode_transfer(&record, bob().private_key()).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn test_chunks_in_index_order_with_valid_hashes() {
        let record = encode_for_bob(&small_encoder(), &[9u8; 300]);
        for (i, chunk) in record.chunks.iter().enumerate() {
            assert_eq!(chunk.index, i as u64);
            assert!(verify(&chunk.ciphertext, &chunk.integrity_hash));
        }
    }

    #[test]
    fn test_record_never_contains_plaintext() {
        let plaintext = b"TOP-SECRET-MARKER-TOP-SECRET-MARKER".repeat(8);
        let record = encode_for_bob(&small_encoder(), &plaintext);
        let needle = b"TOP-SECRET-MARKER";
        for chunk in &record.chunks {
            assert!(!chunk.ciphertext.windows(needle.len()).any(|w| w == needle));
        }
    }

    #[test]
    fn test_tampered_chunk_reports_its_index() {
        let mut record = encode_for_bob(&small_encoder(), &[1u8; 500]);
        record.chunks[3].ciphertext[20] ^= 0x01;

        let err = decode_transfer(&record, bob().private_key()).unwrap_err();
        assert!(matches!(err, CourierError::Integrity { index: 3 }), "got {err:?}");
    }

    #[test]
    fn test_lowest_tampered_index_is_reported() {
        let mut record = encode_for_bob(&small_encoder(), &[1u8; 500]);
        record.chunks[6].ciphertext[0] ^= 0x80;
        record.chunks[2].integrity_hash[0] ^= 0x80;

        let err = decode_transfer(&record, bob().private_key()).unwrap_err();
        assert!(matches!(err, CourierError::Integrity { index: 2 }));
    }

    #[test]
    fn test_wrong_recipient_key_is_key_recovery_error() {
        let record = encode_for_bob(&small_encoder(), b"for bob only");
        let err = decode_transfer(&record, alice().private_key()).unwrap_err();
        assert!(matches!(err, CourierError::KeyRecovery));
    }

    #[test]
    fn test_corrupted_wrapped_key_is_key_recovery_error() {
        let mut record = encode_for_bob(&small_encoder(), b"payload");
        record.wrapped_key[0] ^= 0xFF;
        let err = decode_transfer(&record, bob().private_key()).unwrap_err();
        assert!(matches!(err, CourierError::KeyRecovery));
    }

    #[test]
    fn test_missing_chunk_is_sequence_error() {
        let mut record = encode_for_bob(&small_encoder(), &[7u8; 300]);
        record.chunks.remove(2);
        let err = decode_transfer(&record, bob().private_key()).unwrap_err();
        assert!(matches!(err, CourierError::Sequence(_)));
    }

    #[test]
    fn test_duplicate_chunk_is_sequence_error() {
        let mut record = encode_for_bob(&small_encoder(), &[7u8; 300]);
        let dup = record.chunks[1].clone();
        record.chunks.push(dup);
        let err = decode_transfer(&record, bob().private_key()).unwrap_err();
        assert!(matches!(err, CourierError::Sequence(_)));
    }

    #[test]
    fn test_out_of_order_chunks_still_decode() {
        let plaintext: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        let mut record = encode_for_bob(&small_encoder(), &plaintext);
        record.chunks.reverse();
        record.chunks.swap(0, 4);

        let decoded = decode_transfer(&record, bob().private_key()).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn test_rehashed_garbage_is_cipher_error() {
        // A relay that replaces a chunk and recomputes its hash passes the
        // integrity check; the cipher layer still refuses the chunk.
        let mut record = encode_for_bob(&small_encoder(), &[3u8; 200]);
        record.chunks[1].ciphertext.truncate(20);
        record.chunks[1].integrity_hash = digest(&record.chunks[1].ciphertext);

        let err = decode_transfer(&record, bob().private_key()).unwrap_err();
        assert!(matches!(err, CourierError::Cipher { index: 1, .. }));
    }

    #[test]
    fn test_invalid_identity_rejected_before_crypto() {
        let err = small_encoder()
            .encode(b"x", "", "bob", "notes.txt", bob().public_key())
            .unwrap_err();
        assert!(matches!(err, CourierError::Configuration(_)));

        let err = small_encoder()
            .encode(b"x", "alice", "bob", "../etc/passwd", bob().public_key())
            .unwrap_err();
        assert!(matches!(err, CourierError::Configuration(_)));
    }

    #[test]
    fn test_min_rsa_bits_policy() {
        let config = TransferConfig {
            chunk_size: 1024,
            workers: 0,
            min_rsa_bits: 4096,
        };
        let encoder = TransferEncoder::from_config(&config).unwrap();
        let err = encoder
            .encode(b"x", "alice", "bob", "notes.txt", bob().public_key())
            .unwrap_err();
        assert!(matches!(err, CourierError::Configuration(_)));
    }

    #[test]
    fn test_chunk_size_override_keeps_rsa_policy() {
        let config = TransferConfig {
            chunk_size: 1024,
            workers: 0,
            min_rsa_bits: 4096,
        };
        let encoder = TransferEncoder::from_config(&config)
            .unwrap()
            .with_chunk_size(ChunkSize::new(64).unwrap());
        assert_eq!(encoder.chunk_size().get(), 64);
        assert_eq!(encoder.min_rsa_bits(), 4096);

        let err = encoder
            .encode(b"x", "alice", "bob", "notes.txt", bob().public_key())
            .unwrap_err();
        assert!(matches!(err, CourierError::Configuration(_)));
    }

    #[test]
    fn test_progress_reports_every_chunk() {
        let seen = std::sync::Arc::new(AtomicU64::new(0));
        let seen_cb = std::sync::Arc::clone(&seen);
        let cb = move |_done: u64, total: u64| {
            assert_eq!(total, 5);
            seen_cb.fetch_add(1, Ordering::Relaxed);
        };
        small_encoder()
            .encode_with_progress(&[0u8; 300], "alice", "bob", "p.bin", bob().public_key(), Some(&cb))
            .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn roundtrip_any_payload(
            plaintext in proptest::collection::vec(any::<u8>(), 0..=2048),
            chunk_size in 1usize..=700,
        ) {
            let encoder = TransferEncoder::new(ChunkSize::new(chunk_size).unwrap());
            let record = encode_for_bob(&encoder, &plaintext);
            prop_assert_eq!(record.chunks.len(), plaintext.len().div_ceil(chunk_size));
            prop_assert_eq!(decode_transfer(&record, bob().private_key()).unwrap(), plaintext);
        }

        #[test]
        fn any_bit_flip_is_caught_at_its_chunk(
            plaintext in proptest::collection::vec(any::<u8>(), 1..=1024),
            pick in any::<usize>(),
            bit in 0u8..8,
        ) {
            let mut record = encode_for_bob(&small_encoder(), &plaintext);
            let index = pick % record.chunks.len();
            let chunk = &mut record.chunks[index];
            let byte = (pick / 7) % chunk.ciphertext.len();
            chunk.ciphertext[byte] ^= 1 << bit;

            let err = decode_transfer(&record, bob().private_key()).unwrap_err();
            prop_assert!(
                matches!(err, CourierError::Integrity { index: i } if i == index as u64),
                "expected integrity error at {}, got {:?}", index, err
            );
        }
    }
}

//! Transfer records and their wire envelope
//!
//! In memory a [`TransferRecord`] holds raw bytes. On the wire and at rest it
//! travels as a [`WireRecord`]:
//! ```text
//! {from, to, filename, encrypted_key: base64, chunks: [{index, data: base64(iv || ct), hash: hex sha256}]}
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{CourierError, CourierResult};
use crate::proto;

/// Length of a chunk integrity digest (SHA-256)
pub const DIGEST_LEN: usize = 32;

pub type IntegrityHash = [u8; DIGEST_LEN];

/// One encrypted chunk. Immutable once produced.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based position in the original file
    pub index: u64,
    /// `[16-byte IV][AES-256-CBC ciphertext]`
    pub ciphertext: Vec<u8>,
    /// SHA-256 of `ciphertext`
    pub integrity_hash: IntegrityHash,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("index", &self.index)
            .field("ciphertext_len", &self.ciphertext.len())
            .field("integrity_hash", &hex::encode(self.integrity_hash))
            .finish()
    }
}

/// A self-contained encrypted transfer: everything the recipient needs except
/// their private key. Never holds plaintext or a session key in the clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub sender_id: String,
    pub recipient_id: String,
    pub filename: String,
    /// Session key wrapped under the recipient's public key (RSA-OAEP)
    pub wrapped_key: Vec<u8>,
    /// Chunks ordered by index
    pub chunks: Vec<Chunk>,
}

impl TransferRecord {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total ciphertext bytes across all chunks
    pub fn ciphertext_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.ciphertext.len() as u64).sum()
    }

    pub fn summary(&self, stored_at: u64) -> TransferSummary {
        TransferSummary {
            sender_id: self.sender_id.clone(),
            recipient_id: self.recipient_id.clone(),
            filename: self.filename.clone(),
            chunk_count: self.chunks.len() as u64,
            stored_at,
        }
    }
}

/// Mailbox listing entry: record identity without chunk payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    pub sender_id: String,
    pub recipient_id: String,
    pub filename: String,
    pub chunk_count: u64,
    /// Unix timestamp (seconds) at which the relay accepted the record
    pub stored_at: u64,
}

/// Longest accepted identity or filename, in bytes
pub const MAX_NAME_LEN: usize = 255;

/// Check an identity id: non-empty, `[A-Za-z0-9._-]` only, no leading dot.
///
/// Identities name key files on disk, so anything that could escape a
/// directory is refused.
pub fn validate_identity(id: &str) -> CourierResult<()> {
    if id.is_empty() {
        return Err(CourierError::Configuration("identity must not be empty".into()));
    }
    if id.len() > MAX_NAME_LEN {
        return Err(CourierError::Configuration(format!(
            "identity longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if id.starts_with('.') {
        return Err(CourierError::Configuration(format!(
            "identity '{id}' must not start with '.'"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(CourierError::Configuration(format!(
            "identity '{id}' contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Check a transfer filename: a single non-empty path component without
/// control characters.
pub fn validate_filename(name: &str) -> CourierResult<()> {
    if name.is_empty() {
        return Err(CourierError::Configuration("filename must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CourierError::Configuration(format!(
            "filename longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(CourierError::Configuration(format!(
            "filename '{name}' must be a bare file name"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(CourierError::Configuration(
            "filename contains control characters".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireChunk {
    pub index: u64,
    /// base64 of `[IV][ciphertext]`
    pub data: String,
    /// lowercase hex SHA-256 of the decoded `data`
    pub hash: String,
}

/// Text encoding of a [`TransferRecord`], used for JSON at rest and for gRPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    pub from: String,
    pub to: String,
    pub filename: String,
    pub encrypted_key: String,
    pub chunks: Vec<WireChunk>,
}

impl WireRecord {
    pub fn to_json(&self) -> CourierResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| CourierError::Storage(format!("record serialization: {e}")))
    }

    pub fn from_json(data: &[u8]) -> CourierResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CourierError::Storage(format!("record deserialization: {e}")))
    }
}

impl From<&TransferRecord> for WireRecord {
    fn from(record: &TransferRecord) -> Self {
        Self {
            from: record.sender_id.clone(),
            to: record.recipient_id.clone(),
            filename: record.filename.clone(),
            encrypted_key: STANDARD.encode(&record.wrapped_key),
            chunks: record
                .chunks
                .iter()
                .map(|c| WireChunk {
                    index: c.index,
                    data: STANDARD.encode(&c.ciphertext),
                    hash: hex::encode(c.integrity_hash),
                })
                .collect(),
        }
    }
}

impl TryFrom<WireRecord> for TransferRecord {
    type Error = CourierError;

    /// Undecodable key material is a key-recovery failure; an undecodable
    /// chunk payload or hash is an integrity failure at that chunk.
    fn try_from(wire: WireRecord) -> CourierResult<Self> {
        let wrapped_key = STANDARD
            .decode(wire.encrypted_key.as_bytes())
            .map_err(|_| CourierError::KeyRecovery)?;

        let chunks = wire
            .chunks
            .into_iter()
            .map(|c| {
                let ciphertext = STANDARD
                    .decode(c.data.as_bytes())
                    .map_err(|_| CourierError::Integrity { index: c.index })?;
                let mut integrity_hash = [0u8; DIGEST_LEN];
                hex::decode_to_slice(c.hash.as_bytes(), &mut integrity_hash)
                    .map_err(|_| CourierError::Integrity { index: c.index })?;
                Ok(Chunk {
                    index: c.index,
                    ciphertext,
                    integrity_hash,
                })
            })
            .collect::<CourierResult<Vec<_>>>()?;

        Ok(TransferRecord {
            sender_id: wire.from,
            recipient_id: wire.to,
            filename: wire.filename,
            wrapped_key,
            chunks,
        })
    }
}

// ── proto conversions ─────────────────────────────────────────────────────────

impl From<WireRecord> for proto::TransferEnvelope {
    fn from(wire: WireRecord) -> Self {
        Self {
            from: wire.from,
            to: wire.to,
            filename: wire.filename,
            encrypted_key: wire.encrypted_key,
            chunks: wire
                .chunks
                .into_iter()
                .map(|c| proto::WireChunk {
                    index: c.index,
                    data: c.data,
                    hash: c.hash,
                })
                .collect(),
        }
    }
}

impl From<proto::TransferEnvelope> for WireRecord {
    fn from(envelope: proto::TransferEnvelope) -> Self {
        Self {
            from: envelope.from,
            to: envelope.to,
            filename: envelope.filename,
            encrypted_key: envelope.encrypted_key,
            chunks: envelope
                .chunks
                .into_iter()
                .map(|c| WireChunk {
                    index: c.index,
                    data: c.data,
                    hash: c.hash,
                })
                .collect(),
        }
    }
}

impl From<TransferSummary> for proto::TransferSummary {
    fn from(s: TransferSummary) -> Self {
        Self {
            from: s.sender_id,
            to: s.recipient_id,
            filename: s.filename,
            chunk_count: s.chunk_count,
            stored_at: s.stored_at,
        }
    }
}

impl From<proto::TransferSummary> for TransferSummary {
    fn from(s: proto::TransferSummary) -> Self {
        Self {
            sender_id: s.from,
            recipient_id: s.to,
            filename: s.filename,
            chunk_count: s.chunk_count,
            stored_at: s.stored_at,
        }
    }
}

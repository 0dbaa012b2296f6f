//! Relay mailbox: transfer records indexed by recipient
//!
//! Storage layout (all keys relative to the operator root):
//! ```text
//! {blake3(recipient)}/{stem}.meta.json                 MetaEntry: summary + record key
//! {blake3(recipient)}/{stem}.{version}.record.json     full WireRecord
//! ```
//! where `stem = blake3(recipient \0 filename)` and `version` is a prefix of
//! `blake3(record bytes)`.
//!
//! The meta object is the single commit point of an entry. `store` writes the
//! new record version under a fresh key, then swaps the meta in one put, and
//! only then removes the previous version. `fetch` resolves the record through
//! the meta, so a reader always gets the record its summary describes, and a
//! store that fails before the meta put leaves the entry exactly as it was.
//! `delete` removes the meta first; a record left behind by a failed cleanup
//! is unreachable. Writers to the same (recipient, filename) are serialized
//! through [`KeyLocks`].
//!
//! The mailbox never decrypts anything. With `verify_on_store` it recomputes
//! chunk hashes over ciphertext, which needs no key material.

use std::time::{SystemTime, UNIX_EPOCH};

use opendal::Operator;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use courier_chunks::{validate_sequence, verify};
use courier_core::config::MailboxConfig;
use courier_core::{
    validate_filename, validate_identity, CourierError, CourierResult, TransferRecord,
    TransferSummary, WireRecord,
};

use crate::health::check_health;
use crate::locks::KeyLocks;
use crate::operator::{build_operator, storage_err};

const RECORD_SUFFIX: &str = ".record.json";
const META_SUFFIX: &str = ".meta.json";

/// Hex characters of the record hash used as its version tag
const VERSION_LEN: usize = 32;

/// Attempts to resolve meta -> record while a concurrent store replaces the version
const FETCH_ATTEMPTS: usize = 3;

/// Committed state of one mailbox entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaEntry {
    summary: TransferSummary,
    /// Object key of the record version this summary describes
    record: String,
}

pub struct Mailbox {
    op: Operator,
    locks: KeyLocks,
    verify_on_store: bool,
}

impl Mailbox {
    pub fn new(op: Operator) -> Self {
        Self {
            op,
            locks: KeyLocks::new(),
            verify_on_store: true,
        }
    }

    pub fn with_verify_on_store(mut self, verify: bool) -> Self {
        self.verify_on_store = verify;
        self
    }

    pub fn from_config(cfg: &MailboxConfig, enforce_tls: bool) -> CourierResult<Self> {
        let op = build_operator(cfg, enforce_tls)?;
        Ok(Self::new(op).with_verify_on_store(cfg.verify_on_store))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Accept a record, replacing any earlier record for the same
    /// (recipient, filename). Returns the stored summary.
    ///
    /// On error the previous entry (or its absence) is left untouched.
    pub async fn store(&self, record: &TransferRecord) -> CourierResult<TransferSummary> {
        self.validate(record)?;

        let stem = entry_stem(&record.recipient_id, &record.filename);
        let meta_key = meta_key(&stem);
        let wire_bytes = WireRecord::from(record).to_json()?;
        let record_key = record_key(&stem, &wire_bytes);
        let summary = record.summary(unix_now());
        let meta_bytes = serde_json::to_vec(&MetaEntry {
            summary: summary.clone(),
            record: record_key.clone(),
        })
        .map_err(|e| CourierError::Storage(format!("summary serialization: {e}")))?;

        let _guard = self.locks.lock(&stem).await;
        let previous = self.read_meta(&meta_key).await?;

        self.op
            .write(&record_key, wire_bytes)
            .await
            .map_err(storage_err)?;

        if let Err(e) = self.op.write(&meta_key, meta_bytes).await {
            // The old meta still points at the old version; drop the new one.
            let shared = previous.as_ref().is_some_and(|p| p.record == record_key);
            if !shared {
                if let Err(cleanup) = self.op.delete(&record_key).await {
                    warn!(key = %record_key, "leaving unreferenced record: {cleanup}");
                }
            }
            return Err(storage_err(e));
        }

        if let Some(old) = previous.filter(|p| p.record != record_key) {
            if let Err(e) = self.op.delete(&old.record).await {
                warn!(key = %old.record, "leaving superseded record: {e}");
            }
        }

        info!(
            from = %record.sender_id,
            to = %record.recipient_id,
            filename = %record.filename,
            chunks = record.chunk_count(),
            bytes = record.ciphertext_len(),
            "transfer stored"
        );
        Ok(summary)
    }

    /// Pending transfers for `recipient`, oldest first (ties by filename).
    ///
    /// Chunk payloads are not read; use [`Mailbox::fetch`] for those.
    pub async fn list(&self, recipient: &str) -> CourierResult<Vec<TransferSummary>> {
        validate_identity(recipient)?;
        let dir = recipient_dir(recipient);

        let entries = match self.op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err(e)),
        };

        let mut summaries = Vec::new();
        for entry in entries {
            if !entry.name().ends_with(META_SUFFIX) {
                continue;
            }
            let bytes = match self.op.read(entry.path()).await {
                Ok(buf) => buf.to_vec(),
                // Deleted between list and read
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => continue,
                Err(e) => return Err(storage_err(e)),
            };
            match serde_json::from_slice::<MetaEntry>(&bytes) {
                Ok(meta) if meta.summary.recipient_id == recipient => summaries.push(meta.summary),
                Ok(_) => {}
                Err(e) => warn!(path = entry.path(), "skipping unreadable summary: {e}"),
            }
        }

        summaries.sort_by(|a, b| {
            a.stored_at
                .cmp(&b.stored_at)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        debug!(recipient, count = summaries.len(), "mailbox listed");
        Ok(summaries)
    }

    /// The full record for (recipient, filename).
    pub async fn fetch(&self, recipient: &str, filename: &str) -> CourierResult<TransferRecord> {
        let (_, record) = self.fetch_with_summary(recipient, filename).await?;
        Ok(record)
    }

    /// The record together with the summary it was committed under.
    pub async fn fetch_with_summary(
        &self,
        recipient: &str,
        filename: &str,
    ) -> CourierResult<(TransferSummary, TransferRecord)> {
        let (summary, wire) = self.resolve(recipient, filename).await?;
        let record = TransferRecord::try_from(wire)?;
        debug!(recipient, filename, chunks = record.chunk_count(), "transfer fetched");
        Ok((summary, record))
    }

    /// The stored envelope for (recipient, filename), without decoding its payloads.
    pub async fn fetch_wire(&self, recipient: &str, filename: &str) -> CourierResult<WireRecord> {
        let (_, wire) = self.resolve(recipient, filename).await?;
        Ok(wire)
    }

    /// Remove (recipient, filename). Returns false if nothing was stored.
    pub async fn delete(&self, recipient: &str, filename: &str) -> CourierResult<bool> {
        validate_identity(recipient)?;
        validate_filename(filename)?;
        let stem = entry_stem(recipient, filename);
        let meta_key = meta_key(&stem);

        let _guard = self.locks.lock(&stem).await;
        let Some(meta) = self.read_meta(&meta_key).await? else {
            return Ok(false);
        };
        self.op.delete(&meta_key).await.map_err(storage_err)?;
        if let Err(e) = self.op.delete(&meta.record).await {
            warn!(key = %meta.record, "leaving unreferenced record: {e}");
        }

        info!(recipient, filename, "transfer deleted");
        Ok(true)
    }

    pub async fn check_health(&self) -> CourierResult<()> {
        check_health(&self.op).await
    }

    /// Follow the meta object to the record version it commits.
    ///
    /// Reads take no lock, so a concurrent store may remove the version a
    /// just-read meta points at; the meta is then re-read.
    async fn resolve(
        &self,
        recipient: &str,
        filename: &str,
    ) -> CourierResult<(TransferSummary, WireRecord)> {
        validate_identity(recipient)?;
        validate_filename(filename)?;
        let meta_key = meta_key(&entry_stem(recipient, filename));
        let not_found = || CourierError::NotFound(format!("{recipient}/{filename}"));

        for _ in 0..FETCH_ATTEMPTS {
            let meta = self.read_meta(&meta_key).await?.ok_or_else(not_found)?;
            match self.op.read(&meta.record).await {
                Ok(buf) => return Ok((meta.summary, WireRecord::from_json(&buf.to_vec())?)),
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                    debug!(key = %meta.record, "record version replaced during fetch");
                }
                Err(e) => return Err(storage_err(e)),
            }
        }
        Err(CourierError::Storage(format!(
            "{recipient}/{filename}: record kept changing during fetch"
        )))
    }

    async fn read_meta(&self, meta_key: &str) -> CourierResult<Option<MetaEntry>> {
        let bytes = match self.op.read(meta_key).await {
            Ok(buf) => buf.to_vec(),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_err(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CourierError::Storage(format!("corrupt summary {meta_key}: {e}")))
    }

    fn validate(&self, record: &TransferRecord) -> CourierResult<()> {
        validate_identity(&record.sender_id)?;
        validate_identity(&record.recipient_id)?;
        validate_filename(&record.filename)?;
        if record.wrapped_key.is_empty() {
            return Err(CourierError::Configuration(
                "record carries no wrapped session key".into(),
            ));
        }

        let mut indices: Vec<u64> = record.chunks.iter().map(|c| c.index).collect();
        indices.sort_unstable();
        validate_sequence(indices)?;

        if self.verify_on_store {
            if let Some(bad) = record
                .chunks
                .iter()
                .filter(|c| !verify(&c.ciphertext, &c.integrity_hash))
                .map(|c| c.index)
                .min()
            {
                warn!(
                    from = %record.sender_id,
                    to = %record.recipient_id,
                    filename = %record.filename,
                    index = bad,
                    "rejecting transfer with bad chunk hash"
                );
                return Err(CourierError::Integrity { index: bad });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("backend", &self.op.info().scheme())
            .field("verify_on_store", &self.verify_on_store)
            .finish()
    }
}

fn recipient_dir(recipient: &str) -> String {
    format!("{}/", blake3::hash(recipient.as_bytes()).to_hex())
}

/// Storage stem of one mailbox entry. Names are hashed so no client-supplied
/// string ever becomes part of a storage path.
fn entry_stem(recipient: &str, filename: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(recipient.as_bytes());
    hasher.update(&[0]);
    hasher.update(filename.as_bytes());
    format!("{}{}", recipient_dir(recipient), hasher.finalize().to_hex())
}

fn meta_key(stem: &str) -> String {
    format!("{stem}{META_SUFFIX}")
}

fn record_key(stem: &str, wire_bytes: &[u8]) -> String {
    let version = blake3::hash(wire_bytes).to_hex();
    format!("{stem}.{}{RECORD_SUFFIX}", &version.as_str()[..VERSION_LEN])
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_chunks::digest;
    use courier_core::Chunk;

    fn mailbox() -> Mailbox {
        Mailbox::new(crate::memory_operator().unwrap())
    }

    fn record(to: &str, filename: &str, chunks: usize) -> TransferRecord {
        TransferRecord {
            sender_id: "alice".into(),
            recipient_id: to.into(),
            filename: filename.into(),
            wrapped_key: vec![0x5A; 256],
            chunks: (0..chunks as u64)
                .map(|index| {
                    let ciphertext = vec![index as u8; 32];
                    Chunk {
                        index,
                        integrity_hash: digest(&ciphertext),
                        ciphertext,
                    }
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn store_then_fetch_returns_same_record() {
        let mb = mailbox();
        let rec = record("bob", "report.pdf", 3);
        let summary = mb.store(&rec).await.unwrap();
        assert_eq!(summary.chunk_count, 3);
        assert_eq!(summary.sender_id, "alice");

        assert_eq!(mb.fetch("bob", "report.pdf").await.unwrap(), rec);
    }

    #[tokio::test]
    async fn list_is_scoped_to_recipient() {
        let mb = mailbox();
        mb.store(&record("bob", "a.txt", 1)).await.unwrap();
        mb.store(&record("bob", "b.txt", 2)).await.unwrap();
        mb.store(&record("carol", "c.txt", 1)).await.unwrap();

        let names: Vec<_> = mb
            .list("bob")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.filename)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(mb.list("carol").await.unwrap().len(), 1);
        assert!(mb.list("dave").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_overwrites_same_key() {
        let mb = mailbox();
        mb.store(&record("bob", "a.txt", 1)).await.unwrap();
        mb.store(&record("bob", "a.txt", 4)).await.unwrap();

        let listed = mb.list("bob").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].chunk_count, 4);
        assert_eq!(mb.fetch("bob", "a.txt").await.unwrap().chunks.len(), 4);
    }

    #[tokio::test]
    async fn empty_transfer_is_storable() {
        let mb = mailbox();
        mb.store(&record("bob", "empty.txt", 0)).await.unwrap();
        assert_eq!(mb.list("bob").await.unwrap()[0].chunk_count, 0);
        assert!(mb.fetch("bob", "empty.txt").await.unwrap().chunks.is_empty());
    }

    #[tokio::test]
    async fn fetch_missing_is_not_found() {
        let err = mailbox().fetch("bob", "nope.txt").await.unwrap_err();
        assert!(matches!(err, CourierError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_from_list_and_fetch() {
        let mb = mailbox();
        mb.store(&record("bob", "a.txt", 2)).await.unwrap();

        assert!(mb.delete("bob", "a.txt").await.unwrap());
        assert!(!mb.delete("bob", "a.txt").await.unwrap());
        assert!(mb.list("bob").await.unwrap().is_empty());
        assert!(matches!(
            mb.fetch("bob", "a.txt").await,
            Err(CourierError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tampered_chunk_rejected_when_verifying() {
        let mb = mailbox();
        let mut rec = record("bob", "a.txt", 4);
        rec.chunks[2].ciphertext[0] ^= 1;
        rec.chunks[3].ciphertext[0] ^= 1;

        let err = mb.store(&rec).await.unwrap_err();
        assert!(matches!(err, CourierError::Integrity { index: 2 }));
        assert!(mb.list("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tampered_chunk_accepted_without_verification() {
        let mb = mailbox().with_verify_on_store(false);
        let mut rec = record("bob", "a.txt", 2);
        rec.chunks[1].ciphertext[0] ^= 1;
        assert!(mb.store(&rec).await.is_ok());
    }

    #[tokio::test]
    async fn gap_in_chunks_rejected() {
        let mb = mailbox();
        let mut rec = record("bob", "a.txt", 3);
        rec.chunks.remove(1);
        let err = mb.store(&rec).await.unwrap_err();
        assert!(matches!(err, CourierError::Sequence(_)));
    }

    #[tokio::test]
    async fn invalid_names_rejected() {
        let mb = mailbox();
        assert!(mb.store(&record("", "a.txt", 1)).await.is_err());
        assert!(mb.store(&record("bob", "../a.txt", 1)).await.is_err());
        let mut rec = record("bob", "a.txt", 1);
        rec.wrapped_key.clear();
        assert!(matches!(
            mb.store(&rec).await,
            Err(CourierError::Configuration(_))
        ));
    }

    #[test]
    fn object_keys_do_not_embed_names() {
        let stem = entry_stem("bob", "secret-plans.txt");
        let record_key = record_key(&stem, b"{}");
        assert!(!record_key.contains("bob"));
        assert!(!record_key.contains("secret"));
        assert!(record_key.ends_with(RECORD_SUFFIX));
        assert!(meta_key(&stem).ends_with(META_SUFFIX));
        assert_ne!(entry_stem("bob", "a"), entry_stem("bo", "ba"));
        assert_ne!(record_key, super::record_key(&stem, b"[]"));
    }

    /// Record objects currently stored for `recipient` (any version).
    async fn record_objects(mb: &Mailbox, recipient: &str) -> Vec<String> {
        match mb.operator().list(&recipient_dir(recipient)).await {
            Ok(entries) => entries
                .into_iter()
                .map(|e| e.path().to_string())
                .filter(|p| p.ends_with(RECORD_SUFFIX))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn overwrite_leaves_one_record_version() {
        let mb = mailbox();
        mb.store(&record("bob", "a.txt", 1)).await.unwrap();
        mb.store(&record("bob", "a.txt", 3)).await.unwrap();
        // Identical bytes map to the same version and must not delete it
        mb.store(&record("bob", "a.txt", 3)).await.unwrap();

        assert_eq!(record_objects(&mb, "bob").await.len(), 1);
        let (summary, fetched) = mb.fetch_with_summary("bob", "a.txt").await.unwrap();
        assert_eq!(summary.chunk_count, 3);
        assert_eq!(fetched.chunks.len(), 3);
    }

    #[tokio::test]
    async fn delete_removes_every_record_version() {
        let mb = mailbox();
        mb.store(&record("bob", "a.txt", 2)).await.unwrap();
        mb.store(&record("bob", "a.txt", 5)).await.unwrap();
        assert!(mb.delete("bob", "a.txt").await.unwrap());
        assert!(record_objects(&mb, "bob").await.is_empty());
    }

    #[tokio::test]
    async fn orphaned_record_without_meta_is_not_fetchable() {
        let mb = mailbox();
        let rec = record("bob", "a.txt", 2);
        let stem = entry_stem("bob", "a.txt");
        let wire = WireRecord::from(&rec).to_json().unwrap();
        mb.operator().write(&record_key(&stem, &wire), wire).await.unwrap();

        assert!(mb.list("bob").await.unwrap().is_empty());
        assert!(matches!(
            mb.fetch("bob", "a.txt").await,
            Err(CourierError::NotFound(_))
        ));
        assert!(!mb.delete("bob", "a.txt").await.unwrap());
    }

    fn fs_mailbox(root: &std::path::Path) -> Mailbox {
        let cfg = MailboxConfig {
            backend: "fs".into(),
            root: root.to_path_buf(),
            ..Default::default()
        };
        Mailbox::from_config(&cfg, false).unwrap()
    }

    /// Turn the meta path of (recipient, filename) into a non-empty directory
    /// so its summary can no longer be read or replaced.
    fn block_meta_path(root: &std::path::Path, recipient: &str, filename: &str) {
        let meta = root.join(meta_key(&entry_stem(recipient, filename)));
        if meta.is_file() {
            std::fs::remove_file(&meta).unwrap();
        }
        std::fs::create_dir_all(meta.join("blocker")).unwrap();
    }

    fn from_sender(sender: &str, to: &str, filename: &str, chunks: usize) -> TransferRecord {
        TransferRecord {
            sender_id: sender.into(),
            ..record(to, filename, chunks)
        }
    }

    #[tokio::test]
    async fn failed_summary_write_publishes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mb = fs_mailbox(tmp.path());
        block_meta_path(tmp.path(), "bob", "a.txt");

        let result = mb.store(&from_sender("carol", "bob", "a.txt", 1)).await;
        assert!(matches!(result, Err(CourierError::Storage(_))), "{result:?}");

        assert!(mb.list("bob").await.unwrap().is_empty());
        assert!(mb.fetch("bob", "a.txt").await.is_err());
        assert!(record_objects(&mb, "bob").await.is_empty(), "new version not rolled back");
    }

    #[tokio::test]
    async fn failed_overwrite_keeps_previous_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let mb = fs_mailbox(tmp.path());
        mb.store(&from_sender("alice", "bob", "a.txt", 4)).await.unwrap();
        mb.store(&from_sender("alice", "bob", "b.txt", 2)).await.unwrap();
        let listed_before = mb.list("bob").await.unwrap();
        let records_before = record_objects(&mb, "bob").await;

        // b.txt's summary put fails; a.txt must be unaffected and b.txt must
        // not expose carol's record under any path.
        block_meta_path(tmp.path(), "bob", "b.txt");
        let result = mb.store(&from_sender("carol", "bob", "b.txt", 1)).await;
        assert!(matches!(result, Err(CourierError::Storage(_))), "{result:?}");

        let listed_after = mb.list("bob").await.unwrap();
        assert_eq!(listed_after, vec![listed_before[0].clone()]);
        let (summary, a) = mb.fetch_with_summary("bob", "a.txt").await.unwrap();
        assert_eq!(summary, listed_before[0]);
        assert_eq!((a.sender_id.as_str(), a.chunks.len()), ("alice", 4));
        match mb.fetch("bob", "b.txt").await {
            Ok(b) => panic!("failed store became fetchable: {}", b.sender_id),
            Err(CourierError::NotFound(_)) | Err(CourierError::Storage(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }

        let mut records_after = record_objects(&mb, "bob").await;
        records_after.sort();
        let mut expected = records_before;
        expected.sort();
        assert_eq!(records_after, expected, "carol's version left behind");
    }

    #[tokio::test]
    async fn uncommitted_record_version_is_invisible() {
        // The record version is written before the meta; a reader between the
        // two puts still resolves the old summary to the old record.
        let mb = mailbox();
        mb.store(&from_sender("alice", "bob", "a.txt", 2)).await.unwrap();
        let stem = entry_stem("bob", "a.txt");
        let pending = from_sender("carol", "bob", "a.txt", 5);
        let wire = WireRecord::from(&pending).to_json().unwrap();
        mb.operator().write(&record_key(&stem, &wire), wire).await.unwrap();

        let (summary, fetched) = mb.fetch_with_summary("bob", "a.txt").await.unwrap();
        assert_eq!(summary.sender_id, "alice");
        assert_eq!((fetched.sender_id.as_str(), fetched.chunks.len()), ("alice", 2));
    }

    #[test]
    fn list_sorts_by_stored_at_then_filename() {
        tokio_test::block_on(async {
            let mb = mailbox();
            for name in ["z.txt", "m.txt", "a.txt"] {
                mb.store(&record("bob", name, 1)).await.unwrap();
            }
            let listed = mb.list("bob").await.unwrap();
            let mut sorted = listed.clone();
            sorted.sort_by(|a, b| (a.stored_at, &a.filename).cmp(&(b.stored_at, &b.filename)));
            assert_eq!(listed, sorted);
        });
    }
}

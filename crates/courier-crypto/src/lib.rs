//! courier-crypto: end-to-end encryption for courier transfers
//!
//! Architecture: Chunk-then-Encrypt with a hybrid key envelope
//!
//! Pipeline: plaintext → fixed-size chunk → AES-256-CBC encrypt → SHA-256 hash ciphertext → record
//!
//! Key hierarchy:
//! ```text
//! Recipient RSA key pair (≥ 2048-bit, long-lived, one per identity)
//!   └── Session Key (per-transfer, 256-bit random, wrapped with RSA-OAEP/SHA-256)
//!       └── Chunk cipher: AES-256-CBC (key=session key, iv=random 128-bit per chunk, PKCS#7)
//! ```
//!
//! The relay only ever sees the wrapped session key, ciphertext and hashes.

pub mod directory;
pub mod envelope;
pub mod keys;
pub mod symmetric;
pub mod transfer;

pub use directory::{FsKeyDirectory, PrivateKeySource, PublicKeyDirectory};
pub use envelope::{unwrap_key, wrap_key};
pub use keys::{generate_session_key, KeyPair, RecipientPrivateKey, RecipientPublicKey, SessionKey};
pub use symmetric::{decrypt_chunk, encrypt_chunk};
pub use transfer::{decode_transfer, decode_transfer_with_progress, ProgressFn, TransferEncoder};

/// Size of a session key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a CBC initialization vector
pub const IV_SIZE: usize = 16;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

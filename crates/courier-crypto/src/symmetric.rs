//! Per-chunk AES-256-CBC encryption/decryption
//!
//! Encrypted chunk format (binary):
//! ```text
//! [16 bytes: random IV][N bytes: AES-256-CBC ciphertext, PKCS#7 padded]
//! ```
//!
//! A fresh IV is drawn for every chunk, so a reuse bug is confined to one
//! chunk and each chunk decrypts independently of its neighbours. CBC carries
//! no authentication of its own: callers must verify the chunk's integrity
//! hash before decrypting.

use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use courier_core::SymmetricError;

use crate::keys::SessionKey;
use crate::{BLOCK_SIZE, IV_SIZE};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypt a single chunk with AES-256-CBC under `key`.
///
/// Returns: `[16-byte IV][ciphertext]`, always a non-empty multiple of the
/// block size past the IV (an empty chunk encrypts to one padding block).
pub fn encrypt_chunk(key: &SessionKey, plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut result = Vec::with_capacity(IV_SIZE + ciphertext.len());
    result.extend_from_slice(&iv);
    result.extend_from_slice(&ciphertext);
    result
}

/// Decrypt a single chunk produced by [`encrypt_chunk`].
///
/// Fails with [`SymmetricError::Malformed`] when the input cannot be a CBC
/// ciphertext at all, and [`SymmetricError::Padding`] when the plaintext does
/// not end in valid PKCS#7 padding (wrong key or corrupted data).
pub fn decrypt_chunk(key: &SessionKey, encrypted: &[u8]) -> Result<Vec<u8>, SymmetricError> {
    if encrypted.len() < IV_SIZE + BLOCK_SIZE {
        return Err(SymmetricError::Malformed(format!(
            "encrypted chunk too short: {} bytes (minimum {})",
            encrypted.len(),
            IV_SIZE + BLOCK_SIZE
        )));
    }
    if (encrypted.len() - IV_SIZE) % BLOCK_SIZE != 0 {
        return Err(SymmetricError::Malformed(format!(
            "ciphertext length {} is not a multiple of {BLOCK_SIZE}",
            encrypted.len() - IV_SIZE
        )));
    }

    let (iv, ciphertext) = encrypted.split_at(IV_SIZE);
    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| SymmetricError::Malformed(format!("cipher init: {e}")))?;

    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| SymmetricError::Padding)
}

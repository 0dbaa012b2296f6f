//! Key material: per-transfer session keys and RSA key pairs

use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use courier_core::config::MIN_RSA_BITS;
use courier_core::{CourierError, CourierResult};

use crate::KEY_SIZE;

/// A per-transfer 256-bit AES key. Zeroized on drop.
///
/// Lives only for the duration of one encode or decode call and is never
/// persisted in the clear, so it is deliberately not `Clone`.
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
}

impl SessionKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit session key.
pub fn generate_session_key() -> SessionKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    SessionKey::from_bytes(bytes)
}

/// A recipient's RSA public key, checked against a minimum modulus size.
#[derive(Clone, PartialEq, Eq)]
pub struct RecipientPublicKey(RsaPublicKey);

impl RecipientPublicKey {
    /// Wrap `key`, rejecting moduli smaller than `min_bits`.
    pub fn new(key: RsaPublicKey, min_bits: usize) -> CourierResult<Self> {
        let bits = key.size() * 8;
        if bits < min_bits.max(MIN_RSA_BITS) {
            return Err(CourierError::Configuration(format!(
                "recipient key is {bits} bits; at least {} required",
                min_bits.max(MIN_RSA_BITS)
            )));
        }
        Ok(Self(key))
    }

    /// Parse an SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`) PEM document.
    pub fn from_pem(pem: &str, min_bits: usize) -> CourierResult<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| CourierError::Configuration(format!("invalid recipient public key: {e}")))?;
        Self::new(key, min_bits)
    }

    /// SPKI PEM encoding
    pub fn to_pem(&self) -> CourierResult<String> {
        self.0
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CourierError::Configuration(format!("encoding public key: {e}")))
    }

    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        self.0.size() * 8
    }

    /// Short SHA-256 fingerprint of the SPKI DER encoding, for display.
    pub fn fingerprint(&self) -> CourierResult<String> {
        let der = self
            .0
            .to_public_key_der()
            .map_err(|e| CourierError::Configuration(format!("encoding public key: {e}")))?;
        let digest = Sha256::digest(der.as_bytes());
        Ok(hex::encode(&digest[..16]))
    }

    pub(crate) fn as_rsa(&self) -> &RsaPublicKey {
        &self.0
    }
}

impl std::fmt::Debug for RecipientPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipientPublicKey")
            .field("bits", &self.bits())
            .finish()
    }
}

/// A recipient's RSA private key. The underlying key zeroizes itself on drop.
pub struct RecipientPrivateKey(RsaPrivateKey);

impl RecipientPrivateKey {
    /// Parse a PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) PEM document.
    pub fn from_pem(pem: &str) -> CourierResult<Self> {
        RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map(Self)
            .map_err(|_| CourierError::Configuration("invalid private key PEM".into()))
    }

    /// PKCS#1 PEM encoding, zeroized when dropped
    pub fn to_pem(&self) -> CourierResult<Zeroizing<String>> {
        self.0
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CourierError::Configuration(format!("encoding private key: {e}")))
    }

    pub fn public_key(&self) -> RecipientPublicKey {
        RecipientPublicKey(self.0.to_public_key())
    }

    /// Modulus size in bytes; every valid wrapped key has exactly this length.
    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub(crate) fn as_rsa(&self) -> &RsaPrivateKey {
        &self.0
    }
}

impl std::fmt::Debug for RecipientPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipientPrivateKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// An identity's asymmetric key pair. The private half never leaves the
/// identity's own key storage.
#[derive(Debug)]
pub struct KeyPair {
    private: RecipientPrivateKey,
    public: RecipientPublicKey,
}

impl KeyPair {
    /// Generate a fresh RSA key pair (public exponent 65537).
    pub fn generate(bits: usize) -> CourierResult<Self> {
        if bits < MIN_RSA_BITS {
            return Err(CourierError::Configuration(format!(
                "key size {bits} is below the {MIN_RSA_BITS}-bit minimum"
            )));
        }
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| CourierError::Configuration(format!("RSA key generation failed: {e}")))?;
        let public = RecipientPublicKey(private.to_public_key());
        Ok(Self {
            private: RecipientPrivateKey(private),
            public,
        })
    }

    pub fn from_private(private: RecipientPrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    pub fn public_key(&self) -> &RecipientPublicKey {
        &self.public
    }

    pub fn private_key(&self) -> &RecipientPrivateKey {
        &self.private
    }
}

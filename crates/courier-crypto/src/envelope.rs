//! Session key wrapping under the recipient's RSA key (RSA-OAEP, SHA-256)
//!
//! Output of [`wrap_key`] is exactly one RSA block: as many bytes as the
//! recipient's modulus. OAEP is randomized, so wrapping the same session key
//! twice yields different ciphertexts.

use rsa::Oaep;
use sha2::Sha256;
use zeroize::Zeroize;

use courier_core::{CourierError, CourierResult, UnwrapError};

use crate::keys::{RecipientPrivateKey, RecipientPublicKey, SessionKey};
use crate::KEY_SIZE;

/// Wrap (encrypt) a session key for `recipient`.
pub fn wrap_key(session_key: &SessionKey, recipient: &RecipientPublicKey) -> CourierResult<Vec<u8>> {
    recipient
        .as_rsa()
        .encrypt(
            &mut rand::thread_rng(),
            Oaep::new::<Sha256>(),
            session_key.as_bytes(),
        )
        .map_err(|e| CourierError::Configuration(format!("key wrapping failed: {e}")))
}

/// Unwrap (decrypt) a session key with the recipient's private key.
///
/// Every failure (wrong key, truncated or corrupted payload, bad OAEP
/// padding, wrong plaintext length) is reported as the same opaque
/// [`UnwrapError`].
pub fn unwrap_key(wrapped: &[u8], private: &RecipientPrivateKey) -> Result<SessionKey, UnwrapError> {
    if wrapped.len() != private.size() {
        return Err(UnwrapError);
    }

    let mut plaintext = private
        .as_rsa()
        .decrypt_blinded(&mut rand::thread_rng(), Oaep::new::<Sha256>(), wrapped)
        .map_err(|_| UnwrapError)?;

    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        return Err(UnwrapError);
    }

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(SessionKey::from_bytes(key_bytes))
}

//! Identity boundary: where public keys come from and where private keys live
//!
//! The transfer core only ever sees the two narrow traits below. The
//! filesystem implementation stores, per identity:
//! ```text
//! {dir}/{id}.pub.pem              SPKI public key
//! {dir}/private_key_{id}.pem      PKCS#1 private key (0600 on Unix)
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use courier_core::config::MIN_RSA_BITS;
use courier_core::{validate_identity, CourierError, CourierResult};

use crate::keys::{KeyPair, RecipientPrivateKey, RecipientPublicKey};

/// Lookup of published public keys by identity.
pub trait PublicKeyDirectory: Send + Sync {
    /// Unknown identities are a configuration error, not a lookup miss.
    fn public_key(&self, identity: &str) -> CourierResult<RecipientPublicKey>;
}

/// Supplier of the local identity's private key.
pub trait PrivateKeySource: Send + Sync {
    fn private_key(&self, identity: &str) -> CourierResult<RecipientPrivateKey>;
}

/// Key directory backed by PEM files in one local directory.
#[derive(Debug, Clone)]
pub struct FsKeyDirectory {
    dir: PathBuf,
    min_rsa_bits: usize,
}

impl FsKeyDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            min_rsa_bits: MIN_RSA_BITS,
        }
    }

    pub fn with_min_rsa_bits(mut self, bits: usize) -> Self {
        self.min_rsa_bits = bits;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn public_key_path(&self, identity: &str) -> CourierResult<PathBuf> {
        validate_identity(identity)?;
        Ok(self.dir.join(format!("{identity}.pub.pem")))
    }

    pub fn private_key_path(&self, identity: &str) -> CourierResult<PathBuf> {
        validate_identity(identity)?;
        Ok(self.dir.join(format!("private_key_{identity}.pem")))
    }

    /// Persist both halves of `pair` for `identity`. Refuses to overwrite an
    /// existing private key.
    pub fn save_key_pair(&self, identity: &str, pair: &KeyPair) -> CourierResult<()> {
        let private_path = self.private_key_path(identity)?;
        let public_path = self.public_key_path(identity)?;

        if private_path.exists() {
            return Err(CourierError::Configuration(format!(
                "private key for '{identity}' already exists: {}",
                private_path.display()
            )));
        }

        fs::create_dir_all(&self.dir)?;
        let private_pem = pair.private_key().to_pem()?;
        write_atomic(&private_path, private_pem.as_bytes(), true)?;
        write_atomic(&public_path, pair.public_key().to_pem()?.as_bytes(), false)?;

        info!(identity, dir = %self.dir.display(), "key pair saved");
        Ok(())
    }

    /// Publish someone else's public key into this directory.
    pub fn import_public_key(&self, identity: &str, pem: &str) -> CourierResult<RecipientPublicKey> {
        let key = RecipientPublicKey::from_pem(pem, self.min_rsa_bits)?;
        let path = self.public_key_path(identity)?;
        fs::create_dir_all(&self.dir)?;
        write_atomic(&path, key.to_pem()?.as_bytes(), false)?;
        info!(identity, fingerprint = %key.fingerprint()?, "public key imported");
        Ok(key)
    }

    /// Identities that have a published public key, sorted.
    pub fn identities(&self) -> CourierResult<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let id = name.strip_suffix(".pub.pem")?;
                validate_identity(id).ok()?;
                Some(id.to_string())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn read_pem(&self, path: &Path, identity: &str, what: &str) -> CourierResult<String> {
        match fs::read_to_string(path) {
            Ok(pem) => {
                debug!(identity, path = %path.display(), "loaded {what}");
                Ok(pem)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CourierError::Configuration(
                format!("no {what} for identity '{identity}' in {}", self.dir.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl PublicKeyDirectory for FsKeyDirectory {
    fn public_key(&self, identity: &str) -> CourierResult<RecipientPublicKey> {
        let path = self.public_key_path(identity)?;
        let pem = self.read_pem(&path, identity, "public key")?;
        RecipientPublicKey::from_pem(&pem, self.min_rsa_bits)
    }
}

impl PrivateKeySource for FsKeyDirectory {
    fn private_key(&self, identity: &str) -> CourierResult<RecipientPrivateKey> {
        let path = self.private_key_path(identity)?;
        let pem = zeroize::Zeroizing::new(self.read_pem(&path, identity, "private key")?);
        RecipientPrivateKey::from_pem(&pem)
    }
}

/// Write then rename, so readers see either the old file or the new one.
fn write_atomic(path: &Path, contents: &[u8], private: bool) -> CourierResult<()> {
    let tmp_path = path.with_extension("pem.tmp");
    fs::write(&tmp_path, contents)?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = private;

    fs::rename(&tmp_path, path)?;
    Ok(())
}

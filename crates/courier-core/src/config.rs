use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CourierError, CourierResult};

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest accepted chunk size: 64 MiB
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Smallest RSA modulus accepted for recipient keys
pub const MIN_RSA_BITS: usize = 2048;

/// Top-level configuration (loaded from courier.toml), shared by courierd and the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub logging: LoggingConfig,
    pub transfer: TransferConfig,
    pub relay: RelayConfig,
    pub mailbox: MailboxConfig,
    pub keys: KeysConfig,
}

impl CourierConfig {
    /// Parse a TOML document. Missing sections and fields fall back to defaults.
    pub fn from_toml(content: &str) -> CourierResult<Self> {
        let config: CourierConfig = toml::from_str(content)
            .map_err(|e| CourierError::Configuration(format!("parsing config: {e}")))?;
        config.transfer.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info). `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Encoder/decoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Plaintext bytes per chunk (default: 1 MiB)
    pub chunk_size: usize,
    /// Worker threads for chunk encryption/decryption (0 = cpu_count)
    pub workers: usize,
    /// Minimum recipient RSA key size in bits
    pub min_rsa_bits: usize,
}

impl TransferConfig {
    pub fn validate(&self) -> CourierResult<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(CourierError::Configuration(format!(
                "transfer.chunk_size must be between 1 and {MAX_CHUNK_SIZE} bytes (got {})",
                self.chunk_size
            )));
        }
        if self.min_rsa_bits < MIN_RSA_BITS {
            return Err(CourierError::Configuration(format!(
                "transfer.min_rsa_bits must be at least {MIN_RSA_BITS} (got {})",
                self.min_rsa_bits
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address courierd listens on for gRPC
    pub listen: String,
    /// Relay URL used by the CLI (https:// when TLS is configured)
    pub endpoint: String,
    /// PEM certificate chain served by courierd
    pub tls_cert: Option<PathBuf>,
    /// PEM private key for `tls_cert`
    pub tls_key: Option<PathBuf>,
    /// CA certificate the CLI trusts for the relay (native roots when unset)
    pub ca_cert: Option<PathBuf>,
    /// Refuse plaintext listeners and endpoints
    pub enforce_tls: bool,
    /// Largest gRPC message accepted or sent, in bytes
    pub max_message_bytes: usize,
    /// Prometheus metrics + health endpoint (e.g. 127.0.0.1:9300)
    pub metrics_addr: Option<String>,
}

/// Relay-side mailbox storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Storage backend: "fs", "memory", or "s3"
    pub backend: String,
    /// Root directory (fs) or key prefix (s3)
    pub root: PathBuf,
    /// Recompute every chunk hash before accepting a record
    pub verify_on_store: bool,
    /// S3 endpoint (s3 backend only)
    pub endpoint: String,
    /// S3 region (s3 backend only)
    pub region: String,
    /// S3 bucket (s3 backend only)
    pub bucket: String,
}

/// Local key material used by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Directory holding `{id}.pub.pem` and `private_key_{id}.pem`
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 0,
            min_rsa_bits: MIN_RSA_BITS,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5000".into(),
            endpoint: "http://127.0.0.1:5000".into(),
            tls_cert: None,
            tls_key: None,
            ca_cert: None,
            enforce_tls: false,
            max_message_bytes: 256 * 1024 * 1024,
            metrics_addr: Some("127.0.0.1:9300".into()),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            backend: "fs".into(),
            root: PathBuf::from("/var/lib/courier/transfers"),
            verify_on_store: true,
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "courier".into(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.config/courier/keys"),
        }
    }
}

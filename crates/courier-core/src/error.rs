use thiserror::Error;

pub type CourierResult<T> = Result<T, CourierError>;

#[derive(Debug, Error)]
pub enum CourierError {
    /// Missing or invalid keys, identities, or chunk-size config. Raised before any crypto runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Chunk hash mismatch. The chunk is presumed tampered or corrupted; never retried.
    #[error("integrity check failed for chunk {index}")]
    Integrity { index: u64 },

    #[error("chunk {index}: decryption failed: {source}")]
    Cipher {
        index: u64,
        #[source]
        source: SymmetricError,
    },

    /// Session key could not be recovered from the wrapped key. Deliberately carries no detail.
    #[error("session key recovery failed")]
    KeyRecovery,

    #[error("chunk sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    /// Storage and local I/O faults may be transient; everything else is a
    /// property of the input and fails the same way on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CourierError::Storage(_) | CourierError::Io(_))
    }

    /// Short machine-readable name of the error kind, for logs and user-facing reports.
    pub fn kind(&self) -> &'static str {
        match self {
            CourierError::Configuration(_) => "configuration",
            CourierError::Integrity { .. } => "integrity",
            CourierError::Cipher { .. } => "cipher",
            CourierError::KeyRecovery => "key_recovery",
            CourierError::Sequence(_) => "sequence",
            CourierError::Storage(_) => "storage",
            CourierError::NotFound(_) => "not_found",
            CourierError::Io(_) => "io",
        }
    }
}

impl From<UnwrapError> for CourierError {
    fn from(_: UnwrapError) -> Self {
        CourierError::KeyRecovery
    }
}

/// Chunk indices do not form the dense range `[0, N)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("missing chunk index {expected} (next present index is {found})")]
    Gap { expected: u64, found: u64 },

    #[error("duplicate chunk index {index}")]
    Duplicate { index: u64 },
}

/// Failure of the per-chunk symmetric cipher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymmetricError {
    /// Padding did not strip cleanly after decryption.
    #[error("invalid padding")]
    Padding,

    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

/// Opaque key-unwrap failure. Wrong key, corrupted payload and bad padding
/// are indistinguishable from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("key unwrap failed")]
pub struct UnwrapError;

impl From<CourierError> for tonic::Status {
    fn from(err: CourierError) -> Self {
        let message = err.to_string();
        match err {
            CourierError::Configuration(_)
            | CourierError::Sequence(_)
            | CourierError::Integrity { .. } => tonic::Status::invalid_argument(message),
            CourierError::NotFound(_) => tonic::Status::not_found(message),
            CourierError::Storage(_) | CourierError::Io(_) => tonic::Status::unavailable(message),
            CourierError::Cipher { .. } | CourierError::KeyRecovery => {
                tonic::Status::internal(message)
            }
        }
    }
}

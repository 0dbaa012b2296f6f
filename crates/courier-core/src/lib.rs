pub mod config;
pub mod error;
pub mod types;

pub use error::{CourierError, CourierResult, SequenceError, SymmetricError, UnwrapError};
pub use types::{
    validate_filename, validate_identity, Chunk, IntegrityHash, TransferRecord, TransferSummary,
    WireChunk, WireRecord, DIGEST_LEN,
};

/// Generated gRPC types and service traits (from courier.proto)
pub mod proto {
    tonic::include_proto!("courier");
}

//! OpenDAL Operator factory for mailbox storage backends

use opendal::Operator;

use courier_core::config::MailboxConfig;
use courier_core::{CourierError, CourierResult};

/// Staging directory for fs writes, relative to the mailbox root. Must share
/// a filesystem with the root so the final rename is atomic.
const FS_STAGING_DIR: &str = ".incoming";

/// Build an OpenDAL Operator for the configured mailbox backend.
///
/// - `fs`: records under `root`, written to a staging dir then renamed into place
/// - `memory`: process-local, for tests and throwaway relays
/// - `s3`: any S3-compatible endpoint; credentials come from the standard
///   `AWS_*` environment variables. `root` is used as the key prefix.
///
/// If `enforce_tls` is true and an S3 endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_operator(cfg: &MailboxConfig, enforce_tls: bool) -> CourierResult<Operator> {
    let root = cfg.root.to_string_lossy();

    let op = match cfg.backend.as_str() {
        "fs" => {
            let staging = cfg.root.join(FS_STAGING_DIR);
            // opendal 0.55: builders use the consuming pattern
            let builder = opendal::services::Fs::default()
                .root(&root)
                .atomic_write_dir(&staging.to_string_lossy());
            Operator::new(builder).map_err(storage_err)?.finish()
        }
        "memory" => Operator::new(opendal::services::Memory::default())
            .map_err(storage_err)?
            .finish(),
        "s3" => {
            if cfg.endpoint.starts_with("http://") {
                if enforce_tls {
                    return Err(CourierError::Configuration(format!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set relay.enforce_tls = false for local development.",
                        cfg.endpoint
                    )));
                }
                tracing::warn!(
                    endpoint = %cfg.endpoint,
                    "S3 endpoint uses plaintext HTTP; mailbox traffic is visible on the network. \
                     Set relay.enforce_tls = true and use HTTPS in production."
                );
            }
            // Path-style addressing is the default, which SeaweedFS and MinIO require.
            let builder = opendal::services::S3::default()
                .endpoint(&cfg.endpoint)
                .region(&cfg.region)
                .bucket(&cfg.bucket)
                .root(&root);
            Operator::new(builder).map_err(storage_err)?.finish()
        }
        other => {
            return Err(CourierError::Configuration(format!(
                "unknown mailbox backend '{other}' (expected fs, memory, or s3)"
            )))
        }
    };

    Ok(op
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        ))
}

/// In-memory operator, for tests and the `memory` backend.
pub fn memory_operator() -> CourierResult<Operator> {
    build_operator(
        &MailboxConfig {
            backend: "memory".into(),
            ..Default::default()
        },
        false,
    )
}

pub(crate) fn storage_err(e: opendal::Error) -> CourierError {
    CourierError::Storage(e.to_string())
}

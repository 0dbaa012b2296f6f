//! Daemon lifecycle: startup, health checks, systemd notify, gRPC server

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tonic::transport::{Identity, ServerTlsConfig};
use tracing::{error, info, warn};

use courier_core::config::{CourierConfig, RelayConfig};
use courier_mailbox::Mailbox;

use crate::grpc::{RelayImpl, ServeOptions};
use crate::metrics::{HealthState, RelayMetrics};

pub async fn run(config: CourierConfig) -> Result<()> {
    info!("relay starting");

    let tls = load_tls(&config.relay).await?;

    // Build mailbox storage and verify connectivity
    let mailbox = Arc::new(
        Mailbox::from_config(&config.mailbox, config.relay.enforce_tls)
            .context("building mailbox storage")?,
    );
    match mailbox.check_health().await {
        Ok(()) => info!(
            backend = %config.mailbox.backend,
            root = %config.mailbox.root.display(),
            verify_on_store = config.mailbox.verify_on_store,
            "mailbox: connected"
        ),
        // Keep going: /readyz and Status report the outage until storage recovers
        Err(e) => warn!(backend = %config.mailbox.backend, "mailbox: {e}"),
    }

    let mut registry = Registry::default();
    let metrics = RelayMetrics::register(&mut registry);

    // Start Prometheus metrics endpoint
    if let Some(addr) = config.relay.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            mailbox: mailbox.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let listener = TcpListener::bind(&config.relay.listen)
        .await
        .with_context(|| format!("binding gRPC listener {}", config.relay.listen))?;

    // Send systemd ready notification
    notify_ready();

    let impl_ = RelayImpl::new(mailbox, metrics, config.mailbox.backend.clone());
    crate::grpc::serve(
        listener,
        impl_,
        ServeOptions {
            tls,
            max_message_bytes: config.relay.max_message_bytes,
        },
        shutdown_signal(),
    )
    .await?;

    info!("relay stopped");
    Ok(())
}

/// Server TLS from `tls_cert` + `tls_key`. Without both, the relay runs
/// plaintext unless `enforce_tls` forbids it.
async fn load_tls(relay: &RelayConfig) -> Result<Option<ServerTlsConfig>> {
    match (&relay.tls_cert, &relay.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = tokio::fs::read(cert_path)
                .await
                .with_context(|| format!("reading TLS certificate {}", cert_path.display()))?;
            let key = tokio::fs::read(key_path)
                .await
                .with_context(|| format!("reading TLS key {}", key_path.display()))?;
            info!(cert = %cert_path.display(), "gRPC: TLS enabled");
            Ok(Some(
                ServerTlsConfig::new().identity(Identity::from_pem(cert, key)),
            ))
        }
        (None, None) => {
            if relay.enforce_tls {
                anyhow::bail!(
                    "relay.enforce_tls is set but relay.tls_cert / relay.tls_key are not configured"
                );
            }
            warn!(
                listen = %relay.listen,
                "gRPC listener is plaintext: transfer metadata is visible on the network. \
                 Configure relay.tls_cert and relay.tls_key in production."
            );
            Ok(None)
        }
        _ => anyhow::bail!("relay.tls_cert and relay.tls_key must be set together"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("installing ctrl-c handler failed: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    #[cfg(unix)]
    {
        if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
            use std::os::unix::net::UnixDatagram;
            if let Ok(sock) = UnixDatagram::unbound() {
                let _ = sock.send_to(b"READY=1\n", &socket);
                tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
            }
        }
    }
}

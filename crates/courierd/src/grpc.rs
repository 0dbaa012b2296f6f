//! tonic gRPC relay server over TCP (optionally TLS)

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use courier_core::{CourierError, TransferRecord, WireRecord};
use courier_mailbox::Mailbox;

use courier_core::proto::{
    relay_server::{Relay, RelayServer},
    *,
};

use crate::metrics::RelayMetrics;

/// Implementation of the Relay gRPC service
pub struct RelayImpl {
    mailbox: Arc<Mailbox>,
    metrics: RelayMetrics,
    storage_backend: String,
    start_time: Instant,
}

impl RelayImpl {
    pub fn new(mailbox: Arc<Mailbox>, metrics: RelayMetrics, storage_backend: String) -> Self {
        Self {
            mailbox,
            metrics,
            storage_backend,
            start_time: Instant::now(),
        }
    }
}

/// Log a failed RPC and convert it to a status.
fn rpc_failure(rpc: &'static str, err: CourierError) -> Status {
    if err.is_retryable() {
        error!(rpc, kind = err.kind(), "{err}");
    } else {
        warn!(rpc, kind = err.kind(), "{err}");
    }
    err.into()
}

#[tonic::async_trait]
impl Relay for RelayImpl {
    async fn store(
        &self,
        request: Request<StoreRequest>,
    ) -> Result<Response<StoreResponse>, Status> {
        let envelope = request
            .into_inner()
            .record
            .ok_or_else(|| Status::invalid_argument("store: missing record"))?;

        // Undecodable payloads are the client's fault, whatever the error kind.
        let record = match TransferRecord::try_from(WireRecord::from(envelope)) {
            Ok(record) => record,
            Err(e) => {
                self.metrics.reject(e.kind());
                warn!(rpc = "store", kind = e.kind(), "undecodable record: {e}");
                return Err(Status::invalid_argument(e.to_string()));
            }
        };

        match self.mailbox.store(&record).await {
            Ok(summary) => {
                self.metrics.stored.inc();
                self.metrics.stored_chunks.inc_by(record.chunk_count() as u64);
                self.metrics.stored_bytes.inc_by(record.ciphertext_len());
                Ok(Response::new(StoreResponse {
                    summary: Some(summary.into()),
                }))
            }
            Err(e) => {
                if !e.is_retryable() {
                    self.metrics.reject(e.kind());
                }
                Err(rpc_failure("store", e))
            }
        }
    }

    async fn list(&self, request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        let recipient = request.into_inner().recipient;
        let transfers = self
            .mailbox
            .list(&recipient)
            .await
            .map_err(|e| rpc_failure("list", e))?;

        self.metrics.listed.inc();
        info!(recipient = %recipient, count = transfers.len(), "mailbox listed");
        Ok(Response::new(ListResponse {
            transfers: transfers.into_iter().map(Into::into).collect(),
        }))
    }

    async fn fetch(
        &self,
        request: Request<FetchRequest>,
    ) -> Result<Response<FetchResponse>, Status> {
        let FetchRequest {
            recipient,
            filename,
        } = request.into_inner();
        let wire = self
            .mailbox
            .fetch_wire(&recipient, &filename)
            .await
            .map_err(|e| rpc_failure("fetch", e))?;

        self.metrics.fetched.inc();
        info!(recipient = %recipient, filename = %filename, chunks = wire.chunks.len(), "transfer fetched");
        Ok(Response::new(FetchResponse {
            record: Some(wire.into()),
        }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let DeleteRequest {
            recipient,
            filename,
        } = request.into_inner();
        let deleted = self
            .mailbox
            .delete(&recipient, &filename)
            .await
            .map_err(|e| rpc_failure("delete", e))?;

        if deleted {
            self.metrics.deleted.inc();
        }
        Ok(Response::new(DeleteResponse { deleted }))
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let uptime = self.start_time.elapsed().as_secs() as i64;
        Ok(Response::new(StatusResponse {
            version: env!("CARGO_PKG_VERSION").into(),
            storage_backend: self.storage_backend.clone(),
            storage_ok: self.mailbox.check_health().await.is_ok(),
            uptime_secs: uptime,
        }))
    }
}

/// Listener settings for [`serve`]
pub struct ServeOptions {
    pub tls: Option<ServerTlsConfig>,
    pub max_message_bytes: usize,
}

/// Start the gRPC server on an already-bound TCP listener until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    impl_: RelayImpl,
    opts: ServeOptions,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    let stream = TcpListenerStream::new(listener);

    let mut builder = Server::builder();
    let tls = opts.tls.is_some();
    if let Some(tls_config) = opts.tls {
        builder = builder
            .tls_config(tls_config)
            .map_err(|e| anyhow::anyhow!("gRPC TLS config: {e}"))?;
    }

    let service = RelayServer::new(impl_)
        .max_decoding_message_size(opts.max_message_bytes)
        .max_encoding_message_size(opts.max_message_bytes);

    info!(addr = %addr, tls, "gRPC server ready");

    builder
        .add_service(service)
        .serve_with_incoming_shutdown(stream, shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("gRPC server error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_chunks::digest;
    use courier_core::Chunk;
    use prometheus_client::registry::Registry;
    use tonic::Code;

    fn relay() -> RelayImpl {
        let mailbox = Arc::new(Mailbox::new(courier_mailbox::memory_operator().unwrap()));
        let metrics = RelayMetrics::register(&mut Registry::default());
        RelayImpl::new(mailbox, metrics, "memory".into())
    }

    fn envelope(to: &str, filename: &str, chunks: u64) -> TransferEnvelope {
        let record = TransferRecord {
            sender_id: "alice".into(),
            recipient_id: to.into(),
            filename: filename.into(),
            wrapped_key: vec![1u8; 256],
            chunks: (0..chunks)
                .map(|index| {
                    let ciphertext = vec![index as u8; 32];
                    Chunk {
                        index,
                        integrity_hash: digest(&ciphertext),
                        ciphertext,
                    }
                })
                .collect(),
        };
        WireRecord::from(&record).into()
    }

    async fn store(relay: &RelayImpl, env: TransferEnvelope) -> Result<StoreResponse, Status> {
        relay
            .store(Request::new(StoreRequest { record: Some(env) }))
            .await
            .map(Response::into_inner)
    }

    #[tokio::test]
    async fn store_list_fetch_delete_cycle() {
        let relay = relay();
        let env = envelope("bob", "a.txt", 2);

        let summary = store(&relay, env.clone()).await.unwrap().summary.unwrap();
        assert_eq!(summary.chunk_count, 2);
        assert_eq!(summary.from, "alice");

        let listed = relay
            .list(Request::new(ListRequest {
                recipient: "bob".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.transfers.len(), 1);

        let fetched = relay
            .fetch(Request::new(FetchRequest {
                recipient: "bob".into(),
                filename: "a.txt".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(fetched.record, Some(env));

        let deleted = relay
            .delete(Request::new(DeleteRequest {
                recipient: "bob".into(),
                filename: "a.txt".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(deleted.deleted);
        assert_eq!(relay.metrics.deleted.get(), 1);
    }

    #[tokio::test]
    async fn missing_record_is_invalid_argument() {
        let status = relay()
            .store(Request::new(StoreRequest { record: None }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn tampered_chunk_is_rejected_and_counted() {
        let relay = relay();
        let mut env = envelope("bob", "a.txt", 3);
        env.chunks[1].hash = "00".repeat(32);

        let status = store(&relay, env).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("chunk 1"));
        assert_eq!(relay.metrics.stored.get(), 0);
    }

    #[tokio::test]
    async fn bad_base64_key_is_invalid_argument() {
        let mut env = envelope("bob", "a.txt", 1);
        env.encrypted_key = "***".into();
        let status = store(&relay(), env).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn fetch_missing_is_not_found() {
        let status = relay()
            .fetch(Request::new(FetchRequest {
                recipient: "bob".into(),
                filename: "nope".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn status_reports_backend() {
        let status = relay()
            .status(Request::new(StatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.storage_backend, "memory");
        assert!(status.storage_ok);
    }

    #[tokio::test]
    async fn client_roundtrip_over_tcp() {
        use courier_core::proto::relay_client::RelayClient;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(
            listener,
            relay(),
            ServeOptions {
                tls: None,
                max_message_bytes: 4 * 1024 * 1024,
            },
            async move {
                let _ = rx.await;
            },
        ));

        let mut client = RelayClient::connect(format!("http://{addr}")).await.unwrap();
        client
            .store(StoreRequest {
                record: Some(envelope("bob", "net.bin", 4)),
            })
            .await
            .unwrap();
        let listed = client
            .list(ListRequest {
                recipient: "bob".into(),
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.transfers[0].filename, "net.bin");

        let _ = tx.send(());
        server.await.unwrap().unwrap();
    }
}

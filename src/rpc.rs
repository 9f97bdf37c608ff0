use crate::credentials::Credential;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Identity;
use tonic::transport::Server;
use tonic::transport::ServerTlsConfig;
use tonic_health::ServingStatus;

/// TLS-secured RPC listener.
///
/// Presents the instance credential and requests a client certificate for
/// mutual authentication. The file-transfer service itself lives outside
/// this crate; the listener serves the gRPC health service so peers can
/// probe reachability as soon as the endpoint is up.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), tonic::transport::Error>>,
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Failed to bind the RPC listener")]
    Bind(#[from] std::io::Error),

    #[error("TLS configuration was rejected")]
    Tls(#[from] tonic::transport::Error),
}

impl RpcServer {
    pub async fn start(bind: SocketAddrV4, credential: &Credential) -> Result<Self, RpcError> {
        let identity = Identity::from_pem(&credential.certificate_pem, &credential.private_key_pem);
        let tls = ServerTlsConfig::new()
            .identity(identity)
            .client_auth_optional(true);

        // Bind eagerly so a port conflict fails the whole bring-up instead
        // of surfacing later inside the serve task.
        let listener = TcpListener::bind(SocketAddr::V4(bind)).await?;
        let local_addr = listener.local_addr()?;

        let (mut health_reporter, health_server) = tonic_health::server::health_reporter();
        health_reporter
            .set_service_status("", ServingStatus::Serving)
            .await;

        let (shutdown, shutdown_signal) = oneshot::channel::<()>();
        let router = Server::builder().tls_config(tls)?.add_service(health_server);
        let task = tokio::spawn(router.serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            async {
                let _ = shutdown_signal.await;
            },
        ));
        log::info!("RPC listener bound at {}", local_addr);

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections and drains in-flight calls.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(Ok(())) => log::info!("RPC listener stopped"),
            Ok(Err(e)) => log::warn!("RPC listener shut down with an error: {}", e),
            Err(e) => log::warn!("RPC serve task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::credentials::CredentialProvider;
    use crate::credentials::SelfSignedProvider;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn starts_and_drains() -> anyhow::Result<()> {
        crate::test::init();
        let credential = SelfSignedProvider.acquire("MYHOST-1A2B3C")?;
        let server =
            RpcServer::start(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &credential).await?;
        assert_ne!(server.local_addr().port(), 0);
        server.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn bind_conflict_is_fatal() -> anyhow::Result<()> {
        crate::test::init();
        let credential = SelfSignedProvider.acquire("MYHOST-1A2B3C")?;
        let server =
            RpcServer::start(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &credential).await?;
        let SocketAddr::V4(taken) = server.local_addr() else {
            panic!("Bound a V4 address")
        };

        let conflict = RpcServer::start(taken, &credential).await;
        assert!(matches!(conflict, Err(RpcError::Bind(_))));

        server.stop().await;
        Ok(())
    }
}

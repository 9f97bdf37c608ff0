use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Certificate-exchange endpoint.
///
/// Peers fetch this instance's certificate out-of-band before their first
/// RPC handshake. The exchange protocol itself is owned by the external
/// collaborator; this crate only guarantees the endpoint's lifecycle runs
/// in lockstep with the RPC listener.
pub struct CertServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl CertServer {
    pub async fn start(bind: SocketAddrV4, certificate_pem: String) -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::V4(bind)).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Certificate exchange endpoint bound at {}", local_addr);

        let (shutdown, mut shutdown_signal) = oneshot::channel();
        let certificate: Arc<[u8]> = certificate_pem.into_bytes().into();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_signal => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            log::debug!("Serving certificate to {}", remote);
                            tokio::spawn(serve_certificate(stream, certificate.clone()));
                        }
                        Err(e) => log::warn!("Certificate exchange accept failed: {}", e),
                    },
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
        log::info!("Certificate exchange endpoint stopped");
    }
}

async fn serve_certificate(mut stream: tokio::net::TcpStream, certificate: Arc<[u8]>) {
    if let Err(e) = stream.write_all(&certificate).await {
        log::debug!("Failed to hand out the certificate: {}", e);
    }
    let _ = stream.shutdown().await;
}

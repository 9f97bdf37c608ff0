use crate::aggregator::Aggregator;
use crate::cert_server::CertServer;
use crate::config::Config;
use crate::connector::Connector;
use crate::credentials::CredentialError;
use crate::credentials::CredentialProvider;
use crate::mdns::MdnsService;
use crate::profile::ServiceProfile;
use crate::registry::Registry;
use crate::rpc::RpcError;
use crate::rpc::RpcServer;
use std::net::SocketAddrV4;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Composes discovery and the secure endpoints into one instance with a
/// single running/stopped state.
pub struct Server {
    config: Config,
    aggregator: Arc<Aggregator>,
    registry: Arc<Registry>,
    credentials: Arc<dyn CredentialProvider>,
    running: Arc<AtomicBool>,
    state: Mutex<Option<RunningState>>,
}

struct RunningState {
    mdns: MdnsService,
    cert: CertServer,
    rpc: RpcServer,
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("Failed to prepare the download directory")]
    DownloadDir(#[source] std::io::Error),

    #[error("Failed to acquire the instance credential")]
    Credential(#[from] CredentialError),

    #[error("Failed to start the RPC listener")]
    Rpc(#[from] RpcError),

    #[error("Failed to start the certificate exchange endpoint")]
    CertExchange(#[source] std::io::Error),

    #[error("Failed to start the multicast service")]
    Multicast(#[source] std::io::Error),

    #[error("Failed to advertise this instance")]
    Advertise(#[source] std::io::Error),
}

impl Server {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let registry = Arc::new(Registry::new(config.uuid.clone(), connector));
        let aggregator = Arc::new(Aggregator::new(registry.clone()));
        Self {
            config,
            aggregator,
            registry,
            credentials,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Brings the instance up: credential, RPC listener, certificate
    /// exchange, multicast discovery, advertisement, query — in that
    /// order. All-or-nothing: on any failure the sub-resources started so
    /// far are torn down again and the instance stays stopped.
    pub async fn start(&self) -> Result<(), StartError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            log::warn!("Start requested but the server is already running");
            return Ok(());
        }
        log::info!("-- Starting server '{}'", self.config.uuid);
        self.running.store(true, Ordering::Release);
        match self.bring_up().await {
            Ok(brought_up) => {
                *state = Some(brought_up);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<RunningState, StartError> {
        self.config
            .ensure_download_dir()
            .map_err(StartError::DownloadDir)?;

        let credential = self.credentials.acquire(&self.config.uuid)?;

        let rpc_bind = SocketAddrV4::new(self.config.interface, self.config.port);
        let rpc = RpcServer::start(rpc_bind, &credential).await?;

        let cert_port = rpc.local_addr().port().wrapping_add(1);
        let cert_bind = SocketAddrV4::new(self.config.interface, cert_port);
        let cert = match CertServer::start(cert_bind, credential.certificate_pem.clone()).await {
            Ok(cert) => cert,
            Err(e) => {
                rpc.stop().await;
                return Err(StartError::CertExchange(e));
            }
        };

        let profile = ServiceProfile {
            uuid: self.config.uuid.clone(),
            hostname: self.config.hostname.clone(),
            port: self.config.port,
        };
        let mdns = match MdnsService::start(
            self.config.interface,
            profile,
            self.aggregator.clone(),
            self.registry.clone(),
            self.running.clone(),
        )
        .await
        {
            Ok(mdns) => mdns,
            Err(e) => {
                cert.stop().await;
                rpc.stop().await;
                return Err(StartError::Multicast(e));
            }
        };

        let advertised = async {
            mdns.announce(false).await?;
            mdns.query().await
        };
        if let Err(e) = advertised.await {
            mdns.stop().await;
            cert.stop().await;
            rpc.stop().await;
            return Err(StartError::Advertise(e));
        }

        Ok(RunningState { mdns, cert, rpc })
    }

    /// Tears the instance down in reverse bring-up order. Idempotent: a
    /// stop on an already stopped server is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(state) = self.state.lock().await.take() else {
            return;
        };
        if let Err(e) = state.mdns.withdraw().await {
            log::warn!("Failed to withdraw the advertisement: {}", e);
        }
        state.mdns.stop().await;
        state.cert.stop().await;
        state.rpc.stop().await;
        log::info!("-- Server stopped");
    }

    /// Re-registers presence without a full advertise/query cycle: a
    /// transient `flush` announcement followed by the real one. Peers
    /// never treat the flush record as a genuine instance.
    pub async fn reannounce(&self) -> std::io::Result<()> {
        let state = self.state.lock().await;
        let Some(state) = state.as_ref() else {
            return Ok(());
        };
        state.mdns.announce(true).await?;
        state.mdns.announce(false).await
    }
}

mod packet;
mod socket;

use crate::aggregator::Aggregator;
use crate::aggregator::RECORD_IDLE_TIMEOUT;
use crate::profile::ServiceProfile;
use crate::registry::Registry;
use futures_util::StreamExt;
use hickory_proto::error::ProtoError;
use hickory_proto::op::Message;
use hickory_proto::op::MessageType;
use packet::DecodeError;
use packet::DnsCodec;
use socket::MulticastSender;
use socket::TokioMulticastSender;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::udp::UdpFramed;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Multicast side of the service: receives answer messages for the
/// aggregator and registry, advertises this instance's profile, answers
/// queries for the service type and withdraws the advertisement on stop.
pub struct MdnsService {
    sender: Arc<dyn MulticastSender>,
    profile: ServiceProfile,
    advertised_address: Ipv4Addr,
    receive_task: JoinHandle<()>,
    prune_task: JoinHandle<()>,
}

impl MdnsService {
    /// Binds the multicast socket on `interface` and wires the receive
    /// loop. Advertisement is a separate step; see `announce`.
    pub async fn start(
        interface: Ipv4Addr,
        profile: ServiceProfile,
        aggregator: Arc<Aggregator>,
        registry: Arc<Registry>,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let receiver = socket::bind_receiver(interface)?;
        let advertised_address = if interface.is_unspecified() {
            socket::local_ipv4().await.unwrap_or(interface)
        } else {
            interface
        };
        let sender: Arc<dyn MulticastSender> = Arc::new(TokioMulticastSender::new(interface));

        let responder = Responder {
            sender: sender.clone(),
            profile: profile.clone(),
            advertised_address,
        };
        let receive_task = tokio::spawn(receive_loop(
            UdpFramed::new(receiver, DnsCodec),
            responder,
            aggregator.clone(),
            registry,
            running,
        ));
        let prune_task = tokio::spawn(prune_loop(aggregator));

        Ok(Self {
            sender,
            profile,
            advertised_address,
            receive_task,
            prune_task,
        })
    }

    /// Multicasts this instance's presence. A `flush` announcement is the
    /// transient re-registration peers filter out.
    pub async fn announce(&self, flush: bool) -> std::io::Result<()> {
        log::debug!(
            "Announcing '{}' ({})",
            self.profile.uuid,
            if flush { "flush" } else { "real" }
        );
        let packet = packet::build_announcement(&self.profile, self.advertised_address, flush)
            .map_err(into_io)?;
        self.sender.send(packet.into()).await
    }

    /// Actively queries for instances already on the network.
    pub async fn query(&self) -> std::io::Result<()> {
        log::debug!("Querying for service instances");
        let packet = packet::build_query().map_err(into_io)?;
        self.sender.send(packet.into()).await
    }

    /// Withdraws the advertisement with a goodbye packet.
    pub async fn withdraw(&self) -> std::io::Result<()> {
        log::debug!("Withdrawing '{}'", self.profile.uuid);
        let packet = packet::build_withdrawal(&self.profile, self.advertised_address)
            .map_err(into_io)?;
        self.sender.send(packet.into()).await
    }

    pub async fn stop(self) {
        self.receive_task.abort();
        self.prune_task.abort();
        let _ = self.receive_task.await;
        let _ = self.prune_task.await;
        log::info!("Multicast service stopped");
    }
}

struct Responder {
    sender: Arc<dyn MulticastSender>,
    profile: ServiceProfile,
    advertised_address: Ipv4Addr,
}

impl Responder {
    async fn respond(&self) {
        let packet =
            match packet::build_announcement(&self.profile, self.advertised_address, false) {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("Failed to build a response: {}", e);
                    return;
                }
            };
        if let Err(e) = self.sender.send(packet.into()).await {
            log::warn!("Failed to answer a service query: {}", e);
        }
    }
}

async fn receive_loop(
    mut framed: UdpFramed<DnsCodec>,
    responder: Responder,
    aggregator: Arc<Aggregator>,
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
) {
    while let Some(received) = framed.next().await {
        let (message, from) = match received {
            Ok(received) => received,
            Err(DecodeError::Dns(e)) => {
                log::debug!("Dropping a malformed DNS packet: {}", e);
                continue;
            }
            Err(DecodeError::Io(e)) => {
                log::error!("Multicast receive failed: {}", e);
                break;
            }
        };
        // A late event must not revive a stopped session.
        if !running.load(Ordering::Acquire) {
            continue;
        }
        handle_message(message, from, &responder, &aggregator, &registry).await;
    }
}

async fn handle_message(
    message: Message,
    from: SocketAddr,
    responder: &Responder,
    aggregator: &Aggregator,
    registry: &Registry,
) {
    if message.message_type() == MessageType::Query {
        if packet::is_service_query(&message) {
            log::debug!("Answering a service query from {}", from);
            responder.respond().await;
        }
        return;
    }

    for instance in packet::extract_withdrawals(&message) {
        log::debug!("Service withdrawn: '{}'", instance);
        registry.on_lost(&instance);
    }
    let answers = packet::extract_answers(&message);
    if !answers.is_empty() {
        log::debug!("Answer from {} with {} usable records", from, answers.len());
        aggregator.on_answer_batch(answers);
    }
}

async fn prune_loop(aggregator: Arc<Aggregator>) {
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        interval.tick().await;
        aggregator.evict_idle(RECORD_IDLE_TIMEOUT);
    }
}

fn into_io(e: ProtoError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connector::MockConnector;
    use crate::registry::RemoteStatus;
    use futures_util::FutureExt;
    use socket::MockMulticastSender;

    const OWN_UUID: &str = "MYHOST-AA11BB";

    #[tokio::test]
    async fn responder_answers_with_a_real_announcement() {
        crate::test::init();
        let profile = own_profile();
        let advertised_address = Ipv4Addr::new(10, 0, 0, 7);
        let expected: Arc<[u8]> = packet::build_announcement(&profile, advertised_address, false)
            .unwrap()
            .into();

        let mut sender = MockMulticastSender::new();
        sender
            .expect_send()
            .withf(move |data| *data == expected)
            .times(1)
            .return_once(|_| async { Ok(()) }.boxed());

        let responder = Responder {
            sender: Arc::new(sender),
            profile,
            advertised_address,
        };
        responder.respond().await;
    }

    fn own_profile() -> ServiceProfile {
        ServiceProfile {
            uuid: OWN_UUID.into(),
            hostname: "myhost".into(),
            port: 42000,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let poll = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), poll)
            .await
            .expect("Condition not reached in time");
    }

    async fn start_service(
        uuid: &str,
        connector: MockConnector,
    ) -> (MdnsService, Arc<Registry>, Arc<AtomicBool>) {
        let registry = Arc::new(Registry::new(uuid.to_string(), Arc::new(connector)));
        let aggregator = Arc::new(Aggregator::new(registry.clone()));
        let running = Arc::new(AtomicBool::new(true));
        let service = MdnsService::start(
            Ipv4Addr::LOCALHOST,
            own_profile(),
            aggregator,
            registry.clone(),
            running.clone(),
        )
        .await
        .unwrap();
        (service, registry, running)
    }

    #[tokio::test]
    async fn discovers_and_loses_a_peer_over_loopback() {
        crate::test::init();
        // Tests in this module share the multicast group, so the mock must
        // tolerate announcements from sibling tests.
        let mut connector = MockConnector::new();
        connector.expect_connect().return_const(());
        let (service, registry, _running) = start_service(OWN_UUID, connector).await;

        let peer = ServiceProfile {
            uuid: "LOOPPEER-000001".into(),
            hostname: "loop-peer".into(),
            port: 42010,
        };
        let address = Ipv4Addr::new(10, 9, 9, 9);
        let sender = TokioMulticastSender::new(Ipv4Addr::LOCALHOST);
        let announcement: Arc<[u8]> =
            packet::build_announcement(&peer, address, false).unwrap().into();
        sender.send(announcement).await.unwrap();

        wait_for(|| registry.get("LOOPPEER-000001").is_some()).await;
        let remote = registry.get("LOOPPEER-000001").unwrap();
        assert_eq!(remote.hostname, "loop-peer");
        assert_eq!(remote.address, address);
        assert_eq!(remote.port, 42010);
        assert_eq!(remote.status, RemoteStatus::Connecting);
        assert!(remote.service_available);

        let withdrawal: Arc<[u8]> = packet::build_withdrawal(&peer, address).unwrap().into();
        sender.send(withdrawal).await.unwrap();
        wait_for(|| {
            registry
                .get("LOOPPEER-000001")
                .is_some_and(|remote| !remote.service_available)
        })
        .await;

        service.stop().await;
    }

    #[tokio::test]
    async fn flush_announcement_creates_no_peer() {
        crate::test::init();
        let mut connector = MockConnector::new();
        connector.expect_connect().return_const(());
        let (service, registry, _running) = start_service("OTHER-BB22CC", connector).await;

        let peer = ServiceProfile {
            uuid: "FLUSHPEER-000002".into(),
            hostname: "flush-peer".into(),
            port: 42011,
        };
        let sender = TokioMulticastSender::new(Ipv4Addr::LOCALHOST);
        let announcement: Arc<[u8]> =
            packet::build_announcement(&peer, Ipv4Addr::new(10, 9, 9, 10), true)
                .unwrap()
                .into();
        sender.send(announcement).await.unwrap();

        // Give the packet time to travel the loopback.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(registry.get("FLUSHPEER-000002").is_none());

        service.stop().await;
    }

    #[tokio::test]
    async fn stopped_session_ignores_late_answers() {
        crate::test::init();
        let mut connector = MockConnector::new();
        connector.expect_connect().return_const(());
        let (service, registry, running) = start_service("OTHER-CC33DD", connector).await;
        running.store(false, Ordering::Release);

        let peer = ServiceProfile {
            uuid: "LATEPEER-000003".into(),
            hostname: "late-peer".into(),
            port: 42012,
        };
        let sender = TokioMulticastSender::new(Ipv4Addr::LOCALHOST);
        let announcement: Arc<[u8]> =
            packet::build_announcement(&peer, Ipv4Addr::new(10, 9, 9, 11), false)
                .unwrap()
                .into();
        sender.send(announcement).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(registry.get("LATEPEER-000003").is_none());

        service.stop().await;
    }
}

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use mockall::automock;
use socket2::Domain;
use socket2::Socket;
use socket2::Type;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::net::UdpSocket as StdUdpSocket;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Well-known mDNS group and port.
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

pub fn mdns_group_address() -> SocketAddrV4 {
    SocketAddrV4::new(MDNS_GROUP, MDNS_PORT)
}

/// Binds the shared mDNS port and joins the group on the given interface.
/// Discovery is IPv4 only.
pub fn bind_receiver(interface: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let socket = new_multicast_socket()?;
    let local_address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT);
    socket.bind(&SocketAddr::V4(local_address).into())?;
    socket.join_multicast_v4(&MDNS_GROUP, &interface)?;
    log::info!("Multicast receiver socket listening at {}", local_address);
    new_async_socket(socket)
}

#[automock]
pub trait MulticastSender: Send + Sync {
    fn send(&self, data: Arc<[u8]>) -> BoxFuture<'static, std::io::Result<()>>;
}

/// Sends one datagram to the mDNS group from a fresh socket on the
/// configured interface.
pub struct TokioMulticastSender {
    interface: Ipv4Addr,
}

impl TokioMulticastSender {
    pub fn new(interface: Ipv4Addr) -> Self {
        Self { interface }
    }

    async fn send(interface: Ipv4Addr, data: Arc<[u8]>) -> std::io::Result<()> {
        let socket = new_multicast_socket()?;
        socket.set_multicast_if_v4(&interface)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;
        let socket = new_async_socket(socket)?;
        log::debug!(
            "Created multicast sender socket at {:?}",
            socket.local_addr()?
        );
        socket
            .send_to(&data, SocketAddr::V4(mdns_group_address()))
            .await?;
        Ok(())
    }
}

impl MulticastSender for TokioMulticastSender {
    fn send(&self, data: Arc<[u8]>) -> BoxFuture<'static, std::io::Result<()>> {
        Self::send(self.interface, data).boxed()
    }
}

/// Source address this instance should advertise, resolved from the route
/// towards the multicast group.
pub async fn local_ipv4() -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(SocketAddr::V4(mdns_group_address())).await?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "IPv4 socket reported a non-IPv4 address",
        )),
    }
}

fn new_multicast_socket() -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;

    // Multicast loop should be enabled only in test.
    // Disabling it reduces the chance of flooding and filters out echoes.
    socket.set_multicast_loop_v4(false)?;
    #[cfg(test)]
    {
        socket.set_multicast_loop_v4(true)?;
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn new_async_socket(socket: Socket) -> std::io::Result<UdpSocket> {
    let socket: StdUdpSocket = socket.into();
    UdpSocket::try_from(socket)
}

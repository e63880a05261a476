//! Server UDP plane: unicast RTP/RTCP listeners and multicast groups.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

use log::{debug, error, trace, warn};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::session::ServerSession;
use super::stream::OutPacket;
use super::ServerHandle;
use crate::format::rtsp::conn::UDP_MAX_PAYLOAD;
use crate::{Result, RtspError};

#[derive(Clone)]
struct Route {
    session: Weak<ServerSession>,
    media: usize,
}

type Routes = Arc<RwLock<HashMap<SocketAddr, Route>>>;

/// The server's RTP and RTCP sockets. Datagrams are routed by source
/// address to the session that set up that address.
pub(crate) struct ServerUdp {
    rtp: Arc<UdpSocket>,
    rtcp: Arc<UdpSocket>,
    ports: (u16, u16),
    rtp_routes: Routes,
    rtcp_routes: Routes,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerUdp {
    pub async fn bind(rtp_addr: &str, rtcp_addr: &str) -> Result<Self> {
        let rtp = Arc::new(UdpSocket::bind(rtp_addr).await?);
        let rtcp = Arc::new(UdpSocket::bind(rtcp_addr).await?);
        let ports = (rtp.local_addr()?.port(), rtcp.local_addr()?.port());
        debug!("UDP listeners on ports {}-{}", ports.0, ports.1);

        let rtp_routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let rtcp_routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let tasks = vec![
            tokio::spawn(receive_loop(rtp.clone(), rtp_routes.clone(), false)),
            tokio::spawn(receive_loop(rtcp.clone(), rtcp_routes.clone(), true)),
        ];

        Ok(Self {
            rtp,
            rtcp,
            ports,
            rtp_routes,
            rtcp_routes,
            tasks,
        })
    }

    /// Local RTP and RTCP ports, announced as `server_port`.
    pub fn ports(&self) -> (u16, u16) {
        self.ports
    }

    pub fn rtp_socket(&self) -> Arc<UdpSocket> {
        self.rtp.clone()
    }

    pub fn rtcp_socket(&self) -> Arc<UdpSocket> {
        self.rtcp.clone()
    }

    pub fn add_route(&self, rtp: SocketAddr, rtcp: SocketAddr, session: &Arc<ServerSession>, media: usize) {
        let route = Route {
            session: Arc::downgrade(session),
            media,
        };
        self.rtp_routes.write().insert(rtp, route.clone());
        self.rtcp_routes.write().insert(rtcp, route);
    }

    pub fn remove_routes(&self, session_id: &str) {
        for routes in [&self.rtp_routes, &self.rtcp_routes] {
            routes.write().retain(|_, route| match route.session.upgrade() {
                Some(session) => session.id() != session_id,
                None => false,
            });
        }
    }
}

impl Drop for ServerUdp {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, routes: Routes, is_rtcp: bool) {
    let mut buf = vec![0u8; UDP_MAX_PAYLOAD + 1];

    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                error!("UDP listener stopped: {}", e);
                return;
            }
        };
        if n > UDP_MAX_PAYLOAD {
            warn!("dropping oversized UDP packet from {}", src);
            continue;
        }

        let route = routes.read().get(&src).cloned();
        match route.and_then(|r| r.session.upgrade().map(|s| (s, r.media))) {
            Some((session, media)) => session.deliver(media, is_rtcp, &buf[..n]),
            None => trace!("UDP packet from unknown address {}", src),
        }
    }
}

struct AllocatorState {
    used: HashSet<u32>,
    next: u32,
}

/// Hands out multicast group addresses from an IPv4 range such as
/// `224.1.0.0/16`.
pub(crate) struct MulticastAllocator {
    base: u32,
    size: u32,
    state: Mutex<AllocatorState>,
}

impl MulticastAllocator {
    pub fn parse(range: &str) -> Result<Self> {
        let invalid = || RtspError::Protocol(format!("invalid multicast range '{}'", range));

        let (ip, prefix) = range.split_once('/').ok_or_else(invalid)?;
        let ip: Ipv4Addr = ip.trim().parse().map_err(|_| invalid())?;
        let prefix: u32 = prefix.trim().parse()?;
        if prefix > 32 || !ip.is_multicast() {
            return Err(invalid());
        }

        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let size = 1u64 << (32 - prefix);
        Ok(Self {
            base: u32::from(ip) & mask,
            size: size.min(u32::MAX as u64) as u32,
            state: Mutex::new(AllocatorState {
                used: HashSet::new(),
                next: 0,
            }),
        })
    }

    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let mut state = self.state.lock();
        // the network address itself is skipped unless it is the only one
        let first = if self.size > 1 { 1 } else { 0 };

        for _ in 0..self.size {
            let offset = first + state.next % (self.size - first).max(1);
            state.next = state.next.wrapping_add(1);
            if state.used.insert(offset) {
                let ip = Ipv4Addr::from(self.base.wrapping_add(offset));
                debug!("allocated multicast group {}", ip);
                return Ok(ip);
            }
        }

        Err(RtspError::Protocol("multicast range exhausted".into()))
    }

    pub fn release(&self, ip: Ipv4Addr) {
        let offset = u32::from(ip).wrapping_sub(self.base);
        self.state.lock().used.remove(&offset);
    }
}

/// Group address and ports a multicast reader joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MulticastTarget {
    pub group: IpAddr,
    pub ports: (u16, u16),
    pub ttl: u8,
}

/// Sends one media of a stream to its multicast group.
pub(crate) struct MulticastWriter {
    target: MulticastTarget,
    queue: mpsc::Sender<OutPacket>,
    task: JoinHandle<()>,
    allocator: Option<Arc<MulticastAllocator>>,
}

impl MulticastWriter {
    /// Allocates a group from the server's range and starts writing to it.
    pub async fn start(server: &ServerHandle) -> Result<Self> {
        let allocator = server
            .multicast_allocator()
            .ok_or_else(|| RtspError::Protocol("multicast is disabled".into()))?;
        let config = server.config();

        let group = allocator.allocate()?;
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(s) => s,
            Err(e) => {
                allocator.release(group);
                return Err(e.into());
            }
        };
        if let Err(e) = socket.set_multicast_ttl_v4(config.multicast_ttl as u32) {
            allocator.release(group);
            return Err(e.into());
        }

        let group = IpAddr::V4(group);
        let mut writer = Self::for_addrs(
            Arc::new(socket),
            SocketAddr::new(group, config.multicast_rtp_port),
            SocketAddr::new(group, config.multicast_rtcp_port),
            config.write_queue_size,
        );
        writer.target.ttl = config.multicast_ttl;
        writer.allocator = Some(allocator);
        Ok(writer)
    }

    /// Writer sending to fixed addresses.
    pub fn for_addrs(socket: Arc<UdpSocket>, rtp: SocketAddr, rtcp: SocketAddr, queue_size: usize) -> Self {
        let (queue, rx) = mpsc::channel(queue_size.max(1));
        let task = tokio::spawn(write_loop(socket, rx, rtp, rtcp));
        Self {
            target: MulticastTarget {
                group: rtp.ip(),
                ports: (rtp.port(), rtcp.port()),
                ttl: 1,
            },
            queue,
            task,
            allocator: None,
        }
    }

    pub fn target(&self) -> MulticastTarget {
        self.target
    }

    pub fn enqueue(&self, packet: OutPacket) {
        match self.queue.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("multicast queue of {} is full, dropping packet", self.target.group)
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl Drop for MulticastWriter {
    fn drop(&mut self) {
        self.task.abort();
        if let (Some(allocator), IpAddr::V4(group)) = (&self.allocator, self.target.group) {
            allocator.release(group);
        }
    }
}

async fn write_loop(socket: Arc<UdpSocket>, mut queue: mpsc::Receiver<OutPacket>, rtp: SocketAddr, rtcp: SocketAddr) {
    while let Some(packet) = queue.recv().await {
        let target = if packet.is_rtcp { rtcp } else { rtp };
        if let Err(e) = socket.send_to(&packet.data, target).await {
            warn!("multicast write to {} failed: {}", target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::rtsp::server::session::SessionState;
    use crate::format::rtp::RTPPacket;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn test_allocator_parse() {
        assert!(MulticastAllocator::parse("224.1.0.0/16").is_ok());
        assert!(MulticastAllocator::parse("239.0.0.0/8").is_ok());
        assert!(MulticastAllocator::parse("192.168.0.0/16").is_err());
        assert!(MulticastAllocator::parse("224.1.0.0").is_err());
        assert!(MulticastAllocator::parse("224.1.0.0/40").is_err());
    }

    #[test]
    fn test_allocator_distinct_and_exhausted() {
        let allocator = MulticastAllocator::parse("224.1.0.0/30").unwrap();
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        let c = allocator.allocate().unwrap();
        assert_eq!(a, Ipv4Addr::new(224, 1, 0, 1));
        assert!(a != b && b != c && a != c);
        assert!(allocator.allocate().is_err());

        allocator.release(b);
        assert_eq!(allocator.allocate().unwrap(), b);
    }

    #[tokio::test]
    async fn test_routes_by_source() {
        let udp = ServerUdp::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
        let (rtp_port, _) = udp.ports();

        let session = Arc::new(ServerSession::new(
            "S".into(),
            Weak::new(),
            "127.0.0.1:1".parse().unwrap(),
            1,
        ));
        session.set_state(SessionState::Recording);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        session.on_packet_rtp_any(move |media, pkt| s.lock().push((media, pkt.sequence_number)));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();
        udp.add_route(client_addr, "127.0.0.1:9".parse().unwrap(), &session, 1);

        let server_addr = SocketAddr::from(([127, 0, 0, 1], rtp_port));
        let raw = RTPPacket::new(96, 42, 0, 1, false, Bytes::from_static(b"abc")).marshal().unwrap();
        stranger.send_to(&raw, server_addr).await.unwrap();
        client.send_to(&raw, server_addr).await.unwrap();

        for _ in 0..50 {
            if !seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock(), vec![(1, 42)]);

        udp.remove_routes("S");
        client.send_to(&raw, server_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().len(), 1);
    }
}

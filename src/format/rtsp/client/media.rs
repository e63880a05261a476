//! Per-media transport of a client session.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::format::rtsp::callbacks::PacketCallbacks;
use crate::format::rtsp::conn::UDP_MAX_PAYLOAD;
use crate::format::rtsp::policy::Transport;
use crate::{Result, RtspError};

const PORT_PAIR_ATTEMPTS: usize = 16;

pub(crate) enum MediaTransport {
    Udp {
        rtp: Arc<UdpSocket>,
        rtcp: Arc<UdpSocket>,
        server_ports: Option<(u16, u16)>,
    },
    Multicast {
        rtp: Arc<UdpSocket>,
        rtcp: Arc<UdpSocket>,
        group: IpAddr,
        ports: (u16, u16),
    },
    Tcp {
        channels: (u8, u8),
    },
}

pub(crate) struct ClientMedia {
    /// Index of the media inside the session description.
    pub index: usize,
    pub transport: MediaTransport,
}

impl ClientMedia {
    pub fn kind(&self) -> Transport {
        match self.transport {
            MediaTransport::Udp { .. } => Transport::Udp,
            MediaTransport::Multicast { .. } => Transport::UdpMulticast,
            MediaTransport::Tcp { .. } => Transport::Tcp,
        }
    }

    /// Spawns the receive tasks of UDP-based media. TCP media are served by
    /// the connection read task instead.
    pub fn spawn_readers(
        &self,
        server_ip: IpAddr,
        callbacks: &Arc<RwLock<PacketCallbacks>>,
        last_packet: &Arc<Mutex<Instant>>,
    ) -> Vec<JoinHandle<()>> {
        let (rtp, rtcp) = match &self.transport {
            MediaTransport::Udp { rtp, rtcp, .. } | MediaTransport::Multicast { rtp, rtcp, .. } => {
                (rtp.clone(), rtcp.clone())
            }
            MediaTransport::Tcp { .. } => return Vec::new(),
        };

        [(rtp, false), (rtcp, true)]
            .into_iter()
            .map(|(socket, is_rtcp)| {
                tokio::spawn(udp_read_loop(
                    socket,
                    self.index,
                    is_rtcp,
                    server_ip,
                    callbacks.clone(),
                    last_packet.clone(),
                ))
            })
            .collect()
    }

    /// Where outgoing UDP packets of this media go.
    pub fn udp_target(&self, server_ip: IpAddr, is_rtcp: bool) -> Result<(Arc<UdpSocket>, SocketAddr)> {
        match &self.transport {
            MediaTransport::Udp {
                rtp,
                rtcp,
                server_ports: Some((rtp_port, rtcp_port)),
            } => Ok(if is_rtcp {
                (rtcp.clone(), SocketAddr::new(server_ip, *rtcp_port))
            } else {
                (rtp.clone(), SocketAddr::new(server_ip, *rtp_port))
            }),
            MediaTransport::Udp { .. } => Err(RtspError::Protocol(
                "server did not provide its UDP ports".into(),
            )),
            MediaTransport::Multicast { rtp, rtcp, group, ports } => Ok(if is_rtcp {
                (rtcp.clone(), SocketAddr::new(*group, ports.1))
            } else {
                (rtp.clone(), SocketAddr::new(*group, ports.0))
            }),
            MediaTransport::Tcp { .. } => Err(RtspError::Protocol("media uses TCP transport".into())),
        }
    }
}

fn unspecified_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Binds an RTP socket on an even port and the RTCP socket right above it.
pub(crate) async fn bind_udp_pair(server_ip: IpAddr) -> Result<(UdpSocket, UdpSocket)> {
    let local = unspecified_for(server_ip);

    for _ in 0..PORT_PAIR_ATTEMPTS {
        let rtp = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
        let port = rtp.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX {
            continue;
        }
        match UdpSocket::bind(SocketAddr::new(local, port + 1)).await {
            Ok(rtcp) => {
                debug!("bound UDP pair {}-{}", port, port + 1);
                return Ok((rtp, rtcp));
            }
            Err(e) => trace!("port {} busy: {}", port + 1, e),
        }
    }

    Err(RtspError::Protocol("unable to find a free UDP port pair".into()))
}

/// Binds the group ports announced by the server and joins the group.
pub(crate) async fn join_multicast(group: IpAddr, ports: (u16, u16)) -> Result<(UdpSocket, UdpSocket)> {
    let local = unspecified_for(group);
    let rtp = UdpSocket::bind(SocketAddr::new(local, ports.0)).await?;
    let rtcp = UdpSocket::bind(SocketAddr::new(local, ports.1)).await?;

    for socket in [&rtp, &rtcp] {
        match group {
            IpAddr::V4(g) => socket.join_multicast_v4(g, Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(g) => socket.join_multicast_v6(&g, 0)?,
        }
    }
    debug!("joined multicast group {} on ports {}-{}", group, ports.0, ports.1);

    Ok((rtp, rtcp))
}

async fn udp_read_loop(
    socket: Arc<UdpSocket>,
    media: usize,
    is_rtcp: bool,
    server_ip: IpAddr,
    callbacks: Arc<RwLock<PacketCallbacks>>,
    last_packet: Arc<Mutex<Instant>>,
) {
    let mut buf = vec![0u8; UDP_MAX_PAYLOAD + 1];

    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("UDP read on media {} failed: {}", media, e);
                return;
            }
        };

        if src.ip() != server_ip {
            trace!("ignoring UDP packet from {}", src);
            continue;
        }
        if n > UDP_MAX_PAYLOAD {
            warn!("dropping oversized UDP packet from {}", src);
            continue;
        }

        *last_packet.lock() = Instant::now();

        let callbacks = callbacks.read();
        if is_rtcp {
            callbacks.deliver_rtcp(media, &buf[..n]);
        } else {
            callbacks.deliver_rtp(media, &buf[..n]);
        }
    }
}

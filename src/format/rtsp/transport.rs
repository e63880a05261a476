use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use super::policy::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastType {
    Unicast,
    Multicast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Play,
    Record,
}

/// Lower transport of a `Transport` header entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    Udp,
    Tcp,
}

/// Value of the RTSP `Transport` header (RFC 2326 §12.39).
#[derive(Debug, Clone, PartialEq)]
pub struct TransportHeader {
    pub protocol: LowerTransport,
    pub cast_type: Option<CastType>,
    pub destination: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub ports: Option<(u16, u16)>,
    pub client_ports: Option<(u16, u16)>,
    pub server_ports: Option<(u16, u16)>,
    pub interleaved: Option<(u8, u8)>,
    pub ssrc: Option<u32>,
    pub mode: Option<TransportMode>,
    pub extra_params: HashMap<String, Option<String>>,
}

impl TransportHeader {
    fn empty(protocol: LowerTransport) -> Self {
        Self {
            protocol,
            cast_type: None,
            destination: None,
            ttl: None,
            ports: None,
            client_ports: None,
            server_ports: None,
            interleaved: None,
            ssrc: None,
            mode: None,
            extra_params: HashMap::new(),
        }
    }

    /// Unicast UDP with client ports
    pub fn new_udp(client_ports: (u16, u16)) -> Self {
        let mut header = Self::empty(LowerTransport::Udp);
        header.cast_type = Some(CastType::Unicast);
        header.client_ports = Some(client_ports);
        header
    }

    pub fn new_multicast() -> Self {
        let mut header = Self::empty(LowerTransport::Udp);
        header.cast_type = Some(CastType::Multicast);
        header
    }

    /// TCP interleaved on a pair of channels
    pub fn new_interleaved(channels: (u8, u8)) -> Self {
        let mut header = Self::empty(LowerTransport::Tcp);
        header.cast_type = Some(CastType::Unicast);
        header.interleaved = Some(channels);
        header
    }

    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Transport mode this header asks for.
    pub fn transport(&self) -> Transport {
        match (self.protocol, self.cast_type) {
            (LowerTransport::Tcp, _) => Transport::Tcp,
            (LowerTransport::Udp, Some(CastType::Multicast)) => Transport::UdpMulticast,
            (LowerTransport::Udp, _) => Transport::Udp,
        }
    }

    /// Parses a header value. When the peer offers several comma-separated
    /// transports, the first one is used.
    pub fn parse(transport: &str) -> Option<Self> {
        let first = transport.split(',').next()?.trim();
        let mut parts = first.split(';');

        let protocol = match parts.next()?.trim().to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => LowerTransport::Udp,
            "RTP/AVP/TCP" => LowerTransport::Tcp,
            _ => return None,
        };
        let mut info = Self::empty(protocol);

        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part == "unicast" {
                info.cast_type = Some(CastType::Unicast);
            } else if part == "multicast" {
                info.cast_type = Some(CastType::Multicast);
            } else if let Some((key, value)) = part.split_once('=') {
                match key {
                    "client_port" => info.client_ports = Some(parse_pair(value)?),
                    "server_port" => info.server_ports = Some(parse_pair(value)?),
                    "port" => info.ports = Some(parse_pair(value)?),
                    "interleaved" => {
                        let (rtp, rtcp) = parse_pair(value)?;
                        info.interleaved = Some((u8::try_from(rtp).ok()?, u8::try_from(rtcp).ok()?));
                    }
                    "destination" => info.destination = value.parse().ok(),
                    "ttl" => info.ttl = value.parse().ok(),
                    "ssrc" => {
                        if let Ok(ssrc) = u32::from_str_radix(value.trim_start_matches("0x"), 16) {
                            info.ssrc = Some(ssrc);
                        }
                    }
                    "mode" => {
                        info.mode = match value.trim_matches('"').to_ascii_lowercase().as_str() {
                            "play" => Some(TransportMode::Play),
                            "record" | "receive" => Some(TransportMode::Record),
                            _ => return None,
                        }
                    }
                    _ => {
                        info.extra_params.insert(key.to_string(), Some(value.to_string()));
                    }
                }
            } else {
                info.extra_params.insert(part.to_string(), None);
            }
        }

        Some(info)
    }
}

/// `a-b` port or channel pair; a lone `a` means `a` and `a+1`.
fn parse_pair(value: &str) -> Option<(u16, u16)> {
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: u16 = value.trim().parse().ok()?;
            Some((a, a.checked_add(1)?))
        }
    }
}

impl fmt::Display for TransportHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![match self.protocol {
            LowerTransport::Udp => "RTP/AVP".to_string(),
            LowerTransport::Tcp => "RTP/AVP/TCP".to_string(),
        }];

        if let Some(cast) = self.cast_type {
            parts.push(
                match cast {
                    CastType::Unicast => "unicast",
                    CastType::Multicast => "multicast",
                }
                .to_string(),
            );
        }

        if let Some(destination) = self.destination {
            parts.push(format!("destination={}", destination));
        }

        if let Some(ttl) = self.ttl {
            parts.push(format!("ttl={}", ttl));
        }

        if let Some((rtp, rtcp)) = self.ports {
            parts.push(format!("port={}-{}", rtp, rtcp));
        }

        if let Some((rtp, rtcp)) = self.client_ports {
            parts.push(format!("client_port={}-{}", rtp, rtcp));
        }

        if let Some((rtp, rtcp)) = self.server_ports {
            parts.push(format!("server_port={}-{}", rtp, rtcp));
        }

        if let Some((rtp, rtcp)) = self.interleaved {
            parts.push(format!("interleaved={}-{}", rtp, rtcp));
        }

        if let Some(ssrc) = self.ssrc {
            parts.push(format!("ssrc={:08X}", ssrc));
        }

        if let Some(mode) = self.mode {
            parts.push(
                match mode {
                    TransportMode::Play => "mode=play",
                    TransportMode::Record => "mode=record",
                }
                .to_string(),
            );
        }

        for (key, value) in &self.extra_params {
            if let Some(val) = value {
                parts.push(format!("{}={}", key, val));
            } else {
                parts.push(key.clone());
            }
        }

        f.write_str(&parts.join(";"))
    }
}

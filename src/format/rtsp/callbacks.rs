//! Registered packet handlers, shared by client and server sessions.
//!
//! Callbacks run on the task that read the packet (the connection read task
//! for interleaved frames, the socket task for UDP) and must not block.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::format::rtp::RTPPacket;

pub type OnPacketRtp = Arc<dyn Fn(&RTPPacket) + Send + Sync>;
pub type OnPacketRtpAny = Arc<dyn Fn(usize, &RTPPacket) + Send + Sync>;
pub type OnPacketRtcp = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type OnPacketRtcpAny = Arc<dyn Fn(usize, &[u8]) + Send + Sync>;

/// Callbacks keyed by media index, plus payload type for RTP.
#[derive(Default, Clone)]
pub struct PacketCallbacks {
    rtp: HashMap<(usize, u8), OnPacketRtp>,
    rtp_any: Option<OnPacketRtpAny>,
    rtcp: HashMap<usize, OnPacketRtcp>,
    rtcp_any: Option<OnPacketRtcpAny>,
}

impl PacketCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_packet_rtp<F>(&mut self, media: usize, payload_type: u8, cb: F)
    where
        F: Fn(&RTPPacket) + Send + Sync + 'static,
    {
        self.rtp.insert((media, payload_type), Arc::new(cb));
    }

    pub fn on_packet_rtp_any<F>(&mut self, cb: F)
    where
        F: Fn(usize, &RTPPacket) + Send + Sync + 'static,
    {
        self.rtp_any = Some(Arc::new(cb));
    }

    pub fn on_packet_rtcp<F>(&mut self, media: usize, cb: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.rtcp.insert(media, Arc::new(cb));
    }

    pub fn on_packet_rtcp_any<F>(&mut self, cb: F)
    where
        F: Fn(usize, &[u8]) + Send + Sync + 'static,
    {
        self.rtcp_any = Some(Arc::new(cb));
    }

    /// Parses and routes an RTP packet. A handler registered for the exact
    /// media and payload type wins over the catch-all one. Returns whether
    /// a handler ran.
    pub fn deliver_rtp(&self, media: usize, raw: &[u8]) -> bool {
        let packet = match RTPPacket::parse(raw) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping RTP packet on media {}: {}", media, e);
                return false;
            }
        };

        if let Some(cb) = self.rtp.get(&(media, packet.payload_type)) {
            cb(&packet);
            true
        } else if let Some(cb) = &self.rtp_any {
            cb(media, &packet);
            true
        } else {
            false
        }
    }

    pub fn deliver_rtcp(&self, media: usize, raw: &[u8]) -> bool {
        if let Some(cb) = self.rtcp.get(&media) {
            cb(raw);
            true
        } else if let Some(cb) = &self.rtcp_any {
            cb(media, raw);
            true
        } else {
            false
        }
    }
}

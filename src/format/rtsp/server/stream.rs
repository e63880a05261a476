//! Fan-out of published packets to reading sessions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::session::ServerSession;
use super::udp::{MulticastTarget, MulticastWriter};
use super::ServerHandle;
use crate::format::rtsp::sdp::SessionDescription;
use crate::format::rtp::RTPPacket;
use crate::{Result, RtspError};

/// A packet queued for a reader or a multicast group.
#[derive(Debug, Clone)]
pub(crate) struct OutPacket {
    pub media: usize,
    pub is_rtcp: bool,
    pub data: Bytes,
}

struct StreamReader {
    session: Weak<ServerSession>,
    /// Media delivered through the reader's own queue.
    medias: HashSet<usize>,
    queue: mpsc::Sender<OutPacket>,
}

/// A published stream that any number of sessions can read.
///
/// Writing never waits for readers: every reader has its own bounded queue
/// and a full queue loses the packet. Once [`close`](Self::close) returns,
/// nothing written afterwards reaches a reader.
pub struct ServerStream {
    server: ServerHandle,
    description: SessionDescription,
    initialized: AtomicBool,
    closed: AtomicBool,
    readers: RwLock<HashMap<String, StreamReader>>,
    multicast: RwLock<HashMap<usize, Arc<MulticastWriter>>>,
}

impl fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStream")
            .field("medias", &self.description.media.len())
            .field("readers", &self.reader_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ServerStream {
    /// Creates a stream serving `description`. Media without a control
    /// attribute get `trackID=<index>`.
    pub fn new(server: &ServerHandle, description: SessionDescription) -> Self {
        let mut description = description;
        description.ensure_controls();
        Self {
            server: server.clone(),
            description,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            readers: RwLock::new(HashMap::new()),
            multicast: RwLock::new(HashMap::new()),
        }
    }

    /// Makes the stream ready to be read and written. Fails when called more
    /// than once or when the description has no media.
    pub fn initialize(&self) -> Result<()> {
        if self.description.media.is_empty() {
            return Err(RtspError::Protocol("stream description has no media".into()));
        }
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(RtspError::Protocol("stream already initialized".into()));
        }
        debug!("stream initialized with {} media", self.description.media.len());
        Ok(())
    }

    pub fn description(&self) -> &SessionDescription {
        &self.description
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn reader_count(&self) -> usize {
        self.readers.read().len()
    }

    /// Sends an RTP packet of `media` to every reader.
    pub fn write_packet_rtp(&self, media: usize, packet: &RTPPacket) -> Result<()> {
        self.check_media(media)?;
        self.fan_out(media, false, packet.marshal()?)
    }

    /// Sends an RTCP packet of `media` to every reader.
    pub fn write_packet_rtcp(&self, media: usize, data: &[u8]) -> Result<()> {
        self.check_media(media)?;
        self.fan_out(media, true, Bytes::copy_from_slice(data))
    }

    fn check_media(&self, media: usize) -> Result<()> {
        if !self.is_initialized() {
            return Err(RtspError::Protocol("stream is not initialized".into()));
        }
        if media >= self.description.media.len() {
            return Err(RtspError::Protocol(format!("media {} does not exist", media)));
        }
        Ok(())
    }

    fn fan_out(&self, media: usize, is_rtcp: bool, data: Bytes) -> Result<()> {
        // the gate is checked under the reader lock: `close` takes the write
        // lock after raising it, so no delivery can start once it returns
        let readers = self.readers.read();
        if self.is_closed() {
            return Err(RtspError::StreamClosed);
        }

        for (id, reader) in readers.iter() {
            if !reader.medias.contains(&media) {
                continue;
            }
            let packet = OutPacket {
                media,
                is_rtcp,
                data: data.clone(),
            };
            match reader.queue.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("write queue of session {} is full, dropping packet", id)
                }
                Err(TrySendError::Closed(_)) => debug!("session {} stopped reading", id),
            }
        }

        if let Some(writer) = self.multicast.read().get(&media) {
            writer.enqueue(OutPacket { media, is_rtcp, data });
        }
        Ok(())
    }

    /// Attaches a playing session. `medias` are the media it receives
    /// through `queue`; multicast media are left to the group writers.
    pub(crate) fn add_reader(
        &self,
        session: &Arc<ServerSession>,
        medias: HashSet<usize>,
        queue: mpsc::Sender<OutPacket>,
    ) -> Result<()> {
        let mut readers = self.readers.write();
        if self.is_closed() {
            return Err(RtspError::StreamClosed);
        }
        readers.insert(
            session.id().to_string(),
            StreamReader {
                session: Arc::downgrade(session),
                medias,
                queue,
            },
        );
        debug!("session {} reading, {} readers", session.id(), readers.len());
        Ok(())
    }

    pub(crate) fn remove_reader(&self, session_id: &str) {
        if self.readers.write().remove(session_id).is_some() {
            debug!("session {} stopped reading", session_id);
        }
    }

    /// Group address and ports of a media, starting its multicast writer on
    /// first use.
    pub(crate) async fn multicast_target(&self, media: usize) -> Result<MulticastTarget> {
        let existing = self.multicast.read().get(&media).map(|w| w.target());
        if let Some(target) = existing {
            return Ok(target);
        }

        let writer = Arc::new(MulticastWriter::start(&self.server).await?);
        let mut multicast = self.multicast.write();
        if self.is_closed() {
            return Err(RtspError::StreamClosed);
        }
        let writer = multicast.entry(media).or_insert(writer).clone();
        Ok(writer.target())
    }

    #[cfg(test)]
    pub(crate) fn set_multicast_writer(&self, media: usize, writer: MulticastWriter) {
        self.multicast.write().insert(media, Arc::new(writer));
    }

    /// Stops delivery, closes every reading session and releases the
    /// multicast groups. Calling it again has no effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let readers: Vec<StreamReader> = self.readers.write().drain().map(|(_, r)| r).collect();
        self.multicast.write().clear();
        info!("stream closed, detaching {} readers", readers.len());

        for reader in readers {
            if let Some(session) = reader.session.upgrade() {
                session.close_with(RtspError::StreamClosed);
            }
        }
    }
}

impl Drop for ServerStream {
    fn drop(&mut self) {
        self.close();
    }
}

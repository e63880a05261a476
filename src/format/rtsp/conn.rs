//! Framing of a single RTSP byte stream.
//!
//! Textual requests and responses share the stream with binary interleaved
//! frames (`$`, channel, u16 BE length, payload) once TCP transport is in
//! use. The read half is owned by exactly one task; the write half sits
//! behind a per-connection async mutex so that responses, requests and
//! media frames never interleave mid-message.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::message::{parse_head, Request, Response, RtspMessage};
use crate::{Result, RtspError};

/// Largest accepted start line plus header block.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Largest accepted message body.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Largest UDP datagram accepted on media sockets.
pub const UDP_MAX_PAYLOAD: usize = 1472;

const INTERLEAVED_MARKER: u8 = b'$';

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared write half of a connection.
pub type ConnWriter = Arc<Mutex<FrameWriter<BoxedWriter>>>;

/// A binary RTP or RTCP frame carried inside the RTSP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Bytes,
}

/// Anything that can arrive on an RTSP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Interleaved(InterleavedFrame),
}

/// Splits a byte stream into an owned frame reader and a shared writer.
pub fn split<S>(stream: S) -> (FrameReader<BoxedReader>, ConnWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FrameReader::new(Box::new(read_half) as BoxedReader);
    let writer = FrameWriter::new(Box::new(write_half) as BoxedWriter);
    (reader, Arc::new(Mutex::new(writer)))
}

pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    /// Bytes of `buf` already searched for the end of a message head.
    scanned: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            scanned: 0,
        }
    }

    /// Reads the next complete message.
    ///
    /// Cancel safe: bytes read before a cancellation stay buffered and are
    /// used by the next call.
    pub async fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = self.try_parse()? {
                return Ok(message);
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(RtspError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )));
                }
                return Err(RtspError::Framing(format!(
                    "connection closed with {} bytes of partial message",
                    self.buf.len()
                )));
            }
        }
    }

    /// Like [`read_message`](Self::read_message), failing with
    /// `RtspError::Timeout` when nothing complete arrives in time.
    pub async fn read_message_timeout(&mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.read_message()).await {
            Ok(result) => result,
            Err(_) => Err(RtspError::Timeout),
        }
    }

    fn try_parse(&mut self) -> Result<Option<Message>> {
        // stray line breaks between messages are tolerated
        while self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
            self.scanned = 0;
        }

        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf[0] == INTERLEAVED_MARKER {
            if self.buf.len() < 4 {
                return Ok(None);
            }
            let channel = self.buf[1];
            let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            if self.buf.len() < 4 + len {
                return Ok(None);
            }
            self.buf.advance(4);
            let payload = self.buf.split_to(len).freeze();
            trace!("interleaved frame on channel {} ({} bytes)", channel, len);
            return Ok(Some(Message::Interleaved(InterleavedFrame { channel, payload })));
        }

        let head_end = match find_head_end(&self.buf, self.scanned) {
            Some(pos) => pos,
            None => {
                self.scanned = self.buf.len();
                if self.buf.len() > MAX_HEAD_SIZE {
                    return Err(RtspError::Framing("message head too large".into()));
                }
                return Ok(None);
            }
        };
        if head_end > MAX_HEAD_SIZE {
            return Err(RtspError::Framing("message head too large".into()));
        }

        let (message, body_len) = parse_head(&self.buf[..head_end])?;
        if body_len > MAX_BODY_SIZE {
            return Err(RtspError::Framing(format!("body of {} bytes is too large", body_len)));
        }
        if self.buf.len() < head_end + 4 + body_len {
            return Ok(None);
        }

        self.buf.advance(head_end + 4);
        self.scanned = 0;
        let body = self.buf.split_to(body_len).freeze();
        Ok(Some(match message {
            RtspMessage::Request(mut req) => {
                req.body = body;
                Message::Request(req)
            }
            RtspMessage::Response(mut res) => {
                res.body = body;
                Message::Response(res)
            }
        }))
    }
}

/// Position of the blank line ending a head, searching from `from` less the
/// three bytes a terminator split across reads may start in.
fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    let start = from.saturating_sub(3);
    buf.get(start..)?
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| start + pos)
}

pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn write_request(&mut self, req: &Request) -> Result<()> {
        self.buf.clear();
        req.marshal(&mut self.buf);
        self.flush_buf().await
    }

    pub async fn write_response(&mut self, res: &Response) -> Result<()> {
        self.buf.clear();
        res.marshal(&mut self.buf);
        self.flush_buf().await
    }

    pub async fn write_interleaved(&mut self, channel: u8, payload: &[u8]) -> Result<()> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            RtspError::Framing(format!(
                "payload of {} bytes does not fit an interleaved frame",
                payload.len()
            ))
        })?;
        self.buf.clear();
        self.buf.put_u8(INTERLEAVED_MARKER);
        self.buf.put_u8(channel);
        self.buf.put_u16(len);
        self.buf.put_slice(payload);
        self.flush_buf().await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn flush_buf(&mut self) -> Result<()> {
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

//! Opening client connections: pluggable TCP dialer plus optional TLS.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{Result, RtspError};

/// A bidirectional byte stream, plain or encrypted.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a TCP connection to a `host:port` address.
pub type DialFn = Arc<dyn Fn(String) -> BoxFuture<'static, io::Result<TcpStream>> + Send + Sync>;

/// Dials with `TcpStream::connect`.
pub fn default_dialer() -> DialFn {
    Arc::new(|addr: String| async move { TcpStream::connect(addr).await }.boxed())
}

/// TLS parameters for a secure connection.
#[derive(Clone)]
pub struct TlsParams {
    /// Name checked against the server certificate.
    pub server_name: String,
    pub config: Arc<ClientConfig>,
}

/// Dials `addr` and, when `tls` is given, performs the TLS handshake.
/// The whole operation is bounded by `timeout`. Returns the stream and the
/// peer address, which UDP transport uses to filter incoming packets.
pub async fn open(
    addr: &str,
    tls: Option<TlsParams>,
    dial: &DialFn,
    timeout: Duration,
) -> Result<(BoxedStream, SocketAddr)> {
    match tokio::time::timeout(timeout, connect(addr, tls, dial)).await {
        Ok(result) => result,
        Err(_) => Err(RtspError::Timeout),
    }
}

async fn connect(
    addr: &str,
    tls: Option<TlsParams>,
    dial: &DialFn,
) -> Result<(BoxedStream, SocketAddr)> {
    let stream = dial(addr.to_string()).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    debug!("connected to {}", peer);

    let params = match tls {
        None => return Ok((Box::new(stream) as BoxedStream, peer)),
        Some(params) => params,
    };

    let name = ServerName::try_from(params.server_name.clone())
        .map_err(|e| RtspError::Tls(format!("invalid server name: {}", e)))?;
    let connector = TlsConnector::from(params.config);
    let stream = connector
        .connect(name, stream)
        .await
        .map_err(|e| RtspError::Tls(e.to_string()))?;
    debug!("TLS handshake with {} done", peer);
    Ok((Box::new(stream) as BoxedStream, peer))
}

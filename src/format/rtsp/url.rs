//! RTSP URLs and canonical network addresses.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::{Result, RtspError};

/// Port used by every RTSP scheme when the URL carries none.
pub const DEFAULT_PORT: u16 = 554;

/// The RTSP URL schemes understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain RTSP; the client may pick any transport.
    Rtsp,
    /// RTSP over TLS; TCP only.
    Rtsps,
    /// RTSP tunneled over plain TCP; TCP only.
    Rtspt,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Rtsp => "rtsp",
            Scheme::Rtsps => "rtsps",
            Scheme::Rtspt => "rtspt",
        }
    }

    /// Every RTSP variant shares the same default port.
    pub fn default_port(&self) -> u16 {
        DEFAULT_PORT
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Rtsps)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = RtspError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rtsp" => Ok(Scheme::Rtsp),
            "rtsps" => Ok(Scheme::Rtsps),
            "rtspt" => Ok(Scheme::Rtspt),
            other => Err(RtspError::InvalidUrl(format!("unsupported scheme '{}'", other))),
        }
    }
}

/// A parsed `rtsp://`, `rtsps://` or `rtspt://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspUrl {
    inner: Url,
    scheme: Scheme,
}

impl RtspUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let inner = Url::parse(raw).map_err(|e| RtspError::InvalidUrl(format!("{}: {}", raw, e)))?;
        let scheme = inner.scheme().parse::<Scheme>()?;

        match inner.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(RtspError::InvalidUrl(format!("{}: missing host", raw))),
        }

        Ok(Self { inner, scheme })
    }

    /// Builds the URL of the server root for a scheme and `host[:port]` pair.
    pub fn from_host(scheme: Scheme, host: &str) -> Result<Self> {
        Self::parse(&format!("{}://{}/", scheme, host))
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host as written in the URL; IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        self.inner.host_str().unwrap_or_default()
    }

    /// Host without IPv6 brackets, as needed for TLS server names.
    pub fn hostname(&self) -> &str {
        self.host().trim_start_matches('[').trim_end_matches(']')
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.port()
    }

    pub fn path(&self) -> &str {
        self.inner.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.inner.query()
    }

    pub fn username(&self) -> Option<&str> {
        Some(self.inner.username()).filter(|u| !u.is_empty())
    }

    pub fn password(&self) -> Option<&str> {
        self.inner.password()
    }

    /// Canonical `host:port` of this URL, see [`canonical_addr`].
    pub fn canonical_addr(&self) -> String {
        canonical_addr(self)
    }

    /// The URL without user-info, as sent on the wire.
    pub fn without_credentials(&self) -> RtspUrl {
        let mut inner = self.inner.clone();
        let _ = inner.set_username("");
        let _ = inner.set_password(None);
        RtspUrl {
            inner,
            scheme: self.scheme,
        }
    }

    /// Resolves a media control attribute against this URL.
    ///
    /// Absolute controls are returned as they are, `*` keeps the base URL,
    /// relative controls are appended to the base path.
    pub fn join_control(&self, control: &str) -> Result<RtspUrl> {
        if control.is_empty() || control == "*" {
            return Ok(self.clone());
        }
        if control.contains("://") {
            return RtspUrl::parse(control);
        }

        let base = self.without_credentials();
        let mut joined = base.inner.clone();
        joined.set_query(None);
        let mut path = base.path().trim_end_matches('/').to_string();
        if !control.starts_with('/') {
            path.push('/');
        }
        path.push_str(control);
        joined.set_path(&path);
        if let Some(query) = base.query() {
            joined.set_query(Some(query));
        }

        Ok(RtspUrl {
            inner: joined,
            scheme: self.scheme,
        })
    }

    pub fn as_str(&self) -> &str {
        self.inner.as_str()
    }
}

impl fmt::Display for RtspUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RtspUrl {
    type Err = RtspError;

    fn from_str(s: &str) -> Result<Self> {
        RtspUrl::parse(s)
    }
}

/// Returns the `host:port` address of a URL, applying the scheme's default
/// port when none is given. Never touches the network.
pub fn canonical_addr(url: &RtspUrl) -> String {
    let port = url.port().unwrap_or_else(|| url.scheme().default_port());
    format!("{}:{}", url.host(), port)
}

//! Scheme-driven transport policy.
//!
//! The secure (`rtsps`) and tunneled (`rtspt`) schemes only work over TCP.
//! The policy is applied twice: [`resolve_transport`] patches the client's
//! preference when the client starts, and [`check_transport`] re-validates
//! the transport the caller declared right before the connection is dialed.

use std::fmt;

use super::url::Scheme;
use crate::{Result, RtspError};

/// How media packets travel between client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Unicast RTP/RTCP over a pair of UDP sockets per media.
    Udp,
    /// RTP/RTCP sent once to a multicast group shared by all readers.
    UdpMulticast,
    /// RTP/RTCP interleaved in the RTSP TCP connection.
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Udp => "UDP",
            Transport::UdpMulticast => "UDP-multicast",
            Transport::Tcp => "TCP",
        })
    }
}

/// Transport constraint attached to a URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemePolicy {
    /// The client may pick any transport.
    Unrestricted,
    /// TLS over TCP, interleaved transport only.
    ForcedSecureTcp,
    /// Plain TCP, interleaved transport only.
    ForcedTunnelTcp,
}

impl SchemePolicy {
    pub fn for_scheme(scheme: Scheme) -> Self {
        match scheme {
            Scheme::Rtsp => SchemePolicy::Unrestricted,
            Scheme::Rtsps => SchemePolicy::ForcedSecureTcp,
            Scheme::Rtspt => SchemePolicy::ForcedTunnelTcp,
        }
    }

    pub fn forces_tcp(&self) -> bool {
        !matches!(self, SchemePolicy::Unrestricted)
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, SchemePolicy::ForcedSecureTcp)
    }
}

/// Effective transport preference once the scheme's policy is applied.
///
/// Unrestricted schemes keep the requested value (possibly unset, leaving the
/// choice to SETUP negotiation); forced schemes always yield TCP.
pub fn resolve_transport(scheme: Scheme, requested: Option<Transport>) -> Option<Transport> {
    if SchemePolicy::for_scheme(scheme).forces_tcp() {
        Some(Transport::Tcp)
    } else {
        requested
    }
}

/// Rejects an explicitly declared non-TCP transport on a TCP-only scheme.
pub fn check_transport(scheme: Scheme, declared: Option<Transport>) -> Result<()> {
    match declared {
        Some(transport)
            if transport != Transport::Tcp && SchemePolicy::for_scheme(scheme).forces_tcp() =>
        {
            Err(RtspError::TransportNotAllowed { scheme, transport })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Option<Transport>; 4] = [
        None,
        Some(Transport::Udp),
        Some(Transport::UdpMulticast),
        Some(Transport::Tcp),
    ];

    #[test]
    fn test_forced_schemes_always_resolve_to_tcp() {
        for scheme in [Scheme::Rtsps, Scheme::Rtspt] {
            for requested in ALL {
                assert_eq!(resolve_transport(scheme, requested), Some(Transport::Tcp));
            }
        }
    }

    #[test]
    fn test_unrestricted_scheme_keeps_request() {
        for requested in ALL {
            assert_eq!(resolve_transport(Scheme::Rtsp, requested), requested);
            assert!(check_transport(Scheme::Rtsp, requested).is_ok());
        }
    }

    #[test]
    fn test_forced_schemes_reject_declared_non_tcp() {
        for scheme in [Scheme::Rtsps, Scheme::Rtspt] {
            assert!(check_transport(scheme, None).is_ok());
            assert!(check_transport(scheme, Some(Transport::Tcp)).is_ok());

            let err = check_transport(scheme, Some(Transport::Udp)).unwrap_err();
            assert!(matches!(
                err,
                RtspError::TransportNotAllowed { transport: Transport::Udp, .. }
            ));
            assert!(err
                .to_string()
                .contains("can't be used with a non-TCP transport protocol"));
        }
    }

    #[test]
    fn test_policy_flags() {
        assert!(SchemePolicy::for_scheme(Scheme::Rtsps).uses_tls());
        assert!(!SchemePolicy::for_scheme(Scheme::Rtspt).uses_tls());
        assert!(SchemePolicy::for_scheme(Scheme::Rtspt).forces_tcp());
        assert!(!SchemePolicy::for_scheme(Scheme::Rtsp).forces_tcp());
    }
}

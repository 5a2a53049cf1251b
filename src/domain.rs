//! Transport domain tag and the peer address record.

use std::net::SocketAddr;
use std::path::Path;

use crate::error::Error;
use crate::Result;

/// UNIX-domain socket paths are copied into a fixed `sun_path` field; 104
/// bytes is the portable ceiling.
pub const MAX_SOCKET_PATH_LEN: usize = 104;

/// Address family a [`crate::Server`] or [`crate::Client`] operates in.
///
/// Exactly one domain is selected per instance; it decides the socket
/// family, the shape of the address record, and how peers are rendered by
/// the IP accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Ipv4,
    Ipv6,
    Local,
}

impl Domain {
    pub(crate) fn family(self) -> socket2::Domain {
        match self {
            Domain::Ipv4 => socket2::Domain::IPV4,
            Domain::Ipv6 => socket2::Domain::IPV6,
            Domain::Local => socket2::Domain::UNIX,
        }
    }

    pub fn is_local(self) -> bool {
        matches!(self, Domain::Local)
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Domain::Ipv4 => write!(f, "ipv4"),
            Domain::Ipv6 => write!(f, "ipv6"),
            Domain::Local => write!(f, "local"),
        }
    }
}

/// Address record of a connected peer, matching the owning instance's
/// domain tag. UNIX-domain peers are typically autobound and carry no
/// usable path, so the local variant is a bare marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    Local,
}

impl PeerAddr {
    /// The peer rendered the way log lines and applications want it: the
    /// IP address for the internet domains, `localhost` for UNIX-domain
    /// peers.
    pub fn ip_string(&self) -> String {
        match self {
            PeerAddr::Inet(addr) => addr.ip().to_string(),
            PeerAddr::Local => "localhost".to_string(),
        }
    }
}

/// Validate a UNIX-domain socket path: non-empty and at most
/// [`MAX_SOCKET_PATH_LEN`] bytes of the actual path encoding.
pub(crate) fn validate_socket_path(path: &Path) -> Result<()> {
    let bytes = path.as_os_str().as_encoded_bytes();
    if bytes.is_empty() {
        return Err(Error::InvalidArgument(
            "socket path cannot be empty".into(),
        ));
    }
    if bytes.len() > MAX_SOCKET_PATH_LEN {
        return Err(Error::InvalidArgument(format!(
            "socket path is too long ({} bytes, limit {MAX_SOCKET_PATH_LEN})",
            bytes.len()
        )));
    }
    Ok(())
}

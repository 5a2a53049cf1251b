//! The connecting peer.
//!
//! Shape-symmetric to the server: the same three bulk-read variants with
//! the same termination rules, raising the client-side error kinds. The
//! send path additionally waits for write-readiness and queries SO_ERROR
//! first, so connect-time failures the kernel reported asynchronously
//! surface before the first payload byte is written.
//!
//! A client is a single-threaded object; callers that share one across
//! threads wrap it themselves.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use socket2::{SockAddr, Socket, Type};

use crate::domain::{validate_socket_path, Domain};
use crate::error::Error;
use crate::read::{read_bulk, send_all, wait_ready, Interest, ReadPolicy, Side};
use crate::{Result, DEFAULT_TIMEOUT};

/// An outbound stream connection over IPv4, IPv6, or a UNIX-domain socket
/// path.
#[derive(Debug)]
pub struct Client {
    domain: Domain,
    server_ip: String,
    server_port: u16,
    socket_path: Option<PathBuf>,
    socket: Option<Socket>,
    timeout: Duration,
    data: Vec<u8>,
    residual: Vec<u8>,
}

impl Client {
    /// A client for one of the internet domains. The address family of
    /// `ip` must match `domain`; the mismatch surfaces at `connect`.
    pub fn new(domain: Domain, ip: &str, port: u16) -> Result<Self> {
        if domain.is_local() {
            return Err(Error::InvalidDomain(
                "use Client::local for UNIX-domain clients".into(),
            ));
        }
        if ip.is_empty() {
            return Err(Error::InvalidArgument(
                "server IP address cannot be empty".into(),
            ));
        }
        Ok(Self {
            domain,
            server_ip: ip.to_string(),
            server_port: port,
            socket_path: None,
            socket: None,
            timeout: DEFAULT_TIMEOUT,
            data: Vec::new(),
            residual: Vec::new(),
        })
    }

    /// A client for a UNIX-domain server at `path`.
    pub fn local(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        validate_socket_path(&path)?;
        Ok(Self {
            domain: Domain::Local,
            server_ip: String::new(),
            server_port: 0,
            socket_path: Some(path),
            socket: None,
            timeout: DEFAULT_TIMEOUT,
            data: Vec::new(),
            residual: Vec::new(),
        })
    }

    /// Build the family-specific address and connect a blocking stream
    /// socket to it.
    pub fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Err(Error::ClientCreation(
                "the client is already connected".into(),
            ));
        }
        let addr = self.server_addr()?;
        let socket = Socket::new(self.domain.family(), Type::STREAM, None)
            .map_err(|e| Error::ClientCreation(format!("creating the socket failed: {e}")))?;
        socket
            .connect(&addr)
            .map_err(|e| Error::ClientCreation(format!("connecting the socket failed: {e}")))?;
        self.socket = Some(socket);
        tracing::debug!(domain = %self.domain, "connected to server");
        Ok(())
    }

    fn server_addr(&self) -> Result<SockAddr> {
        match self.domain {
            Domain::Ipv4 => {
                let ip: Ipv4Addr = self
                    .server_ip
                    .parse()
                    .map_err(|_| Error::ClientCreation("invalid IP address".into()))?;
                Ok(SockAddr::from(SocketAddr::new(
                    IpAddr::V4(ip),
                    self.server_port,
                )))
            }
            Domain::Ipv6 => {
                let ip: Ipv6Addr = self
                    .server_ip
                    .parse()
                    .map_err(|_| Error::ClientCreation("invalid IP address".into()))?;
                Ok(SockAddr::from(SocketAddr::new(
                    IpAddr::V6(ip),
                    self.server_port,
                )))
            }
            Domain::Local => {
                let path = self.socket_path.as_ref().ok_or_else(|| {
                    Error::InvalidArgument("UNIX-domain client has no socket path".into())
                })?;
                SockAddr::unix(path)
                    .map_err(|e| Error::ClientCreation(format!("building the address failed: {e}")))
            }
        }
    }

    /// Close the connection. Disconnecting a client that is not connected
    /// is a runtime error; `Drop` swallows it.
    pub fn disconnect(&mut self) -> Result<()> {
        match self.socket.take() {
            Some(socket) => {
                drop(socket);
                Ok(())
            }
            None => Err(Error::ClientRuntime("the client is not connected".into())),
        }
    }

    /// Write the whole payload.
    ///
    /// Waits for write-readiness within the configured timeout, surfaces
    /// any deferred socket error the kernel recorded, then sends with
    /// broken-pipe signals suppressed.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("data to send cannot be empty".into()));
        }
        let socket = self.connected()?;
        if !wait_ready(socket, Interest::Write, self.timeout, Side::Client)? {
            return Err(Error::ClientTimeout(
                "timeout reached while sending data".into(),
            ));
        }
        if let Some(err) = socket.take_error().map_err(|e| {
            Error::ClientRuntime(format!("querying the socket error state failed: {e}"))
        })? {
            return Err(Error::ClientRuntime(format!(
                "the socket reported a deferred error: {err}"
            )));
        }
        send_all(socket, data, Side::Client)
    }

    /// Read exactly `count` bytes into the stored payload.
    pub fn read_exact(&mut self, count: usize) -> Result<()> {
        self.read_with(ReadPolicy::Exact(count))
    }

    /// Read until `delim` occurs; the stored payload ends with its first
    /// occurrence. Bytes received past it are kept for the next read.
    pub fn read_until(&mut self, delim: &[u8]) -> Result<()> {
        self.read_with(ReadPolicy::Until(delim.to_vec()))
    }

    /// Read until `delim` has occurred `times` times (non-overlapping);
    /// the stored payload ends with the last occurrence.
    pub fn read_until_count(&mut self, delim: &[u8], times: usize) -> Result<()> {
        self.read_with(ReadPolicy::UntilCount(delim.to_vec(), times))
    }

    fn read_with(&mut self, policy: ReadPolicy) -> Result<()> {
        self.data.clear();
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::ClientRuntime("the client is not connected".into()))?;
        let stored = read_bulk(
            socket,
            self.timeout,
            &mut self.residual,
            &policy,
            Side::Client,
        )?;
        self.data = stored;
        Ok(())
    }

    /// Payload stored by the last successful bulk read.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bounded readiness probe on the connection.
    pub fn is_data_available(&self, timeout: Duration) -> Result<bool> {
        let socket = self.connected()?;
        wait_ready(socket, Interest::Read, timeout, Side::Client)
    }

    /// Per-read budget used by all bulk reads and the send-readiness
    /// wait.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn server_ip(&self) -> &str {
        &self.server_ip
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    fn connected(&self) -> Result<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::ClientRuntime("the client is not connected".into()))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.socket.is_some() {
            // Nothing better to do with a failure at destruction.
            let _ = self.disconnect();
        }
    }
}

//! The connection-multiplexing server.
//!
//! One instance owns a listening socket, an [`EventQueue`], and a dense
//! registry of connected peers keyed by small integer client ids. Ids are
//! renumbered by a compaction pass at the top of every accept, so between
//! accepts they are stable and afterwards they occupy `[0, n)` again.
//!
//! Every mutable field sits behind its own lock; multiple application
//! threads may drive the same instance. There is no global lock, so callers
//! that need cross-field atomicity must provide it themselves.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{recv, MsgFlags};
use socket2::{SockAddr, Socket, Type};

use crate::domain::{validate_socket_path, Domain, PeerAddr};
use crate::error::{Error, MAX_CONNECTIONS_REACHED};
use crate::event_queue::EventQueue;
use crate::read::{read_bulk, send_all, wait_ready, Interest, ReadPolicy, Side};
use crate::{sys, Result, DEFAULT_TIMEOUT};

/// What a readiness event means to the application, translated from the
/// raw queue events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// The kernel flagged an error or hangup on some registered
    /// descriptor.
    Error,
    /// The listening socket is readable: a peer wants to connect. Answer
    /// with [`Server::accept_client`].
    IncomingConnection,
    /// A connected peer has data queued. Answer with one of the bulk
    /// reads.
    ClientData(usize),
}

#[derive(Debug)]
struct ClientSlot {
    /// `None` marks a freed slot awaiting compaction.
    socket: Option<Socket>,
    addr: PeerAddr,
    /// Payload stored by the last successful bulk read.
    data: Vec<u8>,
    /// Bytes received past the last read's terminator, consumed by the
    /// next read on this client.
    residual: Vec<u8>,
}

/// A readiness-driven stream server over IPv4, IPv6, or a UNIX-domain
/// socket path.
#[derive(Debug)]
pub struct Server {
    domain: Domain,
    port: u16,
    backlog: usize,
    socket_path: Option<PathBuf>,
    timeout: RwLock<Duration>,
    listener: RwLock<Option<Socket>>,
    queue: RwLock<Option<EventQueue>>,
    clients: RwLock<Vec<ClientSlot>>,
    online: AtomicBool,
    started_at: RwLock<u64>,
    start_date: RwLock<String>,
}

impl Server {
    /// A server in one of the internet domains, bound to the wildcard
    /// address of that family at `start`.
    pub fn new(domain: Domain, port: u16, backlog: usize) -> Result<Self> {
        if domain.is_local() {
            return Err(Error::InvalidDomain(
                "use Server::local for UNIX-domain servers".into(),
            ));
        }
        Self::build(domain, port, backlog, None)
    }

    /// A UNIX-domain server bound to `path` at `start`. A stale socket
    /// file at that path is removed before binding.
    pub fn local(path: impl Into<PathBuf>, backlog: usize) -> Result<Self> {
        let path = path.into();
        validate_socket_path(&path)?;
        Self::build(Domain::Local, 0, backlog, Some(path))
    }

    fn build(
        domain: Domain,
        port: u16,
        backlog: usize,
        socket_path: Option<PathBuf>,
    ) -> Result<Self> {
        if backlog == 0 {
            return Err(Error::InvalidArgument(
                "backlog must be greater than zero".into(),
            ));
        }
        Ok(Self {
            domain,
            port,
            backlog,
            socket_path,
            timeout: RwLock::new(DEFAULT_TIMEOUT),
            listener: RwLock::new(None),
            queue: RwLock::new(None),
            clients: RwLock::new(Vec::new()),
            online: AtomicBool::new(false),
            started_at: RwLock::new(0),
            start_date: RwLock::new(String::new()),
        })
    }

    /// Create the listening socket, bind it, and attach the event queue.
    /// On success the server is online and stamped with its start time.
    pub fn start(&self) -> Result<()> {
        let socket = Socket::new(self.domain.family(), Type::STREAM, None)
            .map_err(|e| Error::ServerCreation(format!("creating the socket failed: {e}")))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::ServerCreation(format!("setting socket options failed: {e}")))?;

        if let Some(path) = &self.socket_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::ServerCreation(format!(
                        "removing the existing socket file failed: {e}"
                    )))
                }
            }
        }
        socket
            .bind(&self.bind_address()?)
            .map_err(|e| Error::ServerCreation(format!("binding the socket failed: {e}")))?;

        let mut queue = EventQueue::new()?;
        queue.attach_listener(&socket).map_err(|e| match e {
            Error::ServerRuntime(msg) => Error::ServerCreation(msg),
            other => other,
        })?;

        *write_lock(&self.listener) = Some(socket);
        *write_lock(&self.queue) = Some(queue);
        self.online.store(true, Ordering::SeqCst);
        *write_lock(&self.started_at) = sys::epoch_seconds();
        *write_lock(&self.start_date) =
            format!("{} {}", sys::current_date()?, sys::current_time()?);
        tracing::info!(domain = %self.domain, port = self.port, "server started");
        Ok(())
    }

    fn bind_address(&self) -> Result<SockAddr> {
        match self.domain {
            Domain::Ipv4 => Ok(SockAddr::from(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                self.port,
            ))),
            Domain::Ipv6 => Ok(SockAddr::from(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                self.port,
            ))),
            Domain::Local => {
                let path = self.socket_path.as_ref().ok_or_else(|| {
                    Error::InvalidArgument("UNIX-domain server has no socket path".into())
                })?;
                SockAddr::unix(path)
                    .map_err(|e| Error::ServerCreation(format!("building the address failed: {e}")))
            }
        }
    }

    /// Place the listening socket in accept mode at the configured
    /// backlog.
    pub fn listen(&self) -> Result<()> {
        let guard = read_lock(&self.listener);
        let listener = guard
            .as_ref()
            .ok_or_else(|| Error::ServerRuntime("the server is not started".into()))?;
        let backlog = i32::try_from(self.backlog).unwrap_or(i32::MAX);
        listener
            .listen(backlog)
            .map_err(|e| Error::ServerRuntime(format!("listening on the socket failed: {e}")))
    }

    /// Toggle SO_KEEPALIVE on the listener.
    pub fn set_keep_alive(&self, keep_alive: bool) -> Result<()> {
        let guard = read_lock(&self.listener);
        let listener = guard
            .as_ref()
            .ok_or_else(|| Error::ServerRuntime("the server is not started".into()))?;
        listener.set_keepalive(keep_alive).map_err(|e| {
            Error::ServerRuntime(format!("setting the keep alive option failed: {e}"))
        })
    }

    /// Per-read budget used by all bulk reads on this instance.
    pub fn set_timeout(&self, timeout: Duration) {
        *write_lock(&self.timeout) = timeout;
    }

    /// Accept one pending connection and return its client id.
    ///
    /// Disconnected peers are reaped first and the registry is compacted,
    /// so ids handed out earlier may be renumbered by this call. With the
    /// registry still full afterwards the accept is refused; the caller
    /// can retry once a peer disconnects.
    pub fn accept_client(&self) -> Result<usize> {
        self.compact()?;
        if read_lock(&self.clients).len() >= self.backlog {
            return Err(Error::ServerRuntime(MAX_CONNECTIONS_REACHED.into()));
        }

        let (socket, sockaddr) = {
            let guard = read_lock(&self.listener);
            let listener = guard
                .as_ref()
                .ok_or_else(|| Error::ServerRuntime("the server is not started".into()))?;
            listener
                .accept()
                .map_err(|e| Error::ServerRuntime(format!("accepting the client failed: {e}")))?
        };
        let addr = match self.domain {
            Domain::Local => PeerAddr::Local,
            Domain::Ipv4 | Domain::Ipv6 => sockaddr
                .as_socket()
                .map(PeerAddr::Inet)
                .ok_or_else(|| {
                    Error::ServerRuntime("accepted peer has an unexpected address family".into())
                })?,
        };

        {
            let guard = read_lock(&self.queue);
            let queue = guard
                .as_ref()
                .ok_or_else(|| Error::ServerRuntime("the event queue is not attached".into()))?;
            queue.add_client(&socket)?;
        }

        let mut clients = write_lock(&self.clients);
        let id = clients.len();
        clients.push(ClientSlot {
            socket: Some(socket),
            addr,
            data: Vec::new(),
            residual: Vec::new(),
        });
        tracing::debug!(client_id = id, peer = %clients[id].addr.ip_string(), "client accepted");
        Ok(id)
    }

    /// Reap disconnected peers and renumber the survivors so ids occupy
    /// `[0, n)` densely.
    fn compact(&self) -> Result<()> {
        let queue = read_lock(&self.queue);
        let mut clients = write_lock(&self.clients);
        let before = clients.len();
        for slot in clients.iter_mut() {
            let disconnected = matches!(&slot.socket, Some(sock) if is_disconnected(sock));
            if disconnected {
                if let (Some(queue), Some(sock)) = (queue.as_ref(), slot.socket.as_ref()) {
                    queue.remove_client(sock)?;
                }
                // Dropping the socket closes the descriptor.
                slot.socket = None;
            }
        }
        clients.retain(|slot| slot.socket.is_some());
        let live = clients.len();
        if live != before {
            tracing::debug!(removed = before - live, live, "compacted client registry");
        }
        Ok(())
    }

    /// Close one peer. Closing an already-freed slot is tolerated; the
    /// slot itself is reclaimed by the next compaction.
    pub fn close_client(&self, id: usize) -> Result<()> {
        let mut clients = write_lock(&self.clients);
        let slot = clients
            .get_mut(id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown client id {id}")))?;
        slot.socket = None;
        Ok(())
    }

    /// Write the whole payload to one peer.
    pub fn send(&self, id: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("data to send cannot be empty".into()));
        }
        let socket = {
            let clients = read_lock(&self.clients);
            let slot = clients
                .get(id)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown client id {id}")))?;
            slot.socket
                .as_ref()
                .ok_or_else(|| Error::InvalidArgument(format!("client {id} is closed")))?
                .try_clone()
                .map_err(|e| {
                    Error::ServerRuntime(format!("duplicating the client descriptor failed: {e}"))
                })?
        };
        send_all(&socket, data, Side::Server)
    }

    /// Read exactly `count` bytes from one peer into its stored payload.
    pub fn read_exact(&self, id: usize, count: usize) -> Result<()> {
        self.read_with(id, ReadPolicy::Exact(count))
    }

    /// Read until `delim` occurs; the stored payload ends with its first
    /// occurrence. Bytes received past it are kept for the next read.
    pub fn read_until(&self, id: usize, delim: &[u8]) -> Result<()> {
        self.read_with(id, ReadPolicy::Until(delim.to_vec()))
    }

    /// Read until `delim` has occurred `times` times (non-overlapping);
    /// the stored payload ends with the last occurrence.
    pub fn read_until_count(&self, id: usize, delim: &[u8], times: usize) -> Result<()> {
        self.read_with(id, ReadPolicy::UntilCount(delim.to_vec(), times))
    }

    fn read_with(&self, id: usize, policy: ReadPolicy) -> Result<()> {
        let timeout = *read_lock(&self.timeout);
        let (socket, mut carry) = {
            let mut clients = write_lock(&self.clients);
            let slot = clients
                .get_mut(id)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown client id {id}")))?;
            // A failed read must leave no partial payload observable.
            slot.data.clear();
            let socket = slot
                .socket
                .as_ref()
                .ok_or_else(|| Error::InvalidArgument(format!("client {id} is closed")))?
                .try_clone()
                .map_err(|e| {
                    Error::ServerRuntime(format!("duplicating the client descriptor failed: {e}"))
                })?;
            (socket, std::mem::take(&mut slot.residual))
        };

        // The registry lock is not held across the blocking loop.
        let outcome = read_bulk(&socket, timeout, &mut carry, &policy, Side::Server);

        let mut clients = write_lock(&self.clients);
        if let Some(slot) = clients.get_mut(id) {
            slot.residual = carry;
            if let Ok(stored) = &outcome {
                slot.data.clone_from(stored);
            }
        }
        outcome.map(|_| ())
    }

    /// Payload stored by the last successful bulk read on this client.
    pub fn data(&self, id: usize) -> Result<Vec<u8>> {
        let clients = read_lock(&self.clients);
        clients
            .get(id)
            .map(|slot| slot.data.clone())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown client id {id}")))
    }

    /// Block on the event queue and translate raw readiness into intents.
    pub fn pending_events(&self) -> Result<Vec<ServerEvent>> {
        let guard = read_lock(&self.queue);
        let queue = guard
            .as_ref()
            .ok_or_else(|| Error::ServerRuntime("the event queue is not attached".into()))?;
        let raw = queue.poll()?;

        let clients = read_lock(&self.clients);
        let mut events = Vec::with_capacity(raw.len());
        for ev in raw {
            if ev.has_error() {
                events.push(ServerEvent::Error);
            } else if queue.is_listener(&ev) {
                events.push(ServerEvent::IncomingConnection);
            } else {
                let id = clients
                    .iter()
                    .position(|slot| {
                        matches!(&slot.socket, Some(sock) if sock.as_raw_fd() == ev.fd())
                    })
                    .ok_or_else(|| {
                        Error::ServerRuntime(format!(
                            "no client registered for descriptor {}",
                            ev.fd()
                        ))
                    })?;
                events.push(ServerEvent::ClientData(id));
            }
        }
        Ok(events)
    }

    /// Bounded readiness probe on the listener only, for callers that
    /// prefer direct selection over the event queue.
    pub fn is_data_available(&self, timeout: Duration) -> Result<bool> {
        let guard = read_lock(&self.listener);
        let listener = guard
            .as_ref()
            .ok_or_else(|| Error::ServerRuntime("the server is not started".into()))?;
        wait_ready(listener, Interest::Read, timeout, Side::Server)
    }

    /// Number of peers that are still connected (freed slots and peers
    /// that closed since the last compaction are not counted).
    pub fn connected_clients(&self) -> usize {
        let clients = read_lock(&self.clients);
        clients
            .iter()
            .filter(|slot| matches!(&slot.socket, Some(sock) if !is_disconnected(sock)))
            .count()
    }

    /// The peer's address: its IP for the internet domains, `localhost`
    /// for UNIX-domain peers.
    pub fn client_ip(&self, id: usize) -> Result<String> {
        let clients = read_lock(&self.clients);
        clients
            .get(id)
            .map(|slot| slot.addr.ip_string())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown client id {id}")))
    }

    /// Close every live peer, then the listener. The instance goes
    /// offline and its start timestamp is zeroed.
    pub fn stop(&self) -> Result<()> {
        let listener = write_lock(&self.listener)
            .take()
            .ok_or_else(|| Error::ServerRuntime("the server is not running".into()))?;
        write_lock(&self.clients).clear();
        *write_lock(&self.queue) = None;
        drop(listener);
        self.online.store(false, Ordering::SeqCst);
        *write_lock(&self.started_at) = 0;
        tracing::info!("server stopped");
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// The configured port. Zero for UNIX-domain servers and for wildcard
    /// binds before `start`; see [`Server::local_addr`] for the port the
    /// kernel actually assigned.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn backlog(&self) -> usize {
        self.backlog
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// The bound address of a started internet-domain server.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let guard = read_lock(&self.listener);
        let listener = guard
            .as_ref()
            .ok_or_else(|| Error::ServerRuntime("the server is not started".into()))?;
        listener
            .local_addr()
            .map_err(|e| Error::ServerRuntime(format!("querying the bound address failed: {e}")))?
            .as_socket()
            .ok_or_else(|| {
                Error::InvalidDomain("UNIX-domain servers have no internet address".into())
            })
    }

    /// Human-readable start stamp ("dd.mm.yyyy hh:mm:ss"), set by `start`.
    pub fn start_date(&self) -> String {
        read_lock(&self.start_date).clone()
    }

    /// Start time in seconds since the UNIX epoch; zero when stopped.
    pub fn started_at(&self) -> u64 {
        *read_lock(&self.started_at)
    }

    /// Seconds the server has been online.
    pub fn uptime(&self) -> u64 {
        let started = self.started_at();
        if started == 0 {
            return 0;
        }
        sys::epoch_seconds().saturating_sub(started)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_online() {
            if let Err(e) = self.stop() {
                tracing::warn!(error = %e, "failed to stop server during drop");
            }
        }
    }
}

/// Non-destructive liveness probe: peek one byte without blocking. EOF and
/// hard errors mean the peer is gone; a would-block result means it is
/// alive with nothing queued. Interrupts retry.
fn is_disconnected(sock: &Socket) -> bool {
    let mut probe = [0u8; 1];
    loop {
        match recv(
            sock.as_raw_fd(),
            &mut probe,
            MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(0) => return true,
            Ok(_) => return false,
            Err(Errno::EAGAIN) => return false,
            Err(Errno::EINTR) => continue,
            Err(_) => return true,
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_constructor_refuses_the_local_domain() {
        let err = Server::new(Domain::Local, 0, 4).unwrap_err();
        assert!(matches!(err, Error::InvalidDomain(_)));
    }

    #[test]
    fn backlog_must_be_positive() {
        let err = Server::new(Domain::Ipv4, 0, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = Server::local("/tmp/mux-test.sock", 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn local_constructor_validates_the_path() {
        assert!(Server::local("", 4).is_err());
        let long = format!("/tmp/{}", "x".repeat(120));
        assert!(Server::local(long, 4).is_err());
        assert!(Server::local("/tmp/mux-ok.sock", 4).is_ok());
    }

    #[test]
    fn operations_before_start_are_runtime_errors() {
        let server = Server::new(Domain::Ipv4, 0, 4).expect("server");
        assert!(matches!(server.listen(), Err(Error::ServerRuntime(_))));
        assert!(matches!(server.stop(), Err(Error::ServerRuntime(_))));
        assert!(matches!(
            server.pending_events(),
            Err(Error::ServerRuntime(_))
        ));
        assert!(!server.is_online());
        assert_eq!(server.uptime(), 0);
    }

    #[test]
    fn fresh_server_has_defaults() {
        let server = Server::new(Domain::Ipv6, 4242, 8).expect("server");
        assert_eq!(server.port(), 4242);
        assert_eq!(server.backlog(), 8);
        assert_eq!(server.domain(), Domain::Ipv6);
        assert_eq!(*read_lock(&server.timeout), crate::DEFAULT_TIMEOUT);
        assert_eq!(server.connected_clients(), 0);
        assert!(server.start_date().is_empty());
    }

    #[test]
    fn unknown_client_ids_are_invalid_arguments() {
        let server = Server::new(Domain::Ipv4, 0, 4).expect("server");
        assert!(matches!(server.data(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            server.client_ip(3),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            server.close_client(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            server.send(0, b"hi"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            server.read_exact(0, 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_payload_is_rejected_before_id_lookup() {
        let server = Server::new(Domain::Ipv4, 0, 4).expect("server");
        let err = server.send(9, b"").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid Argument: data to send cannot be empty"
        );
    }
}

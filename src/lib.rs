#![forbid(unsafe_code)]

//! A small, synchronous, stream-oriented networking substrate built directly
//! on POSIX sockets.
//!
//! Provides:
//! - [`Server`]: a connection-accepting multiplexer driven by a kernel
//!   readiness queue, with a dense client-id registry that compacts as peers
//!   disconnect
//! - [`Client`]: the symmetric connecting peer
//! - [`EventQueue`]: one readiness interface over epoll (Linux) and kqueue
//!   (the BSDs and macOS)
//!
//! Three transport domains are supported: IPv4 TCP, IPv6 TCP, and
//! UNIX-domain stream sockets. Sockets stay in blocking mode; every bounded
//! wait goes through readiness selection with a per-instance timeout. No
//! wire format is imposed: the crate moves opaque byte buffers, and the
//! delimiter-based read variants exist so callers can frame on top.

use std::time::Duration;

pub mod client;
pub mod domain;
pub mod error;
pub mod event_queue;
mod read;
pub mod server;
pub mod sys;
pub mod telemetry;

pub use client::Client;
pub use domain::{Domain, PeerAddr};
pub use error::{Error, Transience};
pub use event_queue::{EventQueue, QueueEvent};
pub use server::{Server, ServerEvent};

pub type Result<T> = std::result::Result<T, Error>;

/// Per-read budget applied until [`Server::set_timeout`] /
/// [`Client::set_timeout`] override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

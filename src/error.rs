//! Failure taxonomy shared by the server, client, event queue, and system
//! helpers.

use thiserror::Error;

/// Whether retrying the failed operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs or state.
    Permanent,
    /// Retry may help once peers disconnect or data arrives.
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Message used when `accept_client` finds the registry full. Kept as a
/// constant so `transience` can classify it without a dedicated variant.
pub(crate) const MAX_CONNECTIONS_REACHED: &str =
    "maximum number of current connections reached";

/// Crate-wide error. One variant per failure kind; every variant carries a
/// human-readable message that embeds the formatted OS error where one was
/// involved.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A precondition on an argument was violated (empty payload or
    /// delimiter, zero byte count, unknown client id, oversized socket
    /// path).
    #[error("Invalid Argument: {0}")]
    InvalidArgument(String),

    /// The requested domain is unusable for the operation (for example a
    /// UNIX-domain path handed to the IP constructor).
    #[error("Invalid Domain: {0}")]
    InvalidDomain(String),

    /// The server construction path failed (socket, bind, event-queue
    /// creation, listener attach).
    #[error("Server Creation Error: {0}")]
    ServerCreation(String),

    /// The client construction path failed (socket, address build,
    /// connect).
    #[error("Client Creation Error: {0}")]
    ClientCreation(String),

    /// A steady-state server operation failed (read, write, close, select,
    /// peer closed, backlog exhausted).
    #[error("Server Runtime Error: {0}")]
    ServerRuntime(String),

    /// A steady-state client operation failed.
    #[error("Client Runtime Error: {0}")]
    ClientRuntime(String),

    /// A server-side readiness wait exceeded its budget.
    #[error("Server Timeout Error: {0}")]
    ServerTimeout(String),

    /// A client-side readiness wait exceeded its budget.
    #[error("Client Timeout Error: {0}")]
    ClientTimeout(String),

    /// A filesystem or time retrieval failure in the system helpers.
    #[error("System Runtime Error: {0}")]
    SystemRuntime(String),
}

impl Error {
    /// Classify whether a retry may succeed. Timeouts are retryable, as is
    /// the exhausted-backlog condition (slots free up when peers
    /// disconnect); everything else needs different inputs or state.
    pub fn transience(&self) -> Transience {
        match self {
            Error::ServerTimeout(_) | Error::ClientTimeout(_) => Transience::Retryable,
            Error::ServerRuntime(msg) if msg == MAX_CONNECTIONS_REACHED => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }

    /// True for both timeout kinds, so callers can retry selectively
    /// without matching on the side.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ServerTimeout(_) | Error::ClientTimeout(_))
    }
}

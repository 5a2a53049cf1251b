//! The bounded bulk-read loop shared by the server and the client.
//!
//! All six public read operations are the same algorithm: wait for
//! read-readiness within the remaining budget, issue one `recv` into a
//! fixed buffer, append, re-check the termination policy, reset the budget
//! after every productive read, retry on interrupt. The two sides differ
//! only in which error kinds they raise, so the side travels as a
//! parameter.
//!
//! Bytes received past the matched terminator are not discarded: they stay
//! in the caller's carry buffer and satisfy the next read on the same
//! connection before any readiness wait happens.

use std::os::fd::{AsFd, AsRawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::socket::{recv, send, MsgFlags};
use nix::sys::time::{TimeVal, TimeValLike};
use socket2::Socket;

use crate::error::Error;
use crate::Result;

/// Bytes handed to the kernel per read syscall.
pub(crate) const BUFFER_SIZE: usize = 1024;

/// Which peer the operation runs on; selects the error kinds.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Side {
    Server,
    Client,
}

impl Side {
    pub(crate) fn runtime(self, msg: String) -> Error {
        match self {
            Side::Server => Error::ServerRuntime(msg),
            Side::Client => Error::ClientRuntime(msg),
        }
    }

    pub(crate) fn timeout(self, msg: &str) -> Error {
        match self {
            Side::Server => Error::ServerTimeout(msg.to_string()),
            Side::Client => Error::ClientTimeout(msg.to_string()),
        }
    }
}

/// Termination policy of a bulk read.
#[derive(Debug, Clone)]
pub(crate) enum ReadPolicy {
    /// Exactly this many bytes accumulated.
    Exact(usize),
    /// The accumulator contains the delimiter; stored payload ends with its
    /// first occurrence.
    Until(Vec<u8>),
    /// The delimiter occurred this many times, non-overlapping; stored
    /// payload ends with the n-th occurrence.
    UntilCount(Vec<u8>, usize),
}

impl ReadPolicy {
    fn validate(&self) -> Result<()> {
        match self {
            ReadPolicy::Exact(0) => Err(Error::InvalidArgument(
                "number of bytes to read must be greater than zero".into(),
            )),
            ReadPolicy::Until(delim) | ReadPolicy::UntilCount(delim, _) if delim.is_empty() => {
                Err(Error::InvalidArgument("delimiter cannot be empty".into()))
            }
            ReadPolicy::UntilCount(_, 0) => Err(Error::InvalidArgument(
                "number of delimiter occurrences must be greater than zero".into(),
            )),
            _ => Ok(()),
        }
    }

    /// End offset of the stored payload once the policy is satisfied by
    /// `acc`, or `None` to keep reading.
    fn stored_end(&self, acc: &[u8]) -> Option<usize> {
        match self {
            ReadPolicy::Exact(n) => (acc.len() >= *n).then_some(*n),
            ReadPolicy::Until(delim) => {
                find_subsequence(acc, delim, 0).map(|pos| pos + delim.len())
            }
            ReadPolicy::UntilCount(delim, wanted) => {
                let mut from = 0;
                let mut seen = 0;
                while let Some(pos) = find_subsequence(acc, delim, from) {
                    from = pos + delim.len();
                    seen += 1;
                    if seen == *wanted {
                        return Some(from);
                    }
                }
                None
            }
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn timeval(duration: Duration) -> TimeVal {
    TimeVal::microseconds(duration.as_micros().min(i64::MAX as u128) as i64)
}

/// What a readiness wait should watch for.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// Bounded readiness wait on one descriptor. `Ok(true)` means ready,
/// `Ok(false)` means the budget elapsed first. Interrupts retry within the
/// same budget.
pub(crate) fn wait_ready(
    sock: &Socket,
    interest: Interest,
    timeout: Duration,
    side: Side,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut fds = FdSet::new();
        fds.insert(sock.as_fd());
        let mut tv = timeval(remaining);
        let (readfds, writefds) = match interest {
            Interest::Read => (Some(&mut fds), None),
            Interest::Write => (None, Some(&mut fds)),
        };
        match select(None, readfds, writefds, None, Some(&mut tv)) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(side.runtime(format!("error during select: {e}"))),
        }
    }
}

/// Run one bulk read to completion.
///
/// `carry` is the connection's residual buffer: it is consumed first and
/// receives the unconsumed tail on success. On failure every byte seen so
/// far is put back into `carry`, so a retried read observes the same
/// stream.
pub(crate) fn read_bulk(
    sock: &Socket,
    timeout: Duration,
    carry: &mut Vec<u8>,
    policy: &ReadPolicy,
    side: Side,
) -> Result<Vec<u8>> {
    policy.validate()?;

    let mut acc = std::mem::take(carry);
    if let Some(end) = policy.stored_end(&acc) {
        *carry = acc.split_off(end);
        return Ok(acc);
    }

    let fd = sock.as_raw_fd();
    let mut buf = [0u8; BUFFER_SIZE];
    let mut deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut readfds = FdSet::new();
        readfds.insert(sock.as_fd());
        let mut tv = timeval(remaining);
        match select(None, Some(&mut readfds), None, None, Some(&mut tv)) {
            Ok(0) => {
                *carry = acc;
                return Err(side.timeout("timeout reached while reading data"));
            }
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                *carry = acc;
                return Err(side.runtime(format!("error during select: {e}")));
            }
        }
        if !readfds.contains(sock.as_fd()) {
            continue;
        }
        match recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(0) => {
                *carry = acc;
                return Err(side.runtime("connection closed by peer".into()));
            }
            Ok(n) => {
                acc.extend_from_slice(&buf[..n]);
                if let Some(end) = policy.stored_end(&acc) {
                    *carry = acc.split_off(end);
                    return Ok(acc);
                }
                deadline = Instant::now() + timeout;
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                *carry = acc;
                return Err(side.runtime(format!("error reading data: {e}")));
            }
        }
    }
}

/// Write the whole payload, retrying interrupts and short writes.
/// Broken-pipe signals are suppressed; the failure arrives as an error
/// instead.
pub(crate) fn send_all(sock: &Socket, data: &[u8], side: Side) -> Result<()> {
    let fd = sock.as_raw_fd();
    let mut written = 0;
    while written < data.len() {
        match send(fd, &data[written..], MsgFlags::MSG_NOSIGNAL) {
            Ok(n) => written += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(side.runtime(format!("sending the data failed: {e}"))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn pair() -> (Socket, Socket) {
        Socket::pair(socket2::Domain::UNIX, socket2::Type::STREAM, None).expect("socketpair")
    }

    #[test]
    fn exact_accumulates_across_writes() {
        let (a, mut b) = pair();
        b.write_all(b"ABCD").expect("first write");
        b.write_all(b"EFGHIJ").expect("second write");

        let mut carry = Vec::new();
        let stored = read_bulk(
            &a,
            Duration::from_secs(5),
            &mut carry,
            &ReadPolicy::Exact(10),
            Side::Server,
        )
        .expect("read exact");
        assert_eq!(stored, b"ABCDEFGHIJ");
        assert!(carry.is_empty());
    }

    #[test]
    fn until_truncates_at_first_match_and_keeps_the_tail() {
        let (a, mut b) = pair();
        b.write_all(b"ping\nleftover").expect("write");

        let mut carry = Vec::new();
        let stored = read_bulk(
            &a,
            Duration::from_secs(5),
            &mut carry,
            &ReadPolicy::Until(b"\n".to_vec()),
            Side::Server,
        )
        .expect("read until");
        assert_eq!(stored, b"ping\n");
        assert_eq!(carry, b"leftover");

        // The tail satisfies the next read without new traffic.
        b.write_all(b"!").expect("write tail end");
        let stored = read_bulk(
            &a,
            Duration::from_secs(5),
            &mut carry,
            &ReadPolicy::Exact(9),
            Side::Server,
        )
        .expect("read from carry");
        assert_eq!(stored, b"leftover!");
        assert!(carry.is_empty());
    }

    #[test]
    fn until_count_matches_non_overlapping() {
        let (a, mut b) = pair();
        b.write_all(b"a|b|c|d|").expect("write");

        let mut carry = Vec::new();
        let stored = read_bulk(
            &a,
            Duration::from_secs(5),
            &mut carry,
            &ReadPolicy::UntilCount(b"|".to_vec(), 3),
            Side::Server,
        )
        .expect("read until count");
        assert_eq!(stored, b"a|b|c|");
        assert_eq!(carry, b"d|");
    }

    #[test]
    fn zero_timeout_raises_unless_data_is_queued() {
        let (a, mut b) = pair();

        let mut carry = Vec::new();
        let err = read_bulk(
            &a,
            Duration::ZERO,
            &mut carry,
            &ReadPolicy::Exact(1),
            Side::Server,
        )
        .expect_err("nothing queued");
        assert!(matches!(err, Error::ServerTimeout(_)));

        b.write_all(b"x").expect("write");
        // Give the kernel a moment to make the byte readable.
        std::thread::sleep(Duration::from_millis(20));
        let stored = read_bulk(
            &a,
            Duration::ZERO,
            &mut carry,
            &ReadPolicy::Exact(1),
            Side::Server,
        )
        .expect("data already queued");
        assert_eq!(stored, b"x");
    }

    #[test]
    fn failed_read_keeps_accumulated_bytes_in_carry() {
        let (a, mut b) = pair();
        b.write_all(b"par").expect("write");
        std::thread::sleep(Duration::from_millis(20));

        let mut carry = Vec::new();
        let err = read_bulk(
            &a,
            Duration::from_millis(50),
            &mut carry,
            &ReadPolicy::Exact(10),
            Side::Client,
        )
        .expect_err("budget too small for 10 bytes");
        assert!(matches!(err, Error::ClientTimeout(_)));
        assert_eq!(carry, b"par");
    }

    #[test]
    fn closed_peer_is_a_runtime_error() {
        let (a, b) = pair();
        drop(b);

        let mut carry = Vec::new();
        let err = read_bulk(
            &a,
            Duration::from_secs(1),
            &mut carry,
            &ReadPolicy::Exact(1),
            Side::Server,
        )
        .expect_err("peer closed");
        assert!(matches!(err, Error::ServerRuntime(_)));
        assert!(err.to_string().contains("connection closed"));
    }

    #[test]
    fn policies_reject_degenerate_arguments() {
        let (a, _b) = pair();
        let mut carry = Vec::new();
        for policy in [
            ReadPolicy::Exact(0),
            ReadPolicy::Until(Vec::new()),
            ReadPolicy::UntilCount(Vec::new(), 3),
            ReadPolicy::UntilCount(b"|".to_vec(), 0),
        ] {
            let err = read_bulk(&a, Duration::ZERO, &mut carry, &policy, Side::Server)
                .expect_err("degenerate policy");
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
    }

    #[test]
    fn send_all_round_trips_through_the_pair() {
        let (a, b) = pair();
        send_all(&a, b"hello there", Side::Client).expect("send");

        let mut carry = Vec::new();
        let stored = read_bulk(
            &b,
            Duration::from_secs(5),
            &mut carry,
            &ReadPolicy::Exact(11),
            Side::Server,
        )
        .expect("read");
        assert_eq!(stored, b"hello there");
    }
}

//! Uniform readiness multiplexer over the two kernel notification
//! mechanisms: an epoll instance on Linux, a kqueue on the BSDs and macOS.
//!
//! Both backends expose the same surface: attach the listening descriptor,
//! register and deregister peers for read-readiness, and poll. Events come
//! back as backend-neutral [`QueueEvent`]s carrying the descriptor and an
//! error flag. Registration is level-triggered on both backends, so a peer
//! with unconsumed data keeps reporting readiness.
//!
//! Events on descriptors 0 through 2 are treated as spurious: they are
//! deregistered and never returned. The listener's slot cannot normally
//! collide with a standard stream, but transient kernel states have been
//! observed to report them.

use std::os::fd::RawFd;

/// Capacity handed to the kernel per poll call; larger batches are
/// delivered across calls.
pub const MAX_EVENTS: usize = 2048;

/// One readiness notification, already stripped of backend detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEvent {
    fd: RawFd,
    error: bool,
}

impl QueueEvent {
    /// The descriptor the kernel reported.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// True when the event carries an error or hangup flag.
    pub fn has_error(&self) -> bool {
        self.error
    }
}

pub use backend::EventQueue;

#[cfg(target_os = "linux")]
mod backend {
    use std::os::fd::{AsFd, AsRawFd, RawFd};
    use std::time::{Duration, Instant};

    use nix::errno::Errno;
    use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

    use super::{QueueEvent, MAX_EVENTS};
    use crate::error::Error;
    use crate::Result;

    /// Readiness queue backed by an epoll instance. The instance owns its
    /// kernel descriptor and releases it on drop.
    #[derive(Debug)]
    pub struct EventQueue {
        epoll: Epoll,
        listener_fd: RawFd,
    }

    impl EventQueue {
        pub fn new() -> Result<Self> {
            let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| {
                Error::ServerCreation(format!("creating the event queue failed: {e}"))
            })?;
            Ok(Self {
                epoll,
                listener_fd: -1,
            })
        }

        /// Register the listening descriptor and remember it for event
        /// classification.
        pub fn attach_listener<F: AsFd>(&mut self, fd: &F) -> Result<()> {
            let raw = fd.as_fd().as_raw_fd();
            self.epoll
                .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, raw as u64))
                .map_err(|e| {
                    Error::ServerRuntime(format!(
                        "adding the listener to the event queue failed: {e}"
                    ))
                })?;
            self.listener_fd = raw;
            Ok(())
        }

        /// Register a peer descriptor for read-readiness. At most one entry
        /// per descriptor.
        pub fn add_client<F: AsFd>(&self, fd: &F) -> Result<()> {
            let raw = fd.as_fd().as_raw_fd();
            self.epoll
                .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, raw as u64))
                .map_err(|e| {
                    Error::ServerRuntime(format!(
                        "adding the descriptor to the event queue failed: {e}"
                    ))
                })
        }

        /// Deregister a peer descriptor. Removing a descriptor the queue
        /// does not know is not an error.
        pub fn remove_client<F: AsFd>(&self, fd: &F) -> Result<()> {
            match self.epoll.delete(fd) {
                Ok(()) | Err(Errno::ENOENT) => Ok(()),
                Err(e) => Err(Error::ServerRuntime(format!(
                    "removing the descriptor from the event queue failed: {e}"
                ))),
            }
        }

        /// Block until at least one event survives the standard-stream
        /// filter.
        pub fn poll(&self) -> Result<Vec<QueueEvent>> {
            loop {
                let mut buf = vec![EpollEvent::empty(); MAX_EVENTS];
                let count = match self.epoll.wait(&mut buf, nix::sys::epoll::EpollTimeout::NONE) {
                    Ok(count) => count,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        return Err(Error::ServerRuntime(format!(
                            "retrieving events from the event queue failed: {e}"
                        )))
                    }
                };
                let events = self.convert(&buf[..count])?;
                if !events.is_empty() {
                    return Ok(events);
                }
            }
        }

        /// Block at most `timeout`. Returns the first surviving batch, or
        /// an empty list once the deadline passes; the caller decides
        /// whether empty-at-deadline is an error.
        pub fn poll_deadline(&self, timeout: Duration) -> Result<Vec<QueueEvent>> {
            let deadline = Instant::now() + timeout;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Vec::new());
                }
                let remaining = deadline - now;
                let chunk_ms = remaining.as_millis().min(u128::from(u16::MAX)) as u16;
                let mut buf = vec![EpollEvent::empty(); MAX_EVENTS];
                let count = match self.epoll.wait(&mut buf, chunk_ms) {
                    Ok(count) => count,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        return Err(Error::ServerRuntime(format!(
                            "retrieving events from the event queue failed: {e}"
                        )))
                    }
                };
                let events = self.convert(&buf[..count])?;
                if !events.is_empty() {
                    return Ok(events);
                }
            }
        }

        pub fn is_listener(&self, event: &QueueEvent) -> bool {
            event.fd() == self.listener_fd
        }

        pub fn is_client(&self, event: &QueueEvent) -> bool {
            event.fd() != self.listener_fd
        }

        fn convert(&self, raw: &[EpollEvent]) -> Result<Vec<QueueEvent>> {
            let mut events = Vec::with_capacity(raw.len());
            for ev in raw {
                let fd = ev.data() as RawFd;
                if fd > 2 {
                    let flags =
                        EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP;
                    events.push(QueueEvent {
                        fd,
                        error: ev.events().intersects(flags),
                    });
                } else {
                    self.drop_std_stream(fd)?;
                }
            }
            Ok(events)
        }

        fn drop_std_stream(&self, fd: RawFd) -> Result<()> {
            let deleted = match fd {
                0 => self.epoll.delete(std::io::stdin()),
                1 => self.epoll.delete(std::io::stdout()),
                _ => self.epoll.delete(std::io::stderr()),
            };
            match deleted {
                Ok(()) | Err(Errno::ENOENT) => Ok(()),
                Err(e) => Err(Error::ServerRuntime(format!(
                    "removing the descriptor from the event queue failed: {e}"
                ))),
            }
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod backend {
    use std::os::fd::{AsFd, AsRawFd, RawFd};
    use std::time::{Duration, Instant};

    use nix::errno::Errno;
    use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
    use nix::sys::time::TimeSpec;

    use super::{QueueEvent, MAX_EVENTS};
    use crate::error::Error;
    use crate::Result;

    /// Readiness queue backed by a kqueue. The instance owns its kernel
    /// descriptor and releases it on drop.
    #[derive(Debug)]
    pub struct EventQueue {
        kq: Kqueue,
        listener_fd: RawFd,
    }

    fn read_filter(fd: RawFd, flags: EventFlag) -> KEvent {
        KEvent::new(
            fd as usize,
            EventFilter::EVFILT_READ,
            flags,
            FilterFlag::empty(),
            0,
            0,
        )
    }

    impl EventQueue {
        pub fn new() -> Result<Self> {
            let kq = Kqueue::new().map_err(|e| {
                Error::ServerCreation(format!("creating the event queue failed: {e}"))
            })?;
            Ok(Self {
                kq,
                listener_fd: -1,
            })
        }

        /// Register the listening descriptor and remember it for event
        /// classification.
        pub fn attach_listener<F: AsFd>(&mut self, fd: &F) -> Result<()> {
            let raw = fd.as_fd().as_raw_fd();
            let change = read_filter(raw, EventFlag::EV_ADD | EventFlag::EV_ENABLE);
            self.kq.kevent(&[change], &mut [], None).map_err(|e| {
                Error::ServerRuntime(format!("adding the listener to the event queue failed: {e}"))
            })?;
            self.listener_fd = raw;
            Ok(())
        }

        /// Register a peer descriptor for read-readiness. At most one entry
        /// per descriptor.
        pub fn add_client<F: AsFd>(&self, fd: &F) -> Result<()> {
            let raw = fd.as_fd().as_raw_fd();
            let change = read_filter(raw, EventFlag::EV_ADD | EventFlag::EV_ENABLE);
            self.kq.kevent(&[change], &mut [], None).map_err(|e| {
                Error::ServerRuntime(format!(
                    "adding the descriptor to the event queue failed: {e}"
                ))
            })?;
            Ok(())
        }

        /// Deregister a peer descriptor. Removing a descriptor the queue
        /// does not know is not an error.
        pub fn remove_client<F: AsFd>(&self, fd: &F) -> Result<()> {
            let raw = fd.as_fd().as_raw_fd();
            self.delete_quietly(raw)
        }

        /// Block until at least one event survives the standard-stream
        /// filter.
        pub fn poll(&self) -> Result<Vec<QueueEvent>> {
            loop {
                let mut buf = vec![read_filter(0, EventFlag::empty()); MAX_EVENTS];
                let count = match self.kq.kevent(&[], &mut buf, None) {
                    Ok(count) => count,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        return Err(Error::ServerRuntime(format!(
                            "retrieving events from the event queue failed: {e}"
                        )))
                    }
                };
                let events = self.convert(&buf[..count])?;
                if !events.is_empty() {
                    return Ok(events);
                }
            }
        }

        /// Block at most `timeout`. Returns the first surviving batch, or
        /// an empty list once the deadline passes; the caller decides
        /// whether empty-at-deadline is an error.
        pub fn poll_deadline(&self, timeout: Duration) -> Result<Vec<QueueEvent>> {
            let deadline = Instant::now() + timeout;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Vec::new());
                }
                let remaining = deadline - now;
                let mut buf = vec![read_filter(0, EventFlag::empty()); MAX_EVENTS];
                let count = match self
                    .kq
                    .kevent(&[], &mut buf, Some(TimeSpec::from_duration(remaining)))
                {
                    Ok(count) => count,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        return Err(Error::ServerRuntime(format!(
                            "retrieving events from the event queue failed: {e}"
                        )))
                    }
                };
                let events = self.convert(&buf[..count])?;
                if !events.is_empty() {
                    return Ok(events);
                }
            }
        }

        pub fn is_listener(&self, event: &QueueEvent) -> bool {
            event.fd() == self.listener_fd
        }

        pub fn is_client(&self, event: &QueueEvent) -> bool {
            event.fd() != self.listener_fd
        }

        fn convert(&self, raw: &[KEvent]) -> Result<Vec<QueueEvent>> {
            let mut events = Vec::with_capacity(raw.len());
            for ev in raw {
                let fd = ev.ident() as RawFd;
                if fd > 2 {
                    events.push(QueueEvent {
                        fd,
                        error: ev.flags().contains(EventFlag::EV_ERROR),
                    });
                } else {
                    self.delete_quietly(fd)?;
                }
            }
            Ok(events)
        }

        fn delete_quietly(&self, fd: RawFd) -> Result<()> {
            let change = read_filter(fd, EventFlag::EV_DELETE);
            match self.kq.kevent(&[change], &mut [], None) {
                Ok(_) | Err(Errno::ENOENT) => Ok(()),
                Err(e) => Err(Error::ServerRuntime(format!(
                    "removing the descriptor from the event queue failed: {e}"
                ))),
            }
        }
    }
}

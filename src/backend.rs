use std::io;
use std::os::unix::io::RawFd;

use crate::os;
use crate::types::{BackendKind, BatchEvent, EventFlags};

pub(crate) enum Backend {
    #[cfg(target_os = "linux")]
    Epoll(os::linux::EpollBackend),
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    Kqueue(os::bsd::KqueueBackend),
}

fn unsupported(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{name} backend is not supported on this platform"),
    )
}

impl Backend {
    pub(crate) fn new(kind: BackendKind) -> io::Result<Self> {
        match kind {
            BackendKind::Epoll => {
                #[cfg(target_os = "linux")]
                {
                    Ok(Self::Epoll(os::linux::EpollBackend::new()?))
                }
                #[cfg(not(target_os = "linux"))]
                {
                    Err(unsupported("epoll"))
                }
            }
            BackendKind::Kqueue => {
                #[cfg(any(
                    target_os = "macos",
                    target_os = "freebsd",
                    target_os = "openbsd",
                    target_os = "netbsd"
                ))]
                {
                    Ok(Self::Kqueue(os::bsd::KqueueBackend::new()?))
                }
                #[cfg(not(any(
                    target_os = "macos",
                    target_os = "freebsd",
                    target_os = "openbsd",
                    target_os = "netbsd"
                )))]
                {
                    Err(unsupported("kqueue"))
                }
            }
        }
    }

    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        flags: EventFlags,
        registered: bool,
    ) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.register(fd, flags, registered),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            Backend::Kqueue(b) => b.register(fd, flags, registered),
        }
    }

    pub(crate) fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.remove(fd),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            Backend::Kqueue(b) => b.remove(fd),
        }
    }

    /// Block up to `timeout_ms` (negative blocks indefinitely) and fill
    /// `out` with at most `MAX_EVENTS` readiness records.
    pub(crate) fn fetch_events(
        &mut self,
        timeout_ms: i64,
        out: &mut Vec<BatchEvent>,
    ) -> io::Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.fetch_events(timeout_ms, out),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            Backend::Kqueue(b) => b.fetch_events(timeout_ms, out),
        }
    }

    pub(crate) fn timer_register(&mut self, id: u64, msecs: u32) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.timer_register(id, msecs),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            Backend::Kqueue(b) => b.timer_register(id, msecs),
        }
    }

    pub(crate) fn timer_remove(&mut self, id: u64) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.timer_remove(id),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            Backend::Kqueue(b) => b.timer_remove(id),
        }
    }

    /// Milliseconds until the recurring timer next fires.
    pub(crate) fn timer_next(&mut self, id: u64) -> io::Result<i64> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.timer_next(id),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            Backend::Kqueue(b) => b.timer_next(id),
        }
    }
}

use std::os::unix::io::RawFd;

use bitflags::bitflags;

/// Upper bound on readiness events fetched from the backend in one batch.
pub const MAX_EVENTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Epoll,
    Kqueue,
}

bitflags! {
    /// Per-fd event flags. READ and WRITE are the interest bits; EOF and
    /// ERROR are reported by the backend; EDGE_TRIGGER and BLOCKING are
    /// requested by the caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EDGE_TRIGGER = 0x04;
        const BLOCKING = 0x08;
        const EOF = 0x10;
        const ERROR = 0x20;
        const EVENT_BUFFERED = 0x40;
    }
}

impl EventFlags {
    /// Bits that may be re-delivered to a running callback.
    pub const EVENT_MASK: EventFlags = EventFlags::READ
        .union(EventFlags::WRITE)
        .union(EventFlags::EOF)
        .union(EventFlags::ERROR);

    pub(crate) const INTEREST: EventFlags = EventFlags::READ.union(EventFlags::WRITE);
}

/// What a fired readiness record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventTarget {
    Fd(RawFd),
    Interval(u64),
}

/// One slot of the dispatcher's pre-fetched batch. A scrubbed slot has
/// `target == None` and is skipped by the dispatch cursor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchEvent {
    pub(crate) target: Option<EventTarget>,
    pub(crate) events: EventFlags,
    pub(crate) ticks: u64,
}

/// Payload handed to an fd callback.
#[derive(Debug, Clone, Copy)]
pub struct FdEvent {
    pub fd: RawFd,
    pub events: EventFlags,
}

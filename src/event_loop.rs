use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;

use log::{debug, trace, warn};

use crate::backend::Backend;
use crate::clock::Timestamp;
use crate::error::{Error, Result};
use crate::interval::{Interval, IntervalTable};
use crate::process::{Process, ProcessTable};
use crate::signal::{self, InstalledHandlers, Signal, SignalTable};
use crate::timeout::{DueState, Timeout, TimeoutQueue};
use crate::types::{BackendKind, BatchEvent, EventFlags, EventTarget, FdEvent};
use crate::waker;

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub backend: BackendKind,
    /// Install the SIGCHLD handler and reap tracked children. Hosts that
    /// manage their own children can turn this off.
    pub handle_sigchld: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            backend: crate::default_backend(),
            handle_sigchld: true,
        }
    }
}

type FdCb = Box<dyn FnMut(&mut EventLoop, FdEvent) + 'static>;
type FdHook = Box<dyn FnMut(RawFd, EventFlags) + 'static>;

struct FdRegistration {
    flags: EventFlags,
    eof: bool,
    error: bool,
    cb: Option<FdCb>,
}

// One frame per fd callback currently on the call stack. Events for an
// fd that is already running accumulate in its frame instead of
// recursing; a deleted fd clears its frame's identity.
struct StackFrame {
    fd: Option<RawFd>,
    events: EventFlags,
}

/// A single-threaded event loop multiplexing fd readiness, monotonic
/// timeouts, Unix signals and child exits over epoll or kqueue.
///
/// Construction installs the process-wide signal handlers and the
/// self-pipe waker; dropping the loop restores what it installed.
pub struct EventLoop {
    backend: Backend,
    waker: waker::WakerPipe,

    fds: HashMap<RawFd, FdRegistration>,
    fd_hook: Option<FdHook>,

    timeouts: TimeoutQueue,
    processes: ProcessTable,
    signals: SignalTable,
    intervals: IntervalTable,

    batch: Vec<BatchEvent>,
    cursor: usize,
    fd_stack: Vec<StackFrame>,

    cancelled: bool,
    deadline_reached: bool,
    sigchld_pending: bool,
    status: i32,
    run_depth: u32,

    installed: InstalledHandlers,
}

impl EventLoop {
    pub fn new(backend: BackendKind) -> Result<Self> {
        Self::with_options(Options {
            backend,
            ..Options::default()
        })
    }

    pub fn with_options(opts: Options) -> Result<Self> {
        let backend = Backend::new(opts.backend).map_err(Error::Backend)?;
        let waker = waker::WakerPipe::new().map_err(Error::Syscall)?;
        // This loop takes over the process-wide signal state; whatever a
        // previous owner left behind is not ours to act on.
        signal::SIGCHLD_PENDING.store(false, Ordering::SeqCst);
        signal::CANCEL_SIGNO.store(0, Ordering::SeqCst);
        signal::WAKER_WRITE_FD.store(waker.write_fd, Ordering::SeqCst);

        let mut lp = EventLoop {
            backend,
            waker,
            fds: HashMap::new(),
            fd_hook: None,
            timeouts: TimeoutQueue::default(),
            processes: ProcessTable::default(),
            signals: SignalTable::default(),
            intervals: IntervalTable::default(),
            batch: Vec::new(),
            cursor: 0,
            fd_stack: Vec::new(),
            cancelled: false,
            deadline_reached: false,
            sigchld_pending: false,
            status: 0,
            run_depth: 0,
            installed: InstalledHandlers::default(),
        };

        let read_fd = lp.waker.read_fd;
        lp.fd_add(read_fd, EventFlags::READ, move |lp, ev| {
            lp.consume_signals(ev.fd)
        })?;
        lp.installed = signal::setup(opts.handle_sigchld);
        Ok(lp)
    }

    // ---- fd registrations ----

    /// Register or re-register `fd`. Re-adding overrides flags and the
    /// callback. A flag set without READ or WRITE is a delete.
    pub fn fd_add<F>(&mut self, fd: RawFd, flags: EventFlags, cb: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, FdEvent) + 'static,
    {
        if !flags.intersects(EventFlags::INTEREST) {
            return self.fd_delete(fd);
        }

        let registered = self.fds.contains_key(&fd);
        if !registered && !flags.contains(EventFlags::BLOCKING) {
            waker::set_nonblocking(fd).map_err(Error::Syscall)?;
        }

        self.backend
            .register(fd, flags, registered)
            .map_err(Error::Backend)?;

        if let Some(hook) = self.fd_hook.as_mut() {
            hook(fd, flags);
        }

        let entry = self.fds.entry(fd).or_insert_with(|| FdRegistration {
            flags,
            eof: false,
            error: false,
            cb: None,
        });
        entry.flags = flags;
        entry.eof = false;
        entry.error = false;
        entry.cb = Some(Box::new(cb));
        trace!("fd {fd} registered with {flags:?}");
        Ok(())
    }

    /// Unregister `fd`. Safe to call from the fd's own callback and on
    /// an fd that was never registered.
    pub fn fd_delete(&mut self, fd: RawFd) -> Result<()> {
        // Scrub batched events that still reference this fd.
        for ev in self.batch.iter_mut().skip(self.cursor) {
            if ev.target == Some(EventTarget::Fd(fd)) {
                ev.target = None;
            }
        }

        let Some(entry) = self.fds.remove(&fd) else {
            return Ok(());
        };

        if let Some(hook) = self.fd_hook.as_mut() {
            hook(fd, EventFlags::empty());
        }

        if entry.flags.contains(EventFlags::EDGE_TRIGGER) {
            for frame in &mut self.fd_stack {
                if frame.fd == Some(fd) {
                    frame.fd = None;
                }
            }
        }

        let ret = self.backend.remove(fd).map_err(Error::Backend);
        trace!("fd {fd} deleted");
        ret
    }

    pub fn fd_registered(&self, fd: RawFd) -> bool {
        self.fds.contains_key(&fd)
    }

    /// End-of-stream was observed on `fd` (false if unregistered).
    pub fn fd_eof(&self, fd: RawFd) -> bool {
        self.fds.get(&fd).is_some_and(|e| e.eof)
    }

    /// An error condition was observed on `fd` (false if unregistered).
    pub fn fd_error(&self, fd: RawFd) -> bool {
        self.fds.get(&fd).is_some_and(|e| e.error)
    }

    /// Observe registration changes: called with the requested flags
    /// after each successful add and with empty flags on delete.
    pub fn set_fd_hook<F>(&mut self, hook: F)
    where
        F: FnMut(RawFd, EventFlags) + 'static,
    {
        self.fd_hook = Some(Box::new(hook));
    }

    pub fn clear_fd_hook(&mut self) {
        self.fd_hook = None;
    }

    // ---- timeouts ----

    /// Create an idle timeout record. The callback receives its own
    /// token so it can re-arm itself.
    pub fn timeout_create<F>(&mut self, cb: F) -> Timeout
    where
        F: FnMut(&mut EventLoop, Timeout) + 'static,
    {
        self.timeouts.create(Box::new(cb))
    }

    /// Link `t` at an absolute fire time. Fails with `AlreadyPending` if
    /// it is already linked.
    pub fn timeout_add_at(&mut self, t: Timeout, when: Timestamp) -> Result<()> {
        self.timeouts.link(t, when)
    }

    /// Arm (or re-arm) `t` to fire `msecs` from now. Negative values
    /// clamp to zero.
    pub fn timeout_set(&mut self, t: Timeout, msecs: i64) -> Result<()> {
        if self.timeouts.is_pending(t) {
            self.timeouts.unlink(t)?;
        }
        let when = Timestamp::now().add_ms(msecs.max(0));
        self.timeouts.link(t, when)
    }

    pub fn timeout_cancel(&mut self, t: Timeout) -> Result<()> {
        self.timeouts.unlink(t)
    }

    /// Free the record behind `t`, cancelling it first if pending.
    pub fn timeout_destroy(&mut self, t: Timeout) {
        self.timeouts.destroy(t);
    }

    /// Milliseconds until `t` fires, clamped to `i32`; -1 if not pending.
    pub fn timeout_remaining(&self, t: Timeout) -> i32 {
        self.timeout_remaining64(t)
            .clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }

    pub fn timeout_remaining64(&self, t: Timeout) -> i64 {
        self.timeouts.remaining(t, Timestamp::now())
    }

    // ---- child processes ----

    /// Track a child; the callback fires once with the waitpid status
    /// when it exits. Children nobody tracks are still reaped.
    pub fn process_add<F>(&mut self, pid: libc::pid_t, cb: F) -> Process
    where
        F: FnMut(&mut EventLoop, Process, libc::c_int) + 'static,
    {
        self.processes.add(pid, Box::new(cb))
    }

    pub fn process_delete(&mut self, p: Process) -> Result<()> {
        self.processes.delete(p)
    }

    // ---- signals ----

    /// Subscribe to `signo`. The callback runs from loop context, never
    /// from signal context.
    pub fn signal_add<F>(&mut self, signo: libc::c_int, cb: F) -> Signal
    where
        F: FnMut(&mut EventLoop, Signal) + 'static,
    {
        self.signals.add(signo, Box::new(cb))
    }

    /// Unsubscribe, restoring the prior handler if nobody replaced ours.
    pub fn signal_delete(&mut self, s: Signal) -> Result<()> {
        self.signals.delete(s)
    }

    // ---- interval timers ----

    /// Create an idle recurring timer.
    pub fn interval_create<F>(&mut self, cb: F) -> Interval
    where
        F: FnMut(&mut EventLoop, Interval, u64) + 'static,
    {
        self.intervals.create(Box::new(cb))
    }

    /// Arm (or re-arm) `i` with the given period.
    pub fn interval_set(&mut self, i: Interval, msecs: u32) -> Result<()> {
        if !self.intervals.contains(i) {
            return Err(Error::NotPending);
        }
        self.backend
            .timer_register(i.0, msecs)
            .map_err(Error::Backend)?;
        self.intervals.set_active(i, true);
        Ok(())
    }

    pub fn interval_cancel(&mut self, i: Interval) -> Result<()> {
        if !self.intervals.is_active(i) {
            return Err(Error::NotPending);
        }
        self.backend.timer_remove(i.0).map_err(Error::Backend)?;
        self.intervals.set_active(i, false);
        Ok(())
    }

    /// Milliseconds until the next tick; -1 if not armed.
    pub fn interval_remaining(&mut self, i: Interval) -> i64 {
        if !self.intervals.is_active(i) {
            return -1;
        }
        self.backend.timer_next(i.0).unwrap_or(-1)
    }

    /// Free the record behind `i`, cancelling it first if armed.
    pub fn interval_destroy(&mut self, i: Interval) {
        let _ = self.interval_cancel(i);
        self.intervals.remove(i);
    }

    // ---- running ----

    /// Run until cancelled. Equivalent to `run_timeout(-1)`.
    pub fn run(&mut self) -> i32 {
        self.run_timeout(-1)
    }

    /// Run the loop for at most `timeout` ms (negative means no
    /// deadline). Returns the cancelling signal number, or 0 when ended
    /// by `end()` or the deadline. Re-entrant: callbacks may run a
    /// nested loop.
    pub fn run_timeout(&mut self, timeout: i64) -> i32 {
        self.run_depth += 1;
        if self.run_depth == 1 {
            // A cancellation only sticks until the outermost run is
            // re-entered.
            self.cancelled = false;
        }

        let mut deadline = None;
        if timeout >= 0 {
            let t = self.timeout_create(|lp, _| lp.deadline_reached = true);
            let _ = self.timeout_set(t, timeout);
            deadline = Some(t);
        }

        self.status = 0;
        self.deadline_reached = false;

        loop {
            self.sync_signal_state();
            if self.sigchld_pending {
                self.handle_processes();
            }
            if self.cancelled {
                break;
            }

            let now = Timestamp::now();
            let next_ms = self.process_timeouts(now);

            self.sync_signal_state();
            if self.cancelled {
                break;
            }

            if next_ms >= 0 {
                self.run_events(next_ms);
            }

            self.sync_signal_state();
            if self.cancelled || self.deadline_reached {
                break;
            }
        }

        if let Some(t) = deadline {
            self.timeouts.destroy(t);
        }
        // Reset so a parent nested loop is not prematurely deadlined.
        self.deadline_reached = false;
        self.run_depth -= 1;
        self.status
    }

    /// True while a run is being unwound by a cancellation.
    pub fn cancelling(&self) -> bool {
        self.run_depth > 0 && self.cancelled
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Cancel the loop and poke the waker so an in-progress backend wait
    /// returns.
    pub fn end(&mut self) {
        self.cancelled = true;
        signal::write_wake_byte(self.waker.write_fd, 0);
    }

    // ---- internals ----

    /// Pull the flags the signal handlers left behind into loop state.
    fn sync_signal_state(&mut self) {
        if signal::SIGCHLD_PENDING.swap(false, Ordering::SeqCst) {
            self.sigchld_pending = true;
        }
        let signo = signal::CANCEL_SIGNO.swap(0, Ordering::SeqCst);
        if signo != 0 {
            self.status = signo;
            self.cancelled = true;
        }
    }

    /// Fire every timeout due at `now`, oldest first. Returns the ms
    /// until the next pending timeout, or -1 when none are left.
    fn process_timeouts(&mut self, now: Timestamp) -> i64 {
        loop {
            match self.timeouts.pop_due(now) {
                DueState::Empty => return -1,
                DueState::Wait(ms) => return ms,
                DueState::Due(t) => {
                    if let Some(mut cb) = self.timeouts.take_cb(t) {
                        cb(self, t);
                        self.timeouts.put_cb(t, cb);
                    }
                }
            }
        }
    }

    fn handle_processes(&mut self) {
        self.sigchld_pending = false;
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid < 0 {
                if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return;
            }
            if pid == 0 {
                return;
            }
            debug!("reaped pid {pid}, status {status:#x}");
            for id in self.processes.matching(pid) {
                let token = Process(id);
                let Some(mut entry) = self.processes.remove(token) else {
                    continue;
                };
                if let Some(mut cb) = entry.cb.take() {
                    cb(self, token, status);
                }
            }
        }
    }

    /// Drain the waker pipe and dispatch subscriptions for every signal
    /// number seen, in ascending signo order.
    fn consume_signals(&mut self, fd: RawFd) {
        let mut mask: u64 = 0;
        let mut buf = [0u8; 32];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            for &b in &buf[..n as usize] {
                signal::set_signo(&mut mask, b as i32);
            }
        }
        if mask == 0 {
            return;
        }
        for id in self.signals.matching(mask) {
            let token = Signal(id);
            let Some(mut cb) = self.signals.take_cb(token) else {
                continue;
            };
            cb(self, token);
            self.signals.put_cb(token, cb);
        }
    }

    /// Buffer an event for an edge-triggered fd whose callback is
    /// already running. Level-triggered fds are not buffered; the
    /// backend will simply report them again.
    fn stack_buffer_event(&mut self, fd: RawFd, events: EventFlags) -> bool {
        let edge = self
            .fds
            .get(&fd)
            .is_some_and(|e| e.flags.contains(EventFlags::EDGE_TRIGGER));
        if !edge {
            return false;
        }
        for frame in &mut self.fd_stack {
            if frame.fd != Some(fd) {
                continue;
            }
            frame.events |= events | EventFlags::EVENT_BUFFERED;
            return true;
        }
        false
    }

    fn mark_fd_state(&mut self, fd: RawFd, events: EventFlags) {
        if let Some(e) = self.fds.get_mut(&fd) {
            e.eof |= events.contains(EventFlags::EOF);
            e.error |= events.contains(EventFlags::ERROR);
        }
    }

    /// Refill the batch if needed, then dispatch at most one callback so
    /// the run loop can service timeouts and signals in between.
    fn run_events(&mut self, timeout_ms: i64) {
        if self.cursor >= self.batch.len() {
            self.cursor = 0;
            self.batch.clear();
            if let Err(e) = self.backend.fetch_events(timeout_ms, &mut self.batch) {
                warn!("backend wait failed: {e}");
            }
        }

        while self.cursor < self.batch.len() {
            let ev = self.batch[self.cursor];
            self.cursor += 1;

            let Some(target) = ev.target else {
                continue;
            };

            match target {
                EventTarget::Interval(id) => {
                    let token = Interval(id);
                    let Some(mut cb) = self.intervals.take_cb(token) else {
                        continue;
                    };
                    cb(self, token, ev.ticks);
                    self.intervals.put_cb(token, cb);
                    return;
                }
                EventTarget::Fd(fd) => {
                    if self.stack_buffer_event(fd, ev.events) {
                        continue;
                    }
                    let Some(entry) = self.fds.get_mut(&fd) else {
                        continue;
                    };
                    let Some(mut cb) = entry.cb.take() else {
                        continue;
                    };

                    self.fd_stack.push(StackFrame {
                        fd: Some(fd),
                        events: EventFlags::empty(),
                    });
                    let mut events = ev.events;
                    loop {
                        if let Some(frame) = self.fd_stack.last_mut() {
                            frame.events = EventFlags::empty();
                        }
                        self.mark_fd_state(fd, events);
                        cb(self, FdEvent { fd, events });

                        let Some(frame) = self.fd_stack.last() else {
                            break;
                        };
                        if frame.fd.is_none() {
                            break;
                        }
                        events = frame.events & EventFlags::EVENT_MASK;
                        if events.is_empty() {
                            break;
                        }
                    }
                    self.fd_stack.pop();

                    if let Some(entry) = self.fds.get_mut(&fd) {
                        if entry.cb.is_none() {
                            entry.cb = Some(cb);
                        }
                    }
                    return;
                }
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        signal::teardown(&self.installed);

        let read_fd = self.waker.read_fd;
        if read_fd >= 0 {
            let _ = self.fd_delete(read_fd);
        }
        let _ = signal::WAKER_WRITE_FD.compare_exchange(
            self.waker.write_fd,
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.waker.close();

        // Pending records are dropped without firing.
        self.timeouts.clear();
        self.processes.clear();
    }
}

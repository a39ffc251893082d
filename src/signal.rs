use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;

/// Token naming a signal subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal(pub(crate) u64);

pub(crate) type SignalCb = Box<dyn FnMut(&mut EventLoop, Signal) + 'static>;

// Signal handlers are process-wide while the loop is an object; this is
// the lock-free state the handlers are allowed to touch. The loop that
// ran init most recently owns it.
pub(crate) static WAKER_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
pub(crate) static SIGCHLD_PENDING: AtomicBool = AtomicBool::new(false);
pub(crate) static CANCEL_SIGNO: AtomicI32 = AtomicI32::new(0);

pub(crate) extern "C" fn wake_handler(signo: libc::c_int) {
    if signo == libc::SIGCHLD {
        SIGCHLD_PENDING.store(true, Ordering::SeqCst);
    }
    let fd = WAKER_WRITE_FD.load(Ordering::SeqCst);
    write_wake_byte(fd, signo);
}

pub(crate) extern "C" fn cancel_handler(signo: libc::c_int) {
    CANCEL_SIGNO.store(signo, Ordering::SeqCst);
    let fd = WAKER_WRITE_FD.load(Ordering::SeqCst);
    write_wake_byte(fd, signo);
}

/// Async-signal-safe: retries EINTR, ignores every other write error.
pub(crate) fn write_wake_byte(fd: RawFd, signo: libc::c_int) {
    if fd < 0 {
        return;
    }
    let byte = [signo as u8];
    loop {
        let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        if n >= 0 {
            break;
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            break;
        }
    }
}

pub(crate) fn set_signo(mask: &mut u64, signo: i32) {
    if (1..=64).contains(&signo) {
        *mask |= 1u64 << (signo - 1);
    }
}

pub(crate) fn get_signo(mask: u64, signo: i32) -> bool {
    (1..=64).contains(&signo) && mask & (1u64 << (signo - 1)) != 0
}

fn current_action(signo: libc::c_int) -> libc::sigaction {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    unsafe {
        libc::sigaction(signo, ptr::null(), &mut sa);
    }
    sa
}

fn handler_addr(h: extern "C" fn(libc::c_int)) -> libc::sighandler_t {
    h as libc::sighandler_t
}

fn set_handler(signo: libc::c_int, handler: libc::sighandler_t) {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = handler;
    sa.sa_flags = 0;
    unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(signo, &sa, ptr::null_mut());
    }
}

/// Replace a handler that is currently default, returning the prior
/// action so it can be restored later. An existing custom handler is
/// left alone.
fn install(signo: libc::c_int, handler: extern "C" fn(libc::c_int)) -> Option<libc::sigaction> {
    let cur = current_action(signo);
    if cur.sa_sigaction != libc::SIG_DFL {
        return None;
    }
    set_handler(signo, handler_addr(handler));
    Some(cur)
}

/// Put the saved action back, but only if our handler is still in place.
fn restore(signo: libc::c_int, handler: extern "C" fn(libc::c_int), saved: &libc::sigaction) {
    let cur = current_action(signo);
    if cur.sa_sigaction == handler_addr(handler) {
        unsafe {
            libc::sigaction(signo, saved, ptr::null_mut());
        }
    }
}

/// Flip a signal to ignored iff its handler is currently default.
/// Returns whether the change was made, so teardown can undo it.
fn ignore(signo: libc::c_int) -> bool {
    let cur = current_action(signo);
    if cur.sa_sigaction != libc::SIG_DFL {
        return false;
    }
    set_handler(signo, libc::SIG_IGN);
    true
}

fn unignore(signo: libc::c_int) {
    let cur = current_action(signo);
    if cur.sa_sigaction == libc::SIG_IGN {
        set_handler(signo, libc::SIG_DFL);
    }
}

/// The process-level handlers one loop instance installed, for restoring
/// at teardown. Handlers another party already owned are not recorded.
#[derive(Default)]
pub(crate) struct InstalledHandlers {
    sigint: Option<libc::sigaction>,
    sigterm: Option<libc::sigaction>,
    sigchld: Option<libc::sigaction>,
    sigpipe_ignored: bool,
}

pub(crate) fn setup(handle_sigchld: bool) -> InstalledHandlers {
    InstalledHandlers {
        sigint: install(libc::SIGINT, cancel_handler),
        sigterm: install(libc::SIGTERM, cancel_handler),
        sigchld: if handle_sigchld {
            install(libc::SIGCHLD, wake_handler)
        } else {
            None
        },
        sigpipe_ignored: ignore(libc::SIGPIPE),
    }
}

pub(crate) fn teardown(installed: &InstalledHandlers) {
    if let Some(saved) = installed.sigint.as_ref() {
        restore(libc::SIGINT, cancel_handler, saved);
    }
    if let Some(saved) = installed.sigterm.as_ref() {
        restore(libc::SIGTERM, cancel_handler, saved);
    }
    if let Some(saved) = installed.sigchld.as_ref() {
        restore(libc::SIGCHLD, wake_handler, saved);
    }
    if installed.sigpipe_ignored {
        unignore(libc::SIGPIPE);
    }
}

pub(crate) struct SignalEntry {
    pub(crate) signo: libc::c_int,
    cb: Option<SignalCb>,
    orig: libc::sigaction,
}

/// User subscriptions ordered by ascending signal number.
#[derive(Default)]
pub(crate) struct SignalTable {
    entries: HashMap<u64, SignalEntry>,
    order: VecDeque<u64>,
    next_id: u64,
}

impl SignalTable {
    pub(crate) fn add(&mut self, signo: libc::c_int, cb: SignalCb) -> Signal {
        let orig = current_action(signo);
        if orig.sa_sigaction != handler_addr(wake_handler) {
            set_handler(signo, handler_addr(wake_handler));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            SignalEntry {
                signo,
                cb: Some(cb),
                orig,
            },
        );
        let pos = self.order.iter().position(|o| self.entries[o].signo > signo);
        match pos {
            Some(i) => self.order.insert(i, id),
            None => self.order.push_back(id),
        }
        Signal(id)
    }

    pub(crate) fn delete(&mut self, s: Signal) -> Result<()> {
        let entry = self.entries.remove(&s.0).ok_or(Error::NotPending)?;
        if let Some(i) = self.order.iter().position(|&id| id == s.0) {
            self.order.remove(i);
        }
        restore(entry.signo, wake_handler, &entry.orig);
        Ok(())
    }

    /// Subscription ids whose signo bit is set in `mask`, ascending.
    pub(crate) fn matching(&self, mask: u64) -> Vec<u64> {
        self.order
            .iter()
            .filter(|id| get_signo(mask, self.entries[*id].signo))
            .copied()
            .collect()
    }

    pub(crate) fn take_cb(&mut self, s: Signal) -> Option<SignalCb> {
        self.entries.get_mut(&s.0).and_then(|e| e.cb.take())
    }

    pub(crate) fn put_cb(&mut self, s: Signal, cb: SignalCb) {
        if let Some(e) = self.entries.get_mut(&s.0) {
            if e.cb.is_none() {
                e.cb = Some(cb);
            }
        }
    }
}

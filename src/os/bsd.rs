//! kqueue-based readiness backend for macOS and the BSDs, with
//! EVFILT_TIMER interval timers.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::clock::Timestamp;
use crate::types::{BatchEvent, EventFlags, EventTarget, MAX_EVENTS};

struct TimerState {
    period_ms: u32,
    next_fire: Timestamp,
}

pub(crate) struct KqueueBackend {
    kq: RawFd,
    // kqueue cannot report a timer's remaining time, so it is tracked here.
    timers: HashMap<u64, TimerState>,
}

fn change(ident: usize, filter: i32, flags: u16, data: i64) -> libc::kevent {
    libc::kevent {
        ident: ident as _,
        filter: filter as _,
        flags: flags as _,
        fflags: 0,
        data: data as _,
        udata: 0 as _,
    }
}

fn apply(kq: RawFd, changes: &[libc::kevent]) -> io::Result<()> {
    let rc = unsafe {
        libc::kevent(
            kq,
            changes.as_ptr(),
            changes.len() as _,
            ptr::null_mut(),
            0,
            ptr::null(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl KqueueBackend {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            let fl = libc::fcntl(kq, libc::F_GETFD);
            libc::fcntl(kq, libc::F_SETFD, fl | libc::FD_CLOEXEC);
        }
        Ok(KqueueBackend {
            kq,
            timers: HashMap::new(),
        })
    }

    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        flags: EventFlags,
        _registered: bool,
    ) -> io::Result<()> {
        let mut ev_flags = libc::EV_ADD as u16;
        if flags.contains(EventFlags::EDGE_TRIGGER) {
            ev_flags |= libc::EV_CLEAR as u16;
        }

        // Drop the filter for any interest bit no longer requested; the
        // fd may never have had it, so these errors are meaningless.
        if !flags.contains(EventFlags::READ) {
            let _ = apply(
                self.kq,
                &[change(
                    fd as usize,
                    libc::EVFILT_READ as i32,
                    libc::EV_DELETE as u16,
                    0,
                )],
            );
        }
        if !flags.contains(EventFlags::WRITE) {
            let _ = apply(
                self.kq,
                &[change(
                    fd as usize,
                    libc::EVFILT_WRITE as i32,
                    libc::EV_DELETE as u16,
                    0,
                )],
            );
        }

        let mut adds = Vec::with_capacity(2);
        if flags.contains(EventFlags::READ) {
            adds.push(change(fd as usize, libc::EVFILT_READ as i32, ev_flags, 0));
        }
        if flags.contains(EventFlags::WRITE) {
            adds.push(change(fd as usize, libc::EVFILT_WRITE as i32, ev_flags, 0));
        }
        apply(self.kq, &adds)
    }

    pub(crate) fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        // One of the two filters may not be registered; ignore that.
        let _ = apply(
            self.kq,
            &[change(
                fd as usize,
                libc::EVFILT_READ as i32,
                libc::EV_DELETE as u16,
                0,
            )],
        );
        let _ = apply(
            self.kq,
            &[change(
                fd as usize,
                libc::EVFILT_WRITE as i32,
                libc::EV_DELETE as u16,
                0,
            )],
        );
        Ok(())
    }

    pub(crate) fn fetch_events(
        &mut self,
        timeout_ms: i64,
        out: &mut Vec<BatchEvent>,
    ) -> io::Result<usize> {
        let ts;
        let ts_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as _,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as _,
            };
            &ts as *const libc::timespec
        };

        let mut events = [change(0, 0, 0, 0); MAX_EVENTS];
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                MAX_EVENTS as _,
                ts_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        out.clear();
        let now = Timestamp::now();
        for ev in events.iter().take(n as usize) {
            if ev.filter as i32 == libc::EVFILT_TIMER as i32 {
                let id = ev.ident as u64;
                if let Some(state) = self.timers.get_mut(&id) {
                    state.next_fire = now.add_ms(state.period_ms as i64);
                }
                out.push(BatchEvent {
                    target: Some(EventTarget::Interval(id)),
                    events: EventFlags::READ,
                    ticks: ev.data as u64,
                });
                continue;
            }

            let mut flags = EventFlags::empty();
            if ev.filter as i32 == libc::EVFILT_READ as i32 {
                flags |= EventFlags::READ;
            }
            if ev.filter as i32 == libc::EVFILT_WRITE as i32 {
                flags |= EventFlags::WRITE;
            }
            if ev.flags as u32 & libc::EV_EOF as u32 != 0 {
                flags |= EventFlags::EOF;
            }
            if ev.flags as u32 & libc::EV_ERROR as u32 != 0 {
                flags |= EventFlags::ERROR;
            }
            out.push(BatchEvent {
                target: Some(EventTarget::Fd(ev.ident as RawFd)),
                events: flags,
                ticks: 0,
            });
        }
        Ok(out.len())
    }

    pub(crate) fn timer_register(&mut self, id: u64, msecs: u32) -> io::Result<()> {
        // EVFILT_TIMER defaults to milliseconds; EV_ADD on an existing
        // ident re-arms it.
        apply(
            self.kq,
            &[change(
                id as usize,
                libc::EVFILT_TIMER as i32,
                libc::EV_ADD as u16,
                msecs as i64,
            )],
        )?;
        self.timers.insert(
            id,
            TimerState {
                period_ms: msecs,
                next_fire: Timestamp::now().add_ms(msecs as i64),
            },
        );
        Ok(())
    }

    pub(crate) fn timer_remove(&mut self, id: u64) -> io::Result<()> {
        if self.timers.remove(&id).is_none() {
            return Ok(());
        }
        let _ = apply(
            self.kq,
            &[change(
                id as usize,
                libc::EVFILT_TIMER as i32,
                libc::EV_DELETE as u16,
                0,
            )],
        );
        Ok(())
    }

    pub(crate) fn timer_next(&mut self, id: u64) -> io::Result<i64> {
        let Some(state) = self.timers.get(&id) else {
            return Ok(-1);
        };
        Ok(state.next_fire.diff_ms(Timestamp::now()).max(0))
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

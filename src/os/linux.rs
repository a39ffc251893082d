//! epoll-based readiness backend for Linux, with timerfd interval timers.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::types::{BatchEvent, EventFlags, EventTarget, MAX_EVENTS};

// High bit of the epoll data word marks interval-timer registrations;
// plain fd registrations carry the fd itself.
const INTERVAL_TAG: u64 = 1 << 63;

pub(crate) struct EpollBackend {
    epfd: RawFd,
    timers: HashMap<u64, RawFd>,
}

impl EpollBackend {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollBackend {
            epfd,
            timers: HashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: data };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        flags: EventFlags,
        registered: bool,
    ) -> io::Result<()> {
        let mut events = libc::EPOLLRDHUP as u32;
        if flags.contains(EventFlags::READ) {
            events |= libc::EPOLLIN as u32;
        }
        if flags.contains(EventFlags::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        if flags.contains(EventFlags::EDGE_TRIGGER) {
            events |= libc::EPOLLET as u32;
        }
        let op = if registered {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, events, fd as u64)
    }

    pub(crate) fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn fetch_events(
        &mut self,
        timeout_ms: i64,
        out: &mut Vec<BatchEvent>,
    ) -> io::Result<usize> {
        let timeout = if timeout_ms < 0 {
            -1
        } else {
            timeout_ms.min(i32::MAX as i64) as libc::c_int
        };
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // An interrupted wait is an empty batch; the run loop will
            // pick up whatever the signal handler left behind.
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        out.clear();
        for ev in events.iter().take(n as usize) {
            let bits = ev.events;
            let data = ev.u64;
            let mut flags = EventFlags::empty();
            if bits & libc::EPOLLIN as u32 != 0 {
                flags |= EventFlags::READ;
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                flags |= EventFlags::WRITE;
            }
            if bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                flags |= EventFlags::ERROR;
            }
            if bits & libc::EPOLLRDHUP as u32 != 0 {
                flags |= EventFlags::EOF;
            }
            if data & INTERVAL_TAG != 0 {
                let id = data & !INTERVAL_TAG;
                out.push(BatchEvent {
                    target: Some(EventTarget::Interval(id)),
                    events: flags,
                    ticks: self.read_expirations(id),
                });
            } else {
                out.push(BatchEvent {
                    target: Some(EventTarget::Fd(data as RawFd)),
                    events: flags,
                    ticks: 0,
                });
            }
        }
        Ok(out.len())
    }

    fn read_expirations(&self, id: u64) -> u64 {
        let Some(&tfd) = self.timers.get(&id) else {
            return 0;
        };
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                tfd,
                &mut count as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if n == mem::size_of::<u64>() as isize {
            count
        } else {
            0
        }
    }

    pub(crate) fn timer_register(&mut self, id: u64, msecs: u32) -> io::Result<()> {
        let tfd = match self.timers.get(&id) {
            Some(&tfd) => tfd,
            None => {
                let tfd = unsafe {
                    libc::timerfd_create(
                        libc::CLOCK_MONOTONIC,
                        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
                    )
                };
                if tfd < 0 {
                    return Err(io::Error::last_os_error());
                }
                if let Err(e) = self.ctl(
                    libc::EPOLL_CTL_ADD,
                    tfd,
                    libc::EPOLLIN as u32,
                    INTERVAL_TAG | id,
                ) {
                    unsafe {
                        libc::close(tfd);
                    }
                    return Err(e);
                }
                self.timers.insert(id, tfd);
                tfd
            }
        };
        let period = ms_to_timespec(msecs);
        let spec = libc::itimerspec {
            it_interval: period,
            it_value: period,
        };
        let rc = unsafe { libc::timerfd_settime(tfd, 0, &spec, ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn timer_remove(&mut self, id: u64) -> io::Result<()> {
        let Some(tfd) = self.timers.remove(&id) else {
            return Ok(());
        };
        let _ = self.remove(tfd);
        unsafe {
            libc::close(tfd);
        }
        Ok(())
    }

    pub(crate) fn timer_next(&mut self, id: u64) -> io::Result<i64> {
        let Some(&tfd) = self.timers.get(&id) else {
            return Ok(-1);
        };
        let mut its: libc::itimerspec = unsafe { mem::zeroed() };
        let rc = unsafe { libc::timerfd_gettime(tfd, &mut its) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(its.it_value.tv_sec as i64 * 1000 + its.it_value.tv_nsec as i64 / 1_000_000)
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        for (_, tfd) in self.timers.drain() {
            unsafe {
                libc::close(tfd);
            }
        }
        unsafe {
            libc::close(self.epfd);
        }
    }
}

fn ms_to_timespec(msecs: u32) -> libc::timespec {
    libc::timespec {
        tv_sec: (msecs / 1000) as libc::time_t,
        tv_nsec: ((msecs % 1000) * 1_000_000) as libc::c_long,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        (fds[0], fds[1])
    }

    #[test]
    fn create_and_drop() {
        let backend = EpollBackend::new().expect("epoll backend");
        drop(backend);
    }

    #[test]
    fn pipe_read_event_carries_fd_and_flags() {
        let mut backend = EpollBackend::new().expect("epoll backend");
        let (read_fd, write_fd) = pipe_pair();
        backend
            .register(read_fd, EventFlags::READ, false)
            .expect("register");

        unsafe {
            libc::write(write_fd, b"ping".as_ptr() as *const _, 4);
        }

        let mut out = Vec::new();
        let n = backend.fetch_events(200, &mut out).expect("fetch");
        assert_eq!(n, 1);
        assert_eq!(out[0].target, Some(EventTarget::Fd(read_fd)));
        assert!(out[0].events.contains(EventFlags::READ));

        backend.remove(read_fd).expect("remove");
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn closed_writer_reports_eof() {
        let mut backend = EpollBackend::new().expect("epoll backend");
        let (read_fd, write_fd) = pipe_pair();
        backend
            .register(read_fd, EventFlags::READ, false)
            .expect("register");
        unsafe {
            libc::close(write_fd);
        }

        let mut out = Vec::new();
        let n = backend.fetch_events(200, &mut out).expect("fetch");
        assert_eq!(n, 1);
        assert!(out[0].events.intersects(EventFlags::EOF | EventFlags::ERROR));

        unsafe {
            libc::close(read_fd);
        }
    }

    #[test]
    fn interval_timer_ticks_and_reports_remaining() {
        let mut backend = EpollBackend::new().expect("epoll backend");
        backend.timer_register(7, 20).expect("timer_register");

        let mut out = Vec::new();
        let n = backend.fetch_events(500, &mut out).expect("fetch");
        assert_eq!(n, 1);
        match out[0].target {
            Some(EventTarget::Interval(7)) => {}
            other => panic!("unexpected target: {other:?}"),
        }
        assert!(out[0].ticks >= 1);

        let next = backend.timer_next(7).expect("timer_next");
        assert!((0..=20).contains(&next), "remaining {next} out of range");

        backend.timer_remove(7).expect("timer_remove");
        assert_eq!(backend.timer_next(7).expect("timer_next"), -1);
    }
}

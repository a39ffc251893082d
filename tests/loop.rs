use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use evloop::{default_backend, Error, EventFlags, EventLoop, Options};

// Signal handlers and the waker bridge are process-wide, so tests that
// build a loop must not overlap.
static LOOP_LOCK: Mutex<()> = Mutex::new(());

fn guard() -> MutexGuard<'static, ()> {
    LOOP_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn new_loop() -> EventLoop {
    EventLoop::new(default_backend()).expect("event loop")
}

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    unsafe {
        assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
    }
    (fds[0], fds[1])
}

fn write_bytes(fd: RawFd, data: &[u8]) {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    assert_eq!(n, data.len() as isize);
}

fn drain_fd(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
    out
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[test]
fn timeouts_fire_in_order_with_fifo_ties() {
    let _g = guard();
    let mut lp = new_loop();

    let order = Rc::new(RefCell::new(Vec::new()));
    let (o1, o2, o3) = (order.clone(), order.clone(), order.clone());
    let a = lp.timeout_create(move |_, _| o1.borrow_mut().push('a'));
    let b = lp.timeout_create(move |_, _| o2.borrow_mut().push('b'));
    let c = lp.timeout_create(move |_, _| o3.borrow_mut().push('c'));

    lp.timeout_set(a, 10).unwrap();
    lp.timeout_set(b, 40).unwrap();
    lp.timeout_set(c, 10).unwrap();

    let ret = lp.run_timeout(25);
    assert_eq!(ret, 0);
    assert_eq!(*order.borrow(), vec!['a', 'c']);
    assert!(lp.timeout_remaining64(b) >= 0, "b must still be pending");

    let ret = lp.run_timeout(60);
    assert_eq!(ret, 0);
    assert_eq!(*order.borrow(), vec!['a', 'c', 'b']);
}

#[test]
fn timeout_errors_and_remaining() {
    let _g = guard();
    let mut lp = new_loop();

    let t = lp.timeout_create(|_, _| {});
    assert!(matches!(lp.timeout_cancel(t), Err(Error::NotPending)));
    assert_eq!(lp.timeout_remaining(t), -1);

    lp.timeout_set(t, 1000).unwrap();
    let rem = lp.timeout_remaining64(t);
    assert!((900..=1000).contains(&rem), "remaining {rem}");
    assert!(matches!(
        lp.timeout_add_at(t, evloop::Timestamp::now()),
        Err(Error::AlreadyPending)
    ));

    lp.timeout_cancel(t).unwrap();
    assert_eq!(lp.timeout_remaining64(t), -1);

    lp.timeout_destroy(t);
    assert!(matches!(lp.timeout_set(t, 1), Err(Error::NotPending)));
}

#[test]
fn timeout_callback_can_rearm_itself() {
    let _g = guard();
    let mut lp = new_loop();

    let count = Rc::new(RefCell::new(0));
    let c = count.clone();
    let t = lp.timeout_create(move |lp, me| {
        let n = {
            let mut c = c.borrow_mut();
            *c += 1;
            *c
        };
        if n < 3 {
            lp.timeout_set(me, 5).unwrap();
        } else {
            lp.end();
        }
    });
    lp.timeout_set(t, 5).unwrap();

    let ret = lp.run_timeout(2000);
    assert_eq!(ret, 0);
    assert_eq!(*count.borrow(), 3);
}

#[test]
fn fd_add_delete_roundtrip_leaves_no_trace() {
    let _g = guard();
    let mut lp = new_loop();
    let (r, w) = pipe_pair();

    lp.fd_add(r, EventFlags::READ, |_, _| {}).unwrap();
    assert!(lp.fd_registered(r));

    lp.fd_delete(r).unwrap();
    assert!(!lp.fd_registered(r));
    // Deleting an unregistered fd is a no-op.
    lp.fd_delete(r).unwrap();

    // Adding with no interest bits is a delete.
    lp.fd_add(r, EventFlags::READ, |_, _| {}).unwrap();
    lp.fd_add(r, EventFlags::empty(), |_, _| {}).unwrap();
    assert!(!lp.fd_registered(r));

    close_fd(r);
    close_fd(w);
}

#[test]
fn fd_hook_sees_adds_and_deletes() {
    let _g = guard();
    let mut lp = new_loop();
    let (r, w) = pipe_pair();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();
    lp.set_fd_hook(move |fd, flags| s.borrow_mut().push((fd, flags)));

    lp.fd_add(r, EventFlags::READ, |_, _| {}).unwrap();
    lp.fd_delete(r).unwrap();
    lp.clear_fd_hook();

    assert_eq!(
        *seen.borrow(),
        vec![(r, EventFlags::READ), (r, EventFlags::empty())]
    );

    close_fd(r);
    close_fd(w);
}

#[test]
fn fd_callback_fires_on_readiness() {
    let _g = guard();
    let mut lp = new_loop();
    let (r, w) = pipe_pair();

    let got = Rc::new(RefCell::new(Vec::new()));
    let g = got.clone();
    lp.fd_add(r, EventFlags::READ, move |lp, ev| {
        assert!(ev.events.contains(EventFlags::READ));
        g.borrow_mut().extend(drain_fd(ev.fd));
        lp.end();
    })
    .unwrap();

    write_bytes(w, b"data");
    let ret = lp.run_timeout(2000);
    assert_eq!(ret, 0);
    assert_eq!(&*got.borrow(), b"data");

    close_fd(r);
    close_fd(w);
}

// An edge-triggered fd made ready again while its callback runs must be
// re-entered through the dispatcher's inner loop, not by recursion.
#[test]
fn edge_triggered_redelivery_uses_inner_loop() {
    let _g = guard();
    let mut lp = new_loop();
    let (r, w) = pipe_pair();

    let state = Rc::new(RefCell::new((0usize, Vec::new())));
    let s = state.clone();
    lp.fd_add(
        r,
        EventFlags::READ | EventFlags::EDGE_TRIGGER,
        move |lp, ev| {
            let calls = {
                let mut s = s.borrow_mut();
                s.0 += 1;
                s.0
            };
            if calls == 1 {
                drain_fd(ev.fd);
                // Make the fd ready again while this callback is on the
                // stack, and give the dispatcher a chance to observe it.
                write_bytes(w, b"more");
                lp.run_timeout(50);
            } else {
                let data = drain_fd(ev.fd);
                s.borrow_mut().1.extend(data);
                lp.end();
            }
        },
    )
    .unwrap();

    write_bytes(w, b"go");
    let ret = lp.run_timeout(2000);
    assert_eq!(ret, 0);

    let state = state.borrow();
    assert_eq!(state.0, 2, "callback must run exactly twice");
    assert_eq!(state.1, b"more");

    close_fd(r);
    close_fd(w);
}

// Scenario: the callback deletes its own registration; no further
// invocations may happen and the run must end at its deadline.
#[test]
fn fd_delete_from_own_callback() {
    let _g = guard();
    let mut lp = new_loop();
    let (r, w) = pipe_pair();

    let count = Rc::new(RefCell::new(0));
    let c = count.clone();
    lp.fd_add(r, EventFlags::READ, move |lp, ev| {
        *c.borrow_mut() += 1;
        lp.fd_delete(ev.fd).unwrap();
    })
    .unwrap();

    write_bytes(w, b"x");
    let started = Instant::now();
    let ret = lp.run_timeout(10);
    assert_eq!(ret, 0);
    assert!(started.elapsed().as_millis() >= 5);
    assert_eq!(*count.borrow(), 1);
    assert!(!lp.fd_registered(r));

    close_fd(r);
    close_fd(w);
}

#[test]
fn forked_child_is_reaped_and_dispatched_once() {
    let _g = guard();
    let mut lp = new_loop();

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        unsafe { libc::_exit(5) };
    }

    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();
    let p = lp.process_add(pid, move |lp, _p, status| {
        s.borrow_mut().push(status);
        lp.end();
    });

    let ret = lp.run_timeout(5000);
    assert_eq!(ret, 0);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1, "callback must fire exactly once");
    let status = seen[0];
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 5);

    // The entry was removed when it fired.
    assert!(matches!(lp.process_delete(p), Err(Error::NotPending)));
}

#[test]
fn signal_subscription_runs_in_loop_context() {
    let _g = guard();
    let mut lp = new_loop();

    let fired = Rc::new(RefCell::new(false));
    let f = fired.clone();
    let sub = lp.signal_add(libc::SIGUSR1, move |lp, _s| {
        // Running here (not in signal context) makes non-async-safe
        // work safe.
        let proof = vec![1u8, 2, 3];
        assert_eq!(proof.len(), 3);
        *f.borrow_mut() = true;
        lp.end();
    });

    let t = lp.timeout_create(|_, _| {
        unsafe { libc::raise(libc::SIGUSR1) };
    });
    lp.timeout_set(t, 5).unwrap();

    let ret = lp.run_timeout(2000);
    assert_eq!(ret, 0);
    assert!(*fired.borrow());

    lp.signal_delete(sub).unwrap();
    // Our handler was installed over SIG_DFL and must be restored.
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe { libc::sigaction(libc::SIGUSR1, std::ptr::null(), &mut sa) };
    assert_eq!(sa.sa_sigaction, libc::SIG_DFL);
}

#[test]
fn coalesced_signals_dispatch_in_ascending_signo_order() {
    let _g = guard();
    let mut lp = new_loop();

    let order = Rc::new(RefCell::new(Vec::new()));
    let (o1, o2) = (order.clone(), order.clone());
    // Subscribed high-signo first; dispatch order must not care.
    let s2 = lp.signal_add(libc::SIGUSR2, move |lp, _| {
        o2.borrow_mut().push(libc::SIGUSR2);
        if o2.borrow().len() == 2 {
            lp.end();
        }
    });
    let s1 = lp.signal_add(libc::SIGUSR1, move |lp, _| {
        o1.borrow_mut().push(libc::SIGUSR1);
        if o1.borrow().len() == 2 {
            lp.end();
        }
    });

    let t = lp.timeout_create(|_, _| {
        unsafe { libc::raise(libc::SIGUSR2) };
        unsafe { libc::raise(libc::SIGUSR1) };
    });
    lp.timeout_set(t, 5).unwrap();

    let ret = lp.run_timeout(2000);
    assert_eq!(ret, 0);
    assert_eq!(*order.borrow(), vec![libc::SIGUSR1, libc::SIGUSR2]);

    lp.signal_delete(s1).unwrap();
    lp.signal_delete(s2).unwrap();
}

#[test]
fn sigint_cancels_and_unwinds_nested_runs() {
    let _g = guard();
    let mut lp = new_loop();

    let observed = Rc::new(RefCell::new(None));
    let obs = observed.clone();
    let t = lp.timeout_create(move |lp, _| {
        unsafe { libc::raise(libc::SIGINT) };
        let started = Instant::now();
        let nested = lp.run_timeout(1000);
        *obs.borrow_mut() = Some((nested, lp.cancelling(), started.elapsed().as_millis()));
    });
    lp.timeout_set(t, 5).unwrap();

    let ret = lp.run_timeout(3000);
    assert_eq!(ret, libc::SIGINT);

    let (nested, cancelling, elapsed) = (*observed.borrow()).expect("callback ran");
    assert_eq!(nested, libc::SIGINT, "nested run returns the signal");
    assert!(cancelling, "cancelling() is visible while still nested");
    assert!(elapsed < 500, "nested run must return immediately");

    assert!(!lp.cancelling(), "not cancelling once fully unwound");
    assert!(lp.cancelled());

    // The loop can be re-entered after a cancellation.
    let ret = lp.run_timeout(10);
    assert_eq!(ret, 0);
}

#[test]
fn end_stops_the_loop_with_status_zero() {
    let _g = guard();
    let mut lp = new_loop();

    let t = lp.timeout_create(|lp, _| lp.end());
    lp.timeout_set(t, 20).unwrap();

    let ret = lp.run();
    assert_eq!(ret, 0);
    assert!(lp.cancelled());
}

#[test]
fn interval_timer_ticks_until_cancelled() {
    let _g = guard();
    let mut lp = new_loop();

    let ticks = Rc::new(RefCell::new(0u64));
    let tk = ticks.clone();
    let i = lp.interval_create(move |lp, _i, n| {
        *tk.borrow_mut() += n;
        if *tk.borrow() >= 2 {
            lp.end();
        }
    });

    assert_eq!(lp.interval_remaining(i), -1);
    lp.interval_set(i, 15).unwrap();
    let rem = lp.interval_remaining(i);
    assert!((0..=15).contains(&rem), "remaining {rem}");

    let ret = lp.run_timeout(5000);
    assert_eq!(ret, 0);
    assert!(*ticks.borrow() >= 2);

    lp.interval_cancel(i).unwrap();
    assert!(matches!(lp.interval_cancel(i), Err(Error::NotPending)));
    lp.interval_destroy(i);
}

#[test]
fn teardown_restores_handlers_and_permits_reinit() {
    let _g = guard();

    {
        let lp = new_loop();
        let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
        unsafe { libc::sigaction(libc::SIGINT, std::ptr::null(), &mut sa) };
        assert_ne!(sa.sa_sigaction, libc::SIG_DFL, "handler installed");
        drop(lp);
    }

    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe { libc::sigaction(libc::SIGINT, std::ptr::null(), &mut sa) };
    assert_eq!(sa.sa_sigaction, libc::SIG_DFL, "handler restored");

    // init after done must succeed and still dispatch.
    let mut lp = new_loop();
    let t = lp.timeout_create(|lp, _| lp.end());
    lp.timeout_set(t, 5).unwrap();
    assert_eq!(lp.run_timeout(1000), 0);
}

#[test]
fn sigchld_handling_can_be_disabled() {
    let _g = guard();

    let lp = EventLoop::with_options(Options {
        backend: default_backend(),
        handle_sigchld: false,
    })
    .expect("event loop");

    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe { libc::sigaction(libc::SIGCHLD, std::ptr::null(), &mut sa) };
    assert_eq!(sa.sa_sigaction, libc::SIG_DFL, "no SIGCHLD handler");

    drop(lp);
}

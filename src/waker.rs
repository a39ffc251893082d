use std::io;
use std::os::unix::io::RawFd;

/// The self-pipe that turns async signal delivery into fd readiness.
/// Signal handlers write one byte per signal number to `write_fd`; the
/// loop registers `read_fd` and drains it from dispatch context.
pub(crate) struct WakerPipe {
    pub(crate) read_fd: RawFd,
    pub(crate) write_fd: RawFd,
}

impl WakerPipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for &fd in &fds {
            if let Err(e) = init_waker_fd(fd) {
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(e);
            }
        }
        Ok(WakerPipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub(crate) fn close(&mut self) {
        for fd in [self.read_fd, self.write_fd] {
            if fd >= 0 {
                unsafe {
                    libc::close(fd);
                }
            }
        }
        self.read_fd = -1;
        self.write_fd = -1;
    }
}

impl Drop for WakerPipe {
    fn drop(&mut self) {
        self.close();
    }
}

fn init_waker_fd(fd: RawFd) -> io::Result<()> {
    unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFD);
        if fl < 0 || libc::fcntl(fd, libc::F_SETFD, fl | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    set_nonblocking(fd)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFL);
        if fl < 0 || libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_ends_are_nonblocking() {
        let pipe = WakerPipe::new().expect("pipe");
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(pipe.read_fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(n, -1);
        assert_eq!(
            io::Error::last_os_error().raw_os_error(),
            Some(libc::EAGAIN)
        );
    }

    #[test]
    fn bytes_round_trip() {
        let pipe = WakerPipe::new().expect("pipe");
        let byte = [17u8];
        let n = unsafe { libc::write(pipe.write_fd, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(pipe.read_fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(n, 1);
        assert_eq!(buf[0], 17);
    }
}

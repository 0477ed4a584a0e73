use nix::libc;
use std::io;
use std::os::fd::RawFd;

/// One pipe pair. The read and write ends stay open together for the life
/// of the owning thread object and are closed on drop.
#[derive(Debug)]
pub(crate) struct Pipe {
    pub(crate) read_fd: RawFd,
    pub(crate) write_fd: RawFd,
}

impl Pipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [-1; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            if self.read_fd >= 0 {
                libc::close(self.read_fd);
            }
            if self.write_fd >= 0 {
                libc::close(self.write_fd);
            }
        }
    }
}

/// Read exactly `buf.len()` bytes. EINTR is retried, a partial read resumes
/// where it left off, and end of file is reported as EPIPE since it means
/// the peer closed the command channel.
pub(crate) fn read_exact(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if n == 0 {
            return Err(io::Error::from_raw_os_error(libc::EPIPE));
        }
        done += n as usize;
    }
    Ok(())
}

pub(crate) fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = unsafe {
            libc::write(
                fd,
                buf[done..].as_ptr() as *const libc::c_void,
                buf.len() - done,
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        done += n as usize;
    }
    Ok(())
}

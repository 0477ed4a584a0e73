use crate::config::POLLFDS_INITIAL;
use nix::libc;
use std::os::fd::RawFd;
use std::ptr;

fn empty_pollfd() -> libc::pollfd {
    libc::pollfd {
        fd: -1,
        events: 0,
        revents: 0,
    }
}

/// The fd set handed to ppoll. Capacity grows by doubling; a failed `add`
/// reports the growth so the caller can rebuild the set from scratch
/// against the enlarged array.
#[derive(Debug)]
pub(crate) struct PollSet {
    fds: Vec<libc::pollfd>,
    used: usize,
}

impl PollSet {
    pub(crate) fn new() -> Self {
        Self {
            fds: vec![empty_pollfd(); POLLFDS_INITIAL],
            used: 0,
        }
    }

    /// Start a fresh set with the command fd pinned at index 0.
    pub(crate) fn reset(&mut self, cmd_fd: RawFd) {
        self.fds[0] = libc::pollfd {
            fd: cmd_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        self.used = 1;
    }

    /// Append an fd, or grow and return None so the caller restarts.
    pub(crate) fn add(&mut self, fd: RawFd, write: bool) -> Option<usize> {
        if self.used >= self.fds.len() {
            self.fds.resize(self.fds.len() * 2, empty_pollfd());
            return None;
        }
        self.fds[self.used] = libc::pollfd {
            fd,
            events: if write { libc::POLLOUT } else { libc::POLLIN },
            revents: 0,
        };
        self.used += 1;
        Some(self.used - 1)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.used
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.fds.len()
    }

    pub(crate) fn revents(&self, idx: usize) -> libc::c_short {
        self.fds[idx].revents
    }

    /// ppoll over the current set. `timeout` of None blocks until an fd is
    /// ready. Returns the raw ppoll result; callers treat anything `<= 0`
    /// as a no-op wake.
    pub(crate) fn poll(&mut self, timeout: Option<&libc::timespec>) -> i32 {
        let ts_ptr = timeout.map_or(ptr::null(), |ts| ts as *const libc::timespec);
        unsafe {
            libc::ppoll(
                self.fds.as_mut_ptr(),
                self.used as libc::nfds_t,
                ts_ptr,
                ptr::null(),
            )
        }
    }
}

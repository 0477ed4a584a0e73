use crate::event_log::{Event, EventLog};
use crate::poll::PollSet;
use nix::libc;
use std::os::fd::RawFd;
use std::sync::{Mutex, OnceLock};

type ThreadCallback = Box<dyn FnMut() + Send>;

struct FdCallback {
    fd: RawFd,
    write: bool,
    enabled: bool,
    /// Index in the pollfd set for the current loop iteration.
    poll_idx: Option<usize>,
    /// Taken out while the callback runs so the registry lock is not held
    /// across user code.
    cb: Option<ThreadCallback>,
}

/// Process-wide list of external fds the audio loop waits on. External
/// subsystems register here and the single audio worker polls and
/// dispatches; entries are looked up by fd.
fn registry() -> &'static Mutex<Vec<FdCallback>> {
    static REG: OnceLock<Mutex<Vec<FdCallback>>> = OnceLock::new();
    REG.get_or_init(|| Mutex::new(Vec::new()))
}

fn add(fd: RawFd, write: bool, cb: ThreadCallback) {
    let mut reg = registry().lock().expect("callback registry poisoned");
    if reg.iter().any(|entry| entry.fd == fd) {
        return;
    }
    reg.push(FdCallback {
        fd,
        write,
        enabled: true,
        poll_idx: None,
        cb: Some(cb),
    });
}

/// Invoke `cb` whenever `fd` becomes readable.
pub fn add_callback(fd: RawFd, cb: impl FnMut() + Send + 'static) {
    add(fd, false, Box::new(cb));
}

/// Invoke `cb` whenever `fd` becomes writable.
pub fn add_write_callback(fd: RawFd, cb: impl FnMut() + Send + 'static) {
    add(fd, true, Box::new(cb));
}

/// Keep the entry but skip it when building the poll set.
pub fn enable_callback(fd: RawFd, enabled: bool) {
    let mut reg = registry().lock().expect("callback registry poisoned");
    if let Some(entry) = reg.iter_mut().find(|entry| entry.fd == fd) {
        entry.enabled = enabled;
    }
}

/// Drop the entry for `fd`. Safe against the audio loop only when called
/// from the loop itself; other threads go through the REMOVE_CALLBACK
/// command so removal is serialized with dispatch.
pub fn rm_callback(fd: RawFd) {
    let mut reg = registry().lock().expect("callback registry poisoned");
    reg.retain(|entry| entry.fd != fd);
}

/// Add every enabled entry to the poll set, remembering its slot for
/// dispatch. False means the set grew and the build must restart.
pub(crate) fn arm(set: &mut PollSet) -> bool {
    let mut reg = registry().lock().expect("callback registry poisoned");
    for entry in reg.iter_mut() {
        entry.poll_idx = None;
        if !entry.enabled {
            continue;
        }
        match set.add(entry.fd, entry.write) {
            Some(idx) => entry.poll_idx = Some(idx),
            None => return false,
        }
    }
    true
}

/// Run every armed callback whose fd fired and return how many ran. The
/// callback is taken out of its entry before invocation, so a callback may
/// add, remove, or toggle registry entries without deadlocking.
pub(crate) fn dispatch(set: &PollSet, log: &mut EventLog) -> usize {
    let mut ran = 0;
    loop {
        let ready = {
            let mut reg = registry().lock().expect("callback registry poisoned");
            reg.iter_mut().find_map(|entry| {
                let idx = entry.poll_idx?;
                if set.revents(idx) & (libc::POLLIN | libc::POLLOUT) == 0 {
                    return None;
                }
                entry.poll_idx = None;
                let cb = entry.cb.take()?;
                Some((entry.fd, entry.write, cb))
            })
        };
        let Some((fd, write, mut cb)) = ready else {
            return ran;
        };
        log.log(Event::IodevCallback, write as u32, 0, 0);
        cb();
        ran += 1;
        let mut reg = registry().lock().expect("callback registry poisoned");
        if let Some(entry) = reg.iter_mut().find(|entry| entry.fd == fd) {
            if entry.cb.is_none() {
                entry.cb = Some(cb);
            }
        }
        // Entry removed while running: the callback is dropped with it.
    }
}

use nix::libc;

/// Set to enable the once-per-second wake profile line from the audio loop.
pub const WAKE_PROFILE_ENV: &str = "CADENZA_WAKE_PROFILE";

pub(crate) const WORKER_THREAD_NAME: &str = "cadenza-audio";

#[cfg(unix)]
pub(crate) const RT_POLICY: i32 = libc::SCHED_FIFO;
pub(crate) const RT_PRIORITY: i32 = 12;

/// Upper bound on one ppoll sleep so idle maintenance still runs.
pub(crate) const WAKE_CEILING_SECS: i64 = 20;

/// Consecutive zero-length sleeps before the monitor is told about a busyloop.
pub(crate) const MAX_CONTINUOUS_ZERO_SLEEP: u32 = 2;

pub(crate) const POLLFDS_INITIAL: usize = 32;

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

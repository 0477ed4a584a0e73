use nix::libc;

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

pub fn ts_zero() -> libc::timespec {
    libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    }
}

/// Current CLOCK_MONOTONIC_RAW time. All scheduler timestamps use this clock
/// so rate estimation elsewhere is not disturbed by NTP slewing.
pub fn now_raw() -> libc::timespec {
    let mut now = ts_zero();
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut now);
    }
    now
}

pub fn ts_is_zero(ts: &libc::timespec) -> bool {
    ts.tv_sec == 0 && ts.tv_nsec == 0
}

/// True when `a` is strictly later than `b`.
pub fn ts_after(a: &libc::timespec, b: &libc::timespec) -> bool {
    a.tv_sec > b.tv_sec || (a.tv_sec == b.tv_sec && a.tv_nsec > b.tv_nsec)
}

pub fn ts_add(a: &libc::timespec, b: &libc::timespec) -> libc::timespec {
    let mut out = libc::timespec {
        tv_sec: a.tv_sec + b.tv_sec,
        tv_nsec: a.tv_nsec + b.tv_nsec,
    };
    if out.tv_nsec >= NSEC_PER_SEC {
        out.tv_sec += 1;
        out.tv_nsec -= NSEC_PER_SEC;
    }
    out
}

/// `a - b`, saturating at zero when `b` is later than `a`.
pub fn ts_sub(a: &libc::timespec, b: &libc::timespec) -> libc::timespec {
    if !ts_after(a, b) {
        return ts_zero();
    }
    let mut out = libc::timespec {
        tv_sec: a.tv_sec - b.tv_sec,
        tv_nsec: a.tv_nsec - b.tv_nsec,
    };
    if out.tv_nsec < 0 {
        out.tv_sec -= 1;
        out.tv_nsec += NSEC_PER_SEC;
    }
    out
}

pub fn frames_to_ms(frames: usize, frame_rate: u32) -> u64 {
    if frame_rate == 0 {
        return 0;
    }
    frames as u64 * 1000 / frame_rate as u64
}

use crate::callback;
use crate::config::{self, MAX_CONTINUOUS_ZERO_SLEEP, WAKE_CEILING_SECS, WAKE_PROFILE_ENV};
use crate::debug::{AudioDebugInfo, MAX_DEBUG_DEVS, MAX_DEBUG_STREAMS};
use crate::device::{Device, Direction, OpenDev, RampRequest, find_open_dev, remove_stream};
use crate::dev_stream::DevStream;
use crate::event_log::{Event, EventLog};
use crate::io::{DevIo, Monitor};
use crate::message::{self, Command, MAX_MSG_LEN};
use crate::pipe;
use crate::poll::PollSet;
use crate::stream::Stream;
use crate::time::{frames_to_ms, now_raw, ts_add, ts_after, ts_is_zero, ts_sub, ts_zero};
use nix::libc;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

fn lock_memory_pages() -> Result<(), String> {
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc == 0 {
        Ok(())
    } else {
        Err(format!(
            "mlockall(MCL_CURRENT|MCL_FUTURE) failed: {}",
            io::Error::last_os_error()
        ))
    }
}

fn request_rt_priority() -> Result<(), String> {
    let thread = unsafe { libc::pthread_self() };
    let param = unsafe {
        let mut p = std::mem::zeroed::<libc::sched_param>();
        p.sched_priority = config::RT_PRIORITY;
        p
    };
    let rc = unsafe { libc::pthread_setschedparam(thread, config::RT_POLICY, &param) };
    if rc != 0 {
        return Err(format!(
            "pthread_setschedparam(prio {}) failed with errno {}",
            config::RT_PRIORITY,
            rc
        ));
    }
    Ok(())
}

const PROFILE_INTERVAL: Duration = Duration::from_secs(1);

/// Once-per-second loop statistics, enabled with CADENZA_WAKE_PROFILE.
#[derive(Debug)]
struct WakeProfiler {
    report_at: Instant,
    wakes: u64,
    commands: u64,
    callbacks: u64,
    zero_sleeps: u64,
    timed_sleeps: u64,
    sleep_ns: u128,
}

impl WakeProfiler {
    fn new() -> Self {
        Self {
            report_at: Instant::now() + PROFILE_INTERVAL,
            wakes: 0,
            commands: 0,
            callbacks: 0,
            zero_sleeps: 0,
            timed_sleeps: 0,
            sleep_ns: 0,
        }
    }

    fn note_sleep(&mut self, wait_ts: Option<&libc::timespec>) {
        match wait_ts {
            Some(ts) if ts_is_zero(ts) => self.zero_sleeps += 1,
            Some(ts) => {
                self.timed_sleeps += 1;
                self.sleep_ns += ts.tv_sec as u128 * 1_000_000_000 + ts.tv_nsec as u128;
            }
            None => {}
        }
    }

    fn note_wake(&mut self, commands: u64, callbacks: u64) {
        self.wakes += 1;
        self.commands += commands;
        self.callbacks += callbacks;
    }

    fn maybe_report(&mut self) {
        let now = Instant::now();
        if now < self.report_at {
            return;
        }
        let sleep_avg_us = if self.timed_sleeps > 0 {
            (self.sleep_ns / self.timed_sleeps as u128) as f64 / 1_000.0
        } else {
            0.0
        };
        debug!(
            "wake profile: wakes={} commands={} callbacks={} zero_sleeps={} sleep_avg_us={:.1}",
            self.wakes, self.commands, self.callbacks, self.zero_sleeps, sleep_avg_us
        );
        self.report_at = now + PROFILE_INTERVAL;
        self.wakes = 0;
        self.commands = 0;
        self.callbacks = 0;
        self.zero_sleeps = 0;
        self.timed_sleeps = 0;
        self.sleep_ns = 0;
    }
}

/// State owned by the audio worker thread. Nothing in here is touched from
/// any other thread; the command pipe is the only way in.
pub(crate) struct Worker {
    cmd_fd: RawFd,
    rsp_fd: RawFd,
    open_devs: [Vec<OpenDev>; 2],
    pollfds: PollSet,
    remix: Option<Box<dyn crate::io::RemixConverter>>,
    dev_io: Box<dyn DevIo>,
    monitor: Box<dyn Monitor>,
    log: EventLog,
    last_wake: Option<libc::timespec>,
    longest_wake: libc::timespec,
    zero_sleep_count: u32,
    profiler: Option<WakeProfiler>,
}

impl Worker {
    pub(crate) fn new(
        cmd_fd: RawFd,
        rsp_fd: RawFd,
        dev_io: Box<dyn DevIo>,
        monitor: Box<dyn Monitor>,
    ) -> Self {
        Self {
            cmd_fd,
            rsp_fd,
            open_devs: [Vec::new(), Vec::new()],
            pollfds: PollSet::new(),
            remix: None,
            dev_io,
            monitor,
            log: EventLog::new(),
            last_wake: None,
            longest_wake: ts_zero(),
            zero_sleep_count: 0,
            profiler: config::env_flag(WAKE_PROFILE_ENV).then(WakeProfiler::new),
        }
    }

    /// The audio loop. Sleeps while devices play or capture, waking as
    /// little as it can without risking an underrun. Command messages and
    /// registered fds also wake it.
    pub(crate) fn run(mut self) {
        if let Err(e) = lock_memory_pages() {
            error!("audio worker memory lock not enabled: {e}");
        }
        if let Err(e) = request_rt_priority() {
            error!("audio worker realtime priority not enabled: {e}");
        }

        loop {
            {
                let [odevs, idevs] = &mut self.open_devs;
                self.dev_io.run(odevs, idevs, self.remix.as_deref());
            }

            let mut ts = ts_zero();
            let contributors = self.fill_next_sleep_interval(&mut ts);
            let wait_ts = (contributors > 0).then_some(ts);

            self.build_pollfds();

            if let Some(last) = self.last_wake {
                let awake = ts_sub(&now_raw(), &last);
                if ts_after(&awake, &self.longest_wake) {
                    self.longest_wake = awake;
                }
            }

            let (sec, nsec) = wait_ts.map_or((0, 0), |ts| (ts.tv_sec as u32, ts.tv_nsec as u32));
            self.log
                .log(Event::Sleep, sec, nsec, self.longest_wake.tv_nsec as u32);
            if let Some(ts) = &wait_ts {
                self.check_busyloop(ts);
            }
            if let Some(p) = &mut self.profiler {
                p.note_sleep(wait_ts.as_ref());
            }

            let rc = self.pollfds.poll(wait_ts.as_ref());
            self.last_wake = Some(now_raw());
            self.log.log(Event::Wake, rc as u32, 0, 0);
            if rc <= 0 {
                if let Some(p) = &mut self.profiler {
                    p.note_wake(0, 0);
                    p.maybe_report();
                }
                continue;
            }

            let mut commands = 0;
            if self.pollfds.revents(0) & libc::POLLIN != 0 {
                commands = 1;
                match self.handle_command() {
                    Ok(false) => {}
                    Ok(true) => {
                        debug!("audio worker stopping");
                        return;
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {
                        error!("command pipe closed, audio worker exiting: {e}");
                        return;
                    }
                    Err(e) => error!("command handling failed: {e}"),
                }
            }

            let callbacks = callback::dispatch(&self.pollfds, &mut self.log);
            if let Some(p) = &mut self.profiler {
                p.note_wake(commands, callbacks as u64);
                p.maybe_report();
            }
        }
    }

    /// Earliest of every stream callback time and every device wake across
    /// both directions, as a relative timeout. Zero contributors means
    /// nothing is scheduled and the caller should block on fds alone.
    fn fill_next_sleep_interval(&mut self, ts: &mut libc::timespec) -> usize {
        let now = now_raw();
        let ceiling = libc::timespec {
            tv_sec: WAKE_CEILING_SECS,
            tv_nsec: 0,
        };
        let mut min_ts = ts_add(&ceiling, &now);
        let mut contributors = self.next_output_wake(&mut min_ts);
        {
            let [_, idevs] = &mut self.open_devs;
            contributors += self.dev_io.next_input_wake(idevs, &mut min_ts);
        }
        *ts = ts_sub(&min_ts, &now);
        contributors
    }

    fn next_output_wake(&mut self, min_ts: &mut libc::timespec) -> usize {
        let mut contributors = 0;
        let [odevs, _] = &self.open_devs;
        for adev in odevs {
            for ds in &adev.streams {
                if ds.stream.is_draining() && ds.stream.queued_frames() <= 0 {
                    continue;
                }
                if !ds.stream.can_fetch() {
                    continue;
                }
                let Some(cb_ts) = ds.next_cb_ts else { continue };
                self.log.log(
                    Event::StreamSleepTime,
                    ds.stream.id(),
                    cb_ts.tv_sec as u32,
                    cb_ts.tv_nsec as u32,
                );
                if ts_after(min_ts, &cb_ts) {
                    *min_ts = cb_ts;
                }
                contributors += 1;
            }
        }
        for adev in odevs {
            if !adev.dev.should_wake() {
                continue;
            }
            contributors += 1;
            if ts_after(min_ts, &adev.wake_ts) {
                *min_ts = adev.wake_ts;
            }
        }
        contributors
    }

    /// Rebuild the fd set: command pipe first, then registered callbacks,
    /// then stream wake fds, output before input. A growth during the build
    /// restarts it so the final attempt is built against one array.
    fn build_pollfds(&mut self) {
        'rebuild: loop {
            self.pollfds.reset(self.cmd_fd);
            if !callback::arm(&mut self.pollfds) {
                continue 'rebuild;
            }
            for dir in [Direction::Output, Direction::Input] {
                for adev in &self.open_devs[dir.idx()] {
                    for ds in &adev.streams {
                        let Some(fd) = ds.wake_fd() else { continue };
                        if self.pollfds.add(fd, false).is_none() {
                            continue 'rebuild;
                        }
                    }
                }
            }
            return;
        }
    }

    fn check_busyloop(&mut self, wait_ts: &libc::timespec) {
        if ts_is_zero(wait_ts) {
            self.zero_sleep_count += 1;
            if self.zero_sleep_count == MAX_CONTINUOUS_ZERO_SLEEP {
                self.monitor.busyloop();
            }
        } else {
            self.zero_sleep_count = 0;
        }
    }

    /// Read and execute one command, then acknowledge it. Stop is special:
    /// the acknowledgement goes out first, then the loop ends.
    fn handle_command(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; MAX_MSG_LEN];
        let len = message::read_frame(self.cmd_fd, &mut buf)?;
        let frame = &buf[..len];
        self.log.log(Event::Command, message::frame_id(frame), 0, 0);

        let cmd = match message::decode(frame) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.send_status(-e.raw_os_error().unwrap_or(libc::EINVAL))?;
                return Ok(false);
            }
        };

        match cmd {
            Command::Stop => {
                self.send_status(0)?;
                Ok(true)
            }
            Command::ConfigGlobalRemix(conv) => {
                // The displaced converter goes back to the caller, which
                // owns it from here on.
                let old = std::mem::replace(&mut self.remix, conv);
                self.send_ptr(message::remix_response(old))?;
                Ok(false)
            }
            cmd => {
                let rc = self.exec(cmd);
                if rc < 0 {
                    debug!("command returned {rc}");
                }
                self.send_status(rc)?;
                Ok(false)
            }
        }
    }

    fn exec(&mut self, cmd: Command) -> i32 {
        match cmd {
            Command::AddOpenDev(dev) => self.add_open_dev(dev),
            Command::RmOpenDev(dev) => self.rm_open_dev(&dev),
            Command::IsDevOpen(dev) => self.is_dev_open(&dev),
            Command::AddStream { stream, devs } => {
                self.log.log(Event::WriteStreamsWait, stream.id(), 0, 0);
                self.add_stream(&stream, &devs)
            }
            Command::DisconnectStream { stream, dev } => {
                self.disconnect_stream(&stream, dev.as_ref())
            }
            Command::DrainStream(stream) => self.drain_stream(&stream),
            Command::DevStartRamp { dev, request } => self.dev_start_ramp(&dev, request),
            Command::DumpThreadInfo(info) => {
                // SAFETY: the pointer is the controller's own snapshot
                // buffer and the controller blocks until our response, so
                // nothing else touches it now.
                self.dump_thread_info(unsafe { &mut *info });
                0
            }
            Command::AecDump {
                stream_id,
                start,
                fd,
            } => self.set_aec_dump(stream_id, start, fd),
            Command::RemoveCallback(fd) => {
                callback::rm_callback(fd);
                0
            }
            Command::Stop | Command::ConfigGlobalRemix(_) => -libc::EINVAL,
        }
    }

    fn send_status(&self, rc: i32) -> io::Result<()> {
        pipe::write_all(self.rsp_fd, &rc.to_ne_bytes())
    }

    fn send_ptr(&self, raw: u64) -> io::Result<()> {
        pipe::write_all(self.rsp_fd, &raw.to_ne_bytes())
    }

    fn add_open_dev(&mut self, dev: Arc<dyn Device>) -> i32 {
        let dir = dev.direction();
        if find_open_dev(&self.open_devs[dir.idx()], &dev).is_some() {
            return -libc::EEXIST;
        }
        if dir == Direction::Output {
            // Pad the playback buffer so the device does not open with a
            // burst of stream callbacks.
            if let Err(e) = dev.fill_zeros(dev.min_buffer_level()) {
                error!("prefill of device {} failed: {e}", dev.idx());
            }
        }
        self.log.log(Event::DevAdded, dev.idx(), 0, 0);
        self.open_devs[dir.idx()].push(OpenDev::new(dev));
        0
    }

    fn rm_open_dev(&mut self, dev: &Arc<dyn Device>) -> i32 {
        let list = &mut self.open_devs[dev.direction().idx()];
        match find_open_dev(list, dev) {
            Some(i) => {
                list.remove(i);
                0
            }
            None => -libc::EINVAL,
        }
    }

    fn is_dev_open(&self, dev: &Arc<dyn Device>) -> i32 {
        find_open_dev(&self.open_devs[dev.direction().idx()], dev).is_some() as i32
    }

    fn dev_start_ramp(&mut self, dev: &Arc<dyn Device>, request: RampRequest) -> i32 {
        if find_open_dev(&self.open_devs[dev.direction().idx()], dev).is_none() {
            return -libc::EINVAL;
        }
        match dev.start_ramp(request) {
            Ok(()) => 0,
            Err(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    fn add_stream(&mut self, stream: &Arc<dyn Stream>, devs: &[Arc<dyn Device>]) -> i32 {
        let rc = self.append_stream(stream, devs);
        if rc < 0 {
            return rc;
        }
        self.log.log(
            Event::StreamAdded,
            stream.id(),
            devs.first().map_or(0, |d| d.idx()),
            devs.len() as u32,
        );
        0
    }

    fn append_stream(&mut self, stream: &Arc<dyn Stream>, devs: &[Arc<dyn Device>]) -> i32 {
        let dir = stream.direction();
        let mut rc = 0;
        for dev in devs {
            let list = &mut self.open_devs[dir.idx()];
            let Some(di) = find_open_dev(list, dev) else {
                continue;
            };
            let adev = &mut list[di];
            if adev.has_stream(stream) {
                continue;
            }

            // A new output stream on a busy device aligns with the earliest
            // callback already scheduled there. Fetching it immediately
            // stacks up the buffer level; scheduling it past the existing
            // wakes depresses the hardware level.
            let mut init_cb_ts = None;
            if dir == Direction::Output {
                for ds in &adev.streams {
                    if let Some(ts) = ds.next_cb_ts
                        && init_cb_ts.is_none_or(|cur| ts_after(&cur, &ts))
                    {
                        init_cb_ts = Some(ts);
                    }
                }
            }
            let init_cb_ts = init_cb_ts.unwrap_or_else(now_raw);

            let mut ds = match DevStream::new(
                stream.clone(),
                adev.dev.idx(),
                adev.dev.format(),
                init_cb_ts,
            ) {
                Ok(ds) => ds,
                Err(e) => {
                    rc = -e.raw_os_error().unwrap_or(libc::EINVAL);
                    break;
                }
            };

            if dir == Direction::Input && adev.streams.is_empty() {
                // First capture stream on the device: flush so reads across
                // multiple devices start from one buffer level.
                if let Err(e) = adev.dev.flush_buffer() {
                    rc = -e.raw_os_error().unwrap_or(libc::EIO);
                    break;
                }
            }

            if dir == Direction::Input && !adev.streams.is_empty() {
                // Later capture streams copy the first stream's offsets,
                // clamped to their own callback threshold, so multi-device
                // read positions stay satisfiable by every device.
                let first = &adev.streams[0];
                let threshold = stream.cb_threshold();
                ds.written_offset = first.written_offset.min(threshold);
                let offset = first.stream.dev_offset(adev.dev.idx()).min(threshold);
                stream.update_dev_offset(adev.dev.idx(), offset);
            }

            adev.dev.stream_added(stream.as_ref());
            adev.streams.push(ds);
        }

        if rc != 0 {
            // Undo every attachment this command made.
            remove_stream(&mut self.open_devs[dir.idx()], stream, None);
        }
        rc
    }

    fn find_stream(&self, stream: &Arc<dyn Stream>) -> bool {
        self.open_devs[stream.direction().idx()]
            .iter()
            .any(|adev| adev.has_stream(stream))
    }

    fn disconnect_stream(&mut self, stream: &Arc<dyn Stream>, dev: Option<&Arc<dyn Device>>) -> i32 {
        if !self.find_stream(stream) {
            return 0;
        }
        remove_stream(&mut self.open_devs[stream.direction().idx()], stream, dev);
        0
    }

    /// Zero means the stream is gone and the caller must not reference it
    /// again; anything else is milliseconds until its samples run out.
    fn drain_stream(&mut self, stream: &Arc<dyn Stream>) -> i32 {
        if !self.find_stream(stream) {
            return 0;
        }
        let ms_left = drain_ms_remaining(stream);
        if ms_left == 0 {
            remove_stream(&mut self.open_devs[stream.direction().idx()], stream, None);
        }
        ms_left
    }

    fn set_aec_dump(&mut self, stream_id: u32, start: bool, fd: RawFd) -> i32 {
        for adev in &self.open_devs[Direction::Input.idx()] {
            if !adev.dev.is_open() {
                continue;
            }
            for ds in &adev.streams {
                let Some(apm) = ds.stream.apm() else { continue };
                if ds.stream.id() != stream_id {
                    continue;
                }
                if let Err(e) = apm.set_aec_dump(adev.dev.idx(), start, fd) {
                    error!("aec dump on stream {stream_id}: {e}");
                }
            }
        }
        0
    }

    fn dump_thread_info(&mut self, info: &mut AudioDebugInfo) {
        info.clear();
        for dir in [Direction::Output, Direction::Input] {
            for adev in &self.open_devs[dir.idx()] {
                if info.devs.len() == MAX_DEBUG_DEVS {
                    break;
                }
                info.push_dev(adev);
                for ds in &adev.streams {
                    if info.streams.len() == MAX_DEBUG_STREAMS {
                        break;
                    }
                    info.push_stream(ds);
                }
            }
        }
        info.copy_log(&self.log);
        self.longest_wake = ts_zero();
    }
}

fn drain_ms_remaining(stream: &Arc<dyn Stream>) -> i32 {
    if stream.direction() != Direction::Output {
        return 0;
    }
    let frames = stream.queued_frames();
    if frames <= 0 {
        return 0;
    }
    stream.set_draining(true);
    1 + frames_to_ms(frames as usize, stream.format().frame_rate) as i32
}

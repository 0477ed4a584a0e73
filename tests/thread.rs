//! End-to-end tests driving the public API against fake devices, streams,
//! and I/O collaborators.

use cadenza::libc;
use cadenza::{
    Apm, AudioDebugInfo, AudioThread, DevIo, Device, Direction, Format, Monitor, OpenDev,
    RampRequest, RemixConverter, Stream, StreamType, add_callback, enable_callback,
};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// The fd-callback registry is process wide, and every test spawns a worker
/// that polls it, so tests run one at a time.
fn serialize() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

struct TestDevice {
    idx: u32,
    direction: Direction,
    filled_zeros: AtomicUsize,
    flushes: AtomicUsize,
    ramps: Mutex<Vec<RampRequest>>,
}

impl TestDevice {
    fn new(idx: u32, direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            idx,
            direction,
            filled_zeros: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            ramps: Mutex::new(Vec::new()),
        })
    }
}

impl Device for TestDevice {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn idx(&self) -> u32 {
        self.idx
    }

    fn name(&self) -> String {
        format!("test-{}", self.idx)
    }

    fn buffer_size(&self) -> usize {
        8192
    }

    fn min_buffer_level(&self) -> usize {
        1600
    }

    fn min_cb_level(&self) -> usize {
        480
    }

    fn max_cb_level(&self) -> usize {
        4096
    }

    fn format(&self) -> Option<Format> {
        Some(Format::new(48_000, 2))
    }

    fn highest_hw_level(&self) -> usize {
        2048
    }

    fn num_underruns(&self) -> u32 {
        0
    }

    fn num_severe_underruns(&self) -> u32 {
        0
    }

    fn est_rate_ratio(&self) -> f64 {
        1.0
    }

    fn is_open(&self) -> bool {
        true
    }

    fn fill_zeros(&self, frames: usize) -> io::Result<()> {
        self.filled_zeros.fetch_add(frames, Ordering::SeqCst);
        Ok(())
    }

    fn flush_buffer(&self) -> io::Result<usize> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    fn start_ramp(&self, request: RampRequest) -> io::Result<()> {
        self.ramps.lock().expect("ramps").push(request);
        Ok(())
    }

    fn should_wake(&self) -> bool {
        false
    }

    fn stream_added(&self, _stream: &dyn Stream) {}

    fn stream_removed(&self, _stream: &dyn Stream) {}
}

struct TestStream {
    id: u32,
    direction: Direction,
    cb_threshold: usize,
    queued: AtomicI64,
    draining: AtomicBool,
    offsets: Mutex<HashMap<u32, usize>>,
}

impl TestStream {
    fn new(id: u32, direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            id,
            direction,
            cb_threshold: 512,
            queued: AtomicI64::new(0),
            draining: AtomicBool::new(false),
            offsets: Mutex::new(HashMap::new()),
        })
    }
}

impl Stream for TestStream {
    fn id(&self) -> u32 {
        self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Multimedia
    }

    fn format(&self) -> Format {
        Format::new(48_000, 2)
    }

    fn buffer_frames(&self) -> usize {
        2048
    }

    fn cb_threshold(&self) -> usize {
        self.cb_threshold
    }

    fn queued_frames(&self) -> i64 {
        self.queued.load(Ordering::SeqCst)
    }

    fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn longest_fetch_interval(&self) -> libc::timespec {
        libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        }
    }

    fn num_overruns(&self) -> u32 {
        0
    }

    fn wake_fd(&self) -> Option<RawFd> {
        None
    }

    fn can_fetch(&self) -> bool {
        true
    }

    fn dev_offset(&self, dev_idx: u32) -> usize {
        self.offsets
            .lock()
            .expect("offsets")
            .get(&dev_idx)
            .copied()
            .unwrap_or(0)
    }

    fn update_dev_offset(&self, dev_idx: u32, frames: usize) {
        self.offsets.lock().expect("offsets").insert(dev_idx, frames);
    }

    fn apm(&self) -> Option<Arc<dyn Apm>> {
        None
    }
}

#[derive(Default)]
struct TestDevIo;

impl DevIo for TestDevIo {
    fn run(
        &mut self,
        _odevs: &mut Vec<OpenDev>,
        _idevs: &mut Vec<OpenDev>,
        _remix: Option<&dyn RemixConverter>,
    ) {
    }

    fn next_input_wake(
        &mut self,
        _idevs: &mut Vec<OpenDev>,
        _min_ts: &mut libc::timespec,
    ) -> usize {
        0
    }
}

#[derive(Default)]
struct TestMonitor {
    busyloops: Arc<AtomicUsize>,
}

impl Monitor for TestMonitor {
    fn busyloop(&self) {
        self.busyloops.fetch_add(1, Ordering::SeqCst);
    }
}

struct MarkerConverter(usize);

impl RemixConverter for MarkerConverter {
    fn num_channels(&self) -> usize {
        self.0
    }

    fn remix(&self, _frames: usize, _samples: &mut [f32]) {}
}

fn started_thread() -> AudioThread {
    let mut t = AudioThread::create(
        Box::new(TestDevIo::default()),
        Box::new(TestMonitor::default()),
    )
    .expect("create audio thread");
    t.start().expect("start audio thread");
    t
}

#[test]
fn open_device_bookkeeping_round_trips() {
    let _guard = serialize();
    let t = started_thread();
    let dev = TestDevice::new(1, Direction::Output);
    let handle = dev.clone() as Arc<dyn Device>;

    assert!(!t.is_dev_open(handle.clone()).expect("is open"));
    assert_eq!(t.add_open_dev(handle.clone()).expect("add"), 0);
    assert!(t.is_dev_open(handle.clone()).expect("is open"));
    assert_eq!(
        t.add_open_dev(handle.clone()).expect("add again"),
        -libc::EEXIST
    );
    // Output devices get padded with silence up to min_buffer_level.
    assert_eq!(dev.filled_zeros.load(Ordering::SeqCst), 1600);

    assert_eq!(t.rm_open_dev(handle.clone()).expect("rm"), 0);
    assert!(!t.is_dev_open(handle.clone()).expect("is open"));
    assert_eq!(t.rm_open_dev(handle).expect("rm again"), -libc::EINVAL);
    t.destroy();
}

#[test]
fn stream_attach_detach_and_dump() {
    let _guard = serialize();
    let t = started_thread();
    let d_out = TestDevice::new(1, Direction::Output);
    let d_in = TestDevice::new(2, Direction::Input);
    let s_out = TestStream::new(10, Direction::Output);
    let s_in = TestStream::new(20, Direction::Input);

    // Input registered first; the dump must still put output first.
    assert_eq!(t.add_open_dev(d_in.clone()).expect("add in"), 0);
    assert_eq!(t.add_open_dev(d_out.clone()).expect("add out"), 0);
    assert_eq!(
        t.add_stream(s_out.clone(), vec![d_out.clone() as Arc<dyn Device>])
            .expect("attach out"),
        0
    );
    assert_eq!(
        t.add_stream(s_in.clone(), vec![d_in.clone() as Arc<dyn Device>])
            .expect("attach in"),
        0
    );
    assert_eq!(d_in.flushes.load(Ordering::SeqCst), 1);

    let mut info = AudioDebugInfo::new();
    assert_eq!(t.dump_thread_info(&mut info).expect("dump"), 0);
    assert_eq!(info.devs.len(), 2);
    assert_eq!(info.devs[0].direction, Direction::Output);
    assert_eq!(info.devs[0].dev_name, "test-1");
    assert_eq!(info.devs[1].direction, Direction::Input);
    assert_eq!(info.streams.len(), 2);
    assert_eq!(info.streams[0].stream_id, 10);
    assert_eq!(info.streams[0].dev_idx, 1);
    assert_eq!(info.streams[1].stream_id, 20);
    assert!(info.log.iter().any(|entry| entry.tag != 0));

    assert_eq!(
        t.disconnect_stream(s_out.clone(), None).expect("disconnect"),
        0
    );
    let mut info = AudioDebugInfo::new();
    assert_eq!(t.dump_thread_info(&mut info).expect("dump"), 0);
    assert_eq!(info.streams.len(), 1);
    assert_eq!(info.streams[0].stream_id, 20);
    t.destroy();
}

#[test]
fn attach_to_no_open_device_is_a_quiet_no_op() {
    let _guard = serialize();
    let t = started_thread();
    let dev = TestDevice::new(1, Direction::Output);
    let stream = TestStream::new(10, Direction::Output);

    // Device never registered: skipped, no binding created.
    assert_eq!(
        t.add_stream(stream.clone(), vec![dev.clone() as Arc<dyn Device>])
            .expect("attach"),
        0
    );
    let mut info = AudioDebugInfo::new();
    assert_eq!(t.dump_thread_info(&mut info).expect("dump"), 0);
    assert!(info.streams.is_empty());
    t.destroy();
}

#[test]
fn drain_counts_down_then_reaps() {
    let _guard = serialize();
    let t = started_thread();
    let dev = TestDevice::new(1, Direction::Output);
    let stream = TestStream::new(10, Direction::Output);

    assert_eq!(t.drain_stream(stream.clone()).expect("drain unattached"), 0);

    assert_eq!(t.add_open_dev(dev.clone()).expect("add"), 0);
    assert_eq!(
        t.add_stream(stream.clone(), vec![dev.clone() as Arc<dyn Device>])
            .expect("attach"),
        0
    );

    stream.queued.store(4800, Ordering::SeqCst);
    assert_eq!(t.drain_stream(stream.clone()).expect("drain"), 101);
    assert!(stream.is_draining());

    stream.queued.store(0, Ordering::SeqCst);
    assert_eq!(t.drain_stream(stream.clone()).expect("drain done"), 0);
    assert_eq!(t.drain_stream(stream.clone()).expect("drain reaped"), 0);

    let mut info = AudioDebugInfo::new();
    assert_eq!(t.dump_thread_info(&mut info).expect("dump"), 0);
    assert!(info.streams.is_empty());
    t.destroy();
}

#[test]
fn ramp_is_forwarded_to_open_devices_only() {
    let _guard = serialize();
    let t = started_thread();
    let dev = TestDevice::new(1, Direction::Output);
    let handle = dev.clone() as Arc<dyn Device>;

    assert_eq!(
        t.dev_start_ramp(handle.clone(), RampRequest::UpUnmute)
            .expect("ramp unknown"),
        -libc::EINVAL
    );
    assert_eq!(t.add_open_dev(handle.clone()).expect("add"), 0);
    assert_eq!(
        t.dev_start_ramp(handle, RampRequest::UpUnmute).expect("ramp"),
        0
    );
    assert_eq!(
        dev.ramps.lock().expect("ramps").as_slice(),
        &[RampRequest::UpUnmute]
    );
    t.destroy();
}

#[test]
fn identity_remix_installs_nothing() {
    let _guard = serialize();
    let t = started_thread();

    let identity = [1.0, 0.0, 0.0, 1.0];
    t.config_global_remix_matrix(2, &identity, |n, _| {
        Some(Box::new(MarkerConverter(n)) as Box<dyn RemixConverter>)
    })
    .expect("identity remix");
    // Previous converter was none and identity installed none.
    assert!(t.config_global_remix(None).expect("swap").is_none());

    let downmix = [0.5, 0.5, 0.5, 0.5];
    t.config_global_remix_matrix(2, &downmix, |n, _| {
        Some(Box::new(MarkerConverter(n)) as Box<dyn RemixConverter>)
    })
    .expect("downmix remix");
    let old = t.config_global_remix(None).expect("swap");
    let old = old.expect("converter was installed");
    assert_eq!(old.num_channels(), 2);
    t.destroy();
}

#[test]
fn registered_fd_callbacks_fire_from_the_loop() {
    let _guard = serialize();
    let t = started_thread();

    let mut fds = [-1; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (rfd, wfd) = (fds[0], fds[1]);
    unsafe {
        libc::fcntl(rfd, libc::F_SETFL, libc::O_NONBLOCK);
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_cb = hits.clone();
    add_callback(rfd, move || {
        let mut byte = 0u8;
        // Drain the event so the loop does not re-dispatch.
        while unsafe { libc::read(rfd, (&mut byte as *mut u8).cast(), 1) } == 1 {}
        hits_cb.fetch_add(1, Ordering::SeqCst);
    });
    // The worker only picks up registry changes when it rebuilds its poll
    // set, so round-trip a no-op command after each change.
    assert_eq!(t.rm_callback_sync(-1).expect("sync"), 0);

    assert_eq!(unsafe { libc::write(wfd, [1u8].as_ptr().cast(), 1) }, 1);
    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1));

    enable_callback(rfd, false);
    assert_eq!(t.rm_callback_sync(-1).expect("sync"), 0);
    assert_eq!(unsafe { libc::write(wfd, [1u8].as_ptr().cast(), 1) }, 1);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    enable_callback(rfd, true);
    assert_eq!(t.rm_callback_sync(-1).expect("sync"), 0);
    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 2));

    assert_eq!(t.rm_callback_sync(rfd).expect("rm callback"), 0);
    assert_eq!(unsafe { libc::write(wfd, [1u8].as_ptr().cast(), 1) }, 1);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    t.destroy();
    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}

#[test]
fn sustained_zero_wait_reports_one_busyloop() {
    let _guard = serialize();
    let busyloops = Arc::new(AtomicUsize::new(0));
    let monitor = TestMonitor {
        busyloops: busyloops.clone(),
    };
    let mut t = AudioThread::create(Box::new(TestDevIo::default()), Box::new(monitor))
        .expect("create audio thread");
    t.start().expect("start audio thread");

    let dev = TestDevice::new(1, Direction::Output);
    let stream = TestStream::new(10, Direction::Output);
    assert_eq!(t.add_open_dev(dev.clone()).expect("add"), 0);
    // The fake I/O collaborator never advances next_cb_ts, so the stream's
    // callback time stays in the past and every sleep computes to zero.
    assert_eq!(
        t.add_stream(stream.clone(), vec![dev.clone() as Arc<dyn Device>])
            .expect("attach"),
        0
    );

    assert!(wait_until(|| busyloops.load(Ordering::SeqCst) == 1));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(busyloops.load(Ordering::SeqCst), 1);

    assert_eq!(
        t.disconnect_stream(stream.clone(), None).expect("disconnect"),
        0
    );
    t.destroy();
}

#[test]
fn destroy_joins_cleanly_after_work() {
    let _guard = serialize();
    let t = started_thread();
    let dev = TestDevice::new(1, Direction::Output);
    assert_eq!(t.add_open_dev(dev.clone()).expect("add"), 0);
    t.destroy();
}

//! Fake collaborators for unit tests.

use crate::device::{Device, Direction, Format, OpenDev, RampRequest};
use crate::io::{DevIo, Monitor, RemixConverter};
use crate::stream::{Apm, Stream, StreamType};
use nix::libc;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) struct FakeDevice {
    idx: u32,
    direction: Direction,
    pub(crate) format: Mutex<Option<Format>>,
    pub(crate) min_buffer_level: usize,
    pub(crate) filled_zeros: AtomicUsize,
    pub(crate) flushes: AtomicUsize,
    pub(crate) flush_fails: AtomicBool,
    pub(crate) open: AtomicBool,
    pub(crate) wants_wake: AtomicBool,
    pub(crate) ramps: Mutex<Vec<RampRequest>>,
    pub(crate) streams_added: AtomicUsize,
    pub(crate) streams_removed: AtomicUsize,
}

impl FakeDevice {
    pub(crate) fn new(idx: u32, direction: Direction) -> Self {
        Self {
            idx,
            direction,
            format: Mutex::new(Some(Format::new(48_000, 2))),
            min_buffer_level: 480,
            filled_zeros: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            flush_fails: AtomicBool::new(false),
            open: AtomicBool::new(true),
            wants_wake: AtomicBool::new(false),
            ramps: Mutex::new(Vec::new()),
            streams_added: AtomicUsize::new(0),
            streams_removed: AtomicUsize::new(0),
        }
    }
}

impl Device for FakeDevice {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn idx(&self) -> u32 {
        self.idx
    }

    fn name(&self) -> String {
        format!("fake-{}", self.idx)
    }

    fn buffer_size(&self) -> usize {
        4096
    }

    fn min_buffer_level(&self) -> usize {
        self.min_buffer_level
    }

    fn min_cb_level(&self) -> usize {
        240
    }

    fn max_cb_level(&self) -> usize {
        2048
    }

    fn format(&self) -> Option<Format> {
        *self.format.lock().expect("format")
    }

    fn highest_hw_level(&self) -> usize {
        0
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
        self.open.load(Ordering::SeqCst)
    }

    fn fill_zeros(&self, frames: usize) -> io::Result<()> {
        self.filled_zeros.fetch_add(frames, Ordering::SeqCst);
        Ok(())
    }

    fn flush_buffer(&self) -> io::Result<usize> {
        if self.flush_fails.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    fn start_ramp(&self, request: RampRequest) -> io::Result<()> {
        self.ramps.lock().expect("ramps").push(request);
        Ok(())
    }

    fn should_wake(&self) -> bool {
        self.wants_wake.load(Ordering::SeqCst)
    }

    fn stream_added(&self, _stream: &dyn Stream) {
        self.streams_added.fetch_add(1, Ordering::SeqCst);
    }

    fn stream_removed(&self, _stream: &dyn Stream) {
        self.streams_removed.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeApm {
    pub(crate) effects: u64,
    pub(crate) dumps: Mutex<Vec<(u32, bool, RawFd)>>,
}

impl Apm for FakeApm {
    fn effects(&self) -> u64 {
        self.effects
    }

    fn set_aec_dump(&self, dev_idx: u32, start: bool, fd: RawFd) -> io::Result<()> {
        self.dumps.lock().expect("dumps").push((dev_idx, start, fd));
        Ok(())
    }
}

pub(crate) struct FakeStream {
    id: u32,
    direction: Direction,
    pub(crate) format: Format,
    pub(crate) buffer_frames: usize,
    pub(crate) cb_threshold: usize,
    pub(crate) queued: AtomicI64,
    pub(crate) draining: AtomicBool,
    pub(crate) fetchable: AtomicBool,
    pub(crate) wake_fd: Mutex<Option<RawFd>>,
    pub(crate) offsets: Mutex<HashMap<u32, usize>>,
    pub(crate) apm: Option<Arc<FakeApm>>,
}

impl FakeStream {
    pub(crate) fn new(id: u32, direction: Direction) -> Self {
        Self {
            id,
            direction,
            format: Format::new(48_000, 2),
            buffer_frames: 2048,
            cb_threshold: 512,
            queued: AtomicI64::new(0),
            draining: AtomicBool::new(false),
            fetchable: AtomicBool::new(true),
            wake_fd: Mutex::new(None),
            offsets: Mutex::new(HashMap::new()),
            apm: None,
        }
    }
}

impl Stream for FakeStream {
    fn id(&self) -> u32 {
        self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Default
    }

    fn format(&self) -> Format {
        self.format
    }

    fn buffer_frames(&self) -> usize {
        self.buffer_frames
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
        crate::time::ts_zero()
    }

    fn num_overruns(&self) -> u32 {
        0
    }

    fn wake_fd(&self) -> Option<RawFd> {
        *self.wake_fd.lock().expect("wake_fd")
    }

    fn can_fetch(&self) -> bool {
        self.fetchable.load(Ordering::SeqCst)
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
        self.apm.clone().map(|apm| apm as Arc<dyn Apm>)
    }
}

#[derive(Default)]
pub(crate) struct FakeDevIo {
    pub(crate) runs: Arc<AtomicUsize>,
}

impl DevIo for FakeDevIo {
    fn run(
        &mut self,
        _odevs: &mut Vec<OpenDev>,
        _idevs: &mut Vec<OpenDev>,
        _remix: Option<&dyn RemixConverter>,
    ) {
        self.runs.fetch_add(1, Ordering::SeqCst);
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
pub(crate) struct FakeMonitor {
    pub(crate) busyloops: Arc<AtomicUsize>,
}

impl Monitor for FakeMonitor {
    fn busyloop(&self) {
        self.busyloops.fetch_add(1, Ordering::SeqCst);
    }
}

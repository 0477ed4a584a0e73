use crate::dev_stream::DevStream;
use crate::stream::Stream;
use crate::time::ts_zero;
use nix::libc;
use serde::Serialize;
use std::io;
use std::sync::Arc;

pub const MAX_CHANNELS: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Output,
    Input,
}

impl Direction {
    pub(crate) fn idx(self) -> usize {
        match self {
            Direction::Output => 0,
            Direction::Input => 1,
        }
    }
}

/// External sample format of a device or stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Format {
    pub frame_rate: u32,
    pub num_channels: usize,
    pub channel_layout: [i8; MAX_CHANNELS],
}

impl Format {
    pub fn new(frame_rate: u32, num_channels: usize) -> Self {
        let mut channel_layout = [-1; MAX_CHANNELS];
        for (ch, slot) in channel_layout.iter_mut().take(num_channels).enumerate() {
            *slot = ch as i8;
        }
        Self {
            frame_rate,
            num_channels,
            channel_layout,
        }
    }
}

/// Volume envelope applied while a device starts or stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampRequest {
    DownMute,
    UpUnmute,
    UpStartPlayback,
}

impl RampRequest {
    pub(crate) fn to_u32(self) -> u32 {
        match self {
            RampRequest::DownMute => 0,
            RampRequest::UpUnmute => 1,
            RampRequest::UpStartPlayback => 2,
        }
    }

    pub(crate) fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(RampRequest::DownMute),
            1 => Some(RampRequest::UpUnmute),
            2 => Some(RampRequest::UpStartPlayback),
            _ => None,
        }
    }
}

/// One hardware endpoint, supplied by the embedder. Implementations carry
/// their own interior mutability; the scheduler only holds `Arc`s and
/// identifies devices by the address of the handle's target.
pub trait Device: Send + Sync {
    fn direction(&self) -> Direction;
    fn idx(&self) -> u32;
    fn name(&self) -> String;
    fn buffer_size(&self) -> usize;
    fn min_buffer_level(&self) -> usize;
    fn min_cb_level(&self) -> usize;
    fn max_cb_level(&self) -> usize;
    fn format(&self) -> Option<Format>;
    fn highest_hw_level(&self) -> usize;
    fn num_underruns(&self) -> u32;
    fn num_severe_underruns(&self) -> u32;
    fn est_rate_ratio(&self) -> f64;
    fn is_open(&self) -> bool;

    /// Queue `frames` frames of silence into the playback buffer.
    fn fill_zeros(&self, frames: usize) -> io::Result<()>;
    /// Drop pending capture so subsequent reads start aligned. Returns the
    /// number of frames discarded.
    fn flush_buffer(&self) -> io::Result<usize>;
    fn start_ramp(&self, request: RampRequest) -> io::Result<()>;

    /// Whether the hardware itself wants service at `wake_ts`.
    fn should_wake(&self) -> bool;

    /// Bookkeeping hooks so the device can track its bound streams.
    fn stream_added(&self, stream: &dyn Stream);
    fn stream_removed(&self, stream: &dyn Stream);
}

/// A device registered with the scheduler and eligible for I/O. Owns the
/// bindings of every stream currently attached to the device.
pub struct OpenDev {
    pub dev: Arc<dyn Device>,
    /// Next hardware service time, maintained by the I/O collaborator.
    pub wake_ts: libc::timespec,
    pub streams: Vec<DevStream>,
}

impl OpenDev {
    pub(crate) fn new(dev: Arc<dyn Device>) -> Self {
        Self {
            dev,
            wake_ts: ts_zero(),
            streams: Vec::new(),
        }
    }

    pub(crate) fn has_stream(&self, stream: &Arc<dyn Stream>) -> bool {
        self.streams.iter().any(|ds| same_stream(&ds.stream, stream))
    }
}

impl std::fmt::Debug for OpenDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenDev")
            .field("idx", &self.dev.idx())
            .field("streams", &self.streams.len())
            .finish()
    }
}

/// Handles are compared by the address of the object they manage. Plain
/// `Arc::ptr_eq` also compares vtable pointers, which are not unique for
/// trait objects.
pub(crate) fn same_dev(a: &Arc<dyn Device>, b: &Arc<dyn Device>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) fn same_stream(a: &Arc<dyn Stream>, b: &Arc<dyn Stream>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) fn find_open_dev(list: &[OpenDev], dev: &Arc<dyn Device>) -> Option<usize> {
    list.iter().position(|adev| same_dev(&adev.dev, dev))
}

/// Detach `stream` from one device, or from every device in `list` when
/// `dev` is None. Bindings are destroyed and the device is told.
pub(crate) fn remove_stream(
    list: &mut [OpenDev],
    stream: &Arc<dyn Stream>,
    dev: Option<&Arc<dyn Device>>,
) {
    for adev in list.iter_mut() {
        if let Some(d) = dev
            && !same_dev(&adev.dev, d)
        {
            continue;
        }
        if adev.has_stream(stream) {
            adev.dev.stream_removed(stream.as_ref());
            adev.streams.retain(|ds| !same_stream(&ds.stream, stream));
        }
    }
}

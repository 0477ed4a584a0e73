use crate::device::{Direction, MAX_CHANNELS, OpenDev};
use crate::dev_stream::DevStream;
use crate::event_log::{EventLog, EventLogEntry};
use crate::stream::StreamType;
use serde::Serialize;

pub const MAX_DEBUG_DEVS: usize = 4;
pub const MAX_DEBUG_STREAMS: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceDebugInfo {
    pub dev_name: String,
    pub buffer_size: usize,
    pub min_buffer_level: usize,
    pub min_cb_level: usize,
    pub max_cb_level: usize,
    pub direction: Direction,
    pub num_underruns: u32,
    pub num_severe_underruns: u32,
    pub highest_hw_level: usize,
    pub frame_rate: u32,
    pub num_channels: usize,
    pub est_rate_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamDebugInfo {
    pub stream_id: u32,
    pub dev_idx: u32,
    pub direction: Direction,
    pub stream_type: StreamType,
    pub buffer_frames: usize,
    pub cb_threshold: usize,
    pub frame_rate: u32,
    pub num_channels: usize,
    pub channel_layout: [i8; MAX_CHANNELS],
    pub longest_fetch_sec: i64,
    pub longest_fetch_nsec: i64,
    pub num_overruns: u32,
    pub effects: u64,
}

/// Snapshot buffer filled by DUMP_THREAD_INFO. The caller allocates it,
/// the audio worker writes it, and the caller reads it back after the
/// command response, so it is never shared while in use.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioDebugInfo {
    pub devs: Vec<DeviceDebugInfo>,
    pub streams: Vec<StreamDebugInfo>,
    pub log: Vec<EventLogEntry>,
    pub log_write_pos: usize,
}

impl AudioDebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn clear(&mut self) {
        self.devs.clear();
        self.streams.clear();
        self.log.clear();
        self.log_write_pos = 0;
    }

    pub(crate) fn push_dev(&mut self, adev: &OpenDev) {
        let dev = &adev.dev;
        let fmt = dev.format();
        self.devs.push(DeviceDebugInfo {
            dev_name: dev.name(),
            buffer_size: dev.buffer_size(),
            min_buffer_level: dev.min_buffer_level(),
            min_cb_level: dev.min_cb_level(),
            max_cb_level: dev.max_cb_level(),
            direction: dev.direction(),
            num_underruns: dev.num_underruns(),
            num_severe_underruns: dev.num_severe_underruns(),
            highest_hw_level: dev.highest_hw_level(),
            frame_rate: fmt.map_or(0, |f| f.frame_rate),
            num_channels: fmt.map_or(0, |f| f.num_channels),
            est_rate_ratio: if fmt.is_some() {
                dev.est_rate_ratio()
            } else {
                0.0
            },
        });
    }

    pub(crate) fn push_stream(&mut self, ds: &DevStream) {
        let stream = &ds.stream;
        let fmt = stream.format();
        let fetch = stream.longest_fetch_interval();
        self.streams.push(StreamDebugInfo {
            stream_id: stream.id(),
            dev_idx: ds.dev_idx,
            direction: stream.direction(),
            stream_type: stream.stream_type(),
            buffer_frames: stream.buffer_frames(),
            cb_threshold: stream.cb_threshold(),
            frame_rate: fmt.frame_rate,
            num_channels: fmt.num_channels,
            channel_layout: fmt.channel_layout,
            longest_fetch_sec: fetch.tv_sec as i64,
            longest_fetch_nsec: fetch.tv_nsec as i64,
            num_overruns: stream.num_overruns(),
            effects: stream.apm().map_or(0, |apm| apm.effects()),
        });
    }

    pub(crate) fn copy_log(&mut self, log: &EventLog) {
        self.log.clear();
        self.log.extend_from_slice(log.entries());
        self.log_write_pos = log.write_pos();
    }
}

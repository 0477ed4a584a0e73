use crate::device::Format;
use crate::stream::Stream;
use nix::libc;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Binding between one stream and one device. Carries the per-pair
/// scheduling state; the I/O collaborator advances `next_cb_ts` as it
/// services the stream.
pub struct DevStream {
    pub stream: Arc<dyn Stream>,
    pub dev_idx: u32,
    pub format: Format,
    pub next_cb_ts: Option<libc::timespec>,
    /// Frames the device has already accounted to this binding.
    pub written_offset: usize,
}

impl DevStream {
    /// Fails when the device has no configured format, which means it is
    /// not actually ready for stream I/O.
    pub(crate) fn new(
        stream: Arc<dyn Stream>,
        dev_idx: u32,
        format: Option<Format>,
        init_cb_ts: libc::timespec,
    ) -> io::Result<Self> {
        let format = format.ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        Ok(Self {
            stream,
            dev_idx,
            format,
            next_cb_ts: Some(init_cb_ts),
            written_offset: 0,
        })
    }

    pub fn wake_fd(&self) -> Option<RawFd> {
        self.stream.wake_fd()
    }
}

impl std::fmt::Debug for DevStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevStream")
            .field("stream_id", &self.stream.id())
            .field("dev_idx", &self.dev_idx)
            .field("written_offset", &self.written_offset)
            .finish()
    }
}

use crate::device::{Direction, Format};
use nix::libc;
use serde::Serialize;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamType {
    Default,
    Multimedia,
    VoiceCommunication,
    SpeechRecognition,
    ProAudio,
    Accessibility,
}

/// Audio processing module attached to a capture stream, echo cancellation
/// and friends. Opaque to the scheduler apart from dump control.
pub trait Apm: Send + Sync {
    fn effects(&self) -> u64;
    fn set_aec_dump(&self, dev_idx: u32, start: bool, fd: RawFd) -> io::Result<()>;
}

/// One client audio stream backed by shared memory. Supplied by the
/// embedder; the scheduler holds `Arc`s and identifies streams by the
/// address of the handle's target.
pub trait Stream: Send + Sync {
    fn id(&self) -> u32;
    fn direction(&self) -> Direction;
    fn stream_type(&self) -> StreamType;
    fn format(&self) -> Format;
    fn buffer_frames(&self) -> usize;
    fn cb_threshold(&self) -> usize;

    /// Frames currently sitting in the shared-memory buffer.
    fn queued_frames(&self) -> i64;

    fn set_draining(&self, draining: bool);
    fn is_draining(&self) -> bool;

    fn longest_fetch_interval(&self) -> libc::timespec;
    fn num_overruns(&self) -> u32;

    /// Fd the client signals when the stream needs service, if any.
    fn wake_fd(&self) -> Option<RawFd>;
    /// Whether a fetch can currently be scheduled for this stream.
    fn can_fetch(&self) -> bool;

    /// Read progress against one device, tracked per device index so a
    /// stream attached to several devices keeps them aligned.
    fn dev_offset(&self, dev_idx: u32) -> usize;
    fn update_dev_offset(&self, dev_idx: u32, frames: usize);

    fn apm(&self) -> Option<Arc<dyn Apm>>;
}

//! Realtime audio I/O scheduling engine. One dedicated worker thread
//! multiplexes open playback and capture devices against client streams,
//! waking from a single ppoll for hardware deadlines, stream callbacks,
//! command messages, and registered fds.

pub mod callback;
pub mod config;
pub mod debug;
pub mod dev_stream;
pub mod device;
pub mod event_log;
pub mod io;
mod message;
mod pipe;
mod poll;
pub mod stream;
#[cfg(test)]
pub(crate) mod test_support;
pub mod thread;
pub mod time;
mod worker;

pub use nix::libc;

pub use callback::{add_callback, add_write_callback, enable_callback, rm_callback};
pub use debug::{AudioDebugInfo, DeviceDebugInfo, MAX_DEBUG_DEVS, MAX_DEBUG_STREAMS, StreamDebugInfo};
pub use dev_stream::DevStream;
pub use device::{Device, Direction, Format, MAX_CHANNELS, OpenDev, RampRequest};
pub use event_log::{Event, EventLog, EventLogEntry};
pub use io::{DevIo, Monitor, RemixConverter, remix_is_identity};
pub use stream::{Apm, Stream, StreamType};
pub use thread::AudioThread;

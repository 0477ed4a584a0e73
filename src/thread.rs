use crate::config;
use crate::debug::AudioDebugInfo;
use crate::device::{Device, RampRequest};
use crate::io::{DevIo, Monitor, RemixConverter, remix_is_identity};
use crate::message::{self, CommandId, Msg};
use crate::pipe::{self, Pipe};
use crate::stream::Stream;
use crate::worker::Worker;
use nix::libc;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Handle to the audio worker thread. Every operation is posted over the
/// command pipe and waits for the worker's acknowledgement, so calls are
/// fully serialized and a returned error code means the operation did not
/// take effect.
pub struct AudioThread {
    to_thread: Pipe,
    to_main: Pipe,
    post_lock: Mutex<()>,
    started: AtomicBool,
    worker: Option<Worker>,
    handle: Option<JoinHandle<()>>,
}

impl AudioThread {
    /// Allocate the thread object and its command pipes. The worker does
    /// not run until `start`.
    pub fn create(dev_io: Box<dyn DevIo>, monitor: Box<dyn Monitor>) -> io::Result<Self> {
        let to_thread = Pipe::new()?;
        let to_main = Pipe::new()?;
        let worker = Worker::new(to_thread.read_fd, to_main.write_fd, dev_io, monitor);
        Ok(Self {
            to_thread,
            to_main,
            post_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            worker: Some(worker),
            handle: None,
        })
    }

    /// Spawn the worker thread running the audio loop.
    pub fn start(&mut self) -> io::Result<()> {
        let Some(worker) = self.worker.take() else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        };
        let handle = std::thread::Builder::new()
            .name(config::WORKER_THREAD_NAME.into())
            .spawn(move || worker.run())?;
        self.handle = Some(handle);
        self.started.store(true, Ordering::SeqCst);
        debug!("audio worker started");
        Ok(())
    }

    fn ensure_started(&self) -> io::Result<()> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    /// Write one message, then block for the worker's integer reply. The
    /// lock keeps concurrent callers serialized so at most one command is
    /// ever in flight.
    fn post(&self, msg: &Msg) -> io::Result<i32> {
        let _guard = self.post_lock.lock().expect("post lock poisoned");
        if let Err(e) = pipe::write_all(self.to_thread.write_fd, msg.as_bytes()) {
            error!("failed to post message to audio worker: {e}");
            return Err(e);
        }
        let mut rsp = [0u8; 4];
        if let Err(e) = pipe::read_exact(self.to_main.read_fd, &mut rsp) {
            error!("failed to read audio worker reply: {e}");
            return Err(e);
        }
        Ok(i32::from_ne_bytes(rsp))
    }

    /// Like `post` for the one command whose reply is pointer-sized.
    fn post_for_ptr(&self, msg: &Msg) -> io::Result<u64> {
        let _guard = self.post_lock.lock().expect("post lock poisoned");
        if let Err(e) = pipe::write_all(self.to_thread.write_fd, msg.as_bytes()) {
            error!("failed to post message to audio worker: {e}");
            return Err(e);
        }
        let mut rsp = [0u8; 8];
        if let Err(e) = pipe::read_exact(self.to_main.read_fd, &mut rsp) {
            error!("failed to read audio worker reply: {e}");
            return Err(e);
        }
        Ok(u64::from_ne_bytes(rsp))
    }

    /// Register a device for I/O. 0, or -EEXIST when already registered.
    pub fn add_open_dev(&self, dev: Arc<dyn Device>) -> io::Result<i32> {
        self.ensure_started()?;
        self.post(&message::open_dev_msg(CommandId::AddOpenDev, dev))
    }

    /// Unregister a device. 0, or -EINVAL when unknown.
    pub fn rm_open_dev(&self, dev: Arc<dyn Device>) -> io::Result<i32> {
        self.ensure_started()?;
        self.post(&message::open_dev_msg(CommandId::RmOpenDev, dev))
    }

    pub fn is_dev_open(&self, dev: Arc<dyn Device>) -> io::Result<bool> {
        self.ensure_started()?;
        Ok(self.post(&message::open_dev_msg(CommandId::IsDevOpen, dev))? != 0)
    }

    /// Attach a stream to each open device in `devs`. Devices not in the
    /// open list are skipped; a mid-way failure rolls every attachment of
    /// this call back and returns the first error code.
    pub fn add_stream(
        &self,
        stream: Arc<dyn Stream>,
        devs: Vec<Arc<dyn Device>>,
    ) -> io::Result<i32> {
        self.ensure_started()?;
        self.post(&message::add_stream_msg(stream, devs))
    }

    /// Detach a stream from one device, or from every device in its
    /// direction when `dev` is None.
    pub fn disconnect_stream(
        &self,
        stream: Arc<dyn Stream>,
        dev: Option<Arc<dyn Device>>,
    ) -> io::Result<i32> {
        self.ensure_started()?;
        self.post(&message::disconnect_stream_msg(stream, dev))
    }

    /// Begin or poll draining. The reply is milliseconds until the stream
    /// runs dry; 0 means it was reaped and must not be referenced again.
    pub fn drain_stream(&self, stream: Arc<dyn Stream>) -> io::Result<i32> {
        self.ensure_started()?;
        self.post(&message::drain_stream_msg(stream))
    }

    pub fn dev_start_ramp(&self, dev: Arc<dyn Device>, request: RampRequest) -> io::Result<i32> {
        self.ensure_started()?;
        self.post(&message::dev_start_ramp_msg(dev, request))
    }

    pub fn set_aec_dump(&self, stream_id: u32, start: bool, fd: RawFd) -> io::Result<i32> {
        self.ensure_started()?;
        self.post(&message::aec_dump_msg(stream_id, start, fd))
    }

    /// Remove an fd callback from inside the worker loop, so removal is
    /// serialized with dispatch.
    pub fn rm_callback_sync(&self, fd: RawFd) -> io::Result<i32> {
        self.ensure_started()?;
        self.post(&message::rm_callback_msg(fd))
    }

    /// Fill `info` with the worker's device, stream, and event-log state.
    pub fn dump_thread_info(&self, info: &mut AudioDebugInfo) -> io::Result<i32> {
        self.ensure_started()?;
        self.post(&message::dump_thread_info_msg(info as *mut AudioDebugInfo))
    }

    /// Install `conv` as the global remix converter and get the displaced
    /// one back, which the caller now owns.
    pub fn config_global_remix(
        &self,
        conv: Option<Box<dyn RemixConverter>>,
    ) -> io::Result<Option<Box<dyn RemixConverter>>> {
        self.ensure_started()?;
        let raw = self.post_for_ptr(&message::config_global_remix_msg(conv))?;
        Ok(message::reclaim_remix(raw))
    }

    /// Install a remix converter built from a coefficient matrix. An
    /// identity matrix means no remix at all, so none is installed and any
    /// previous converter is dropped.
    pub fn config_global_remix_matrix<F>(
        &self,
        num_channels: usize,
        coefficient: &[f32],
        make: F,
    ) -> io::Result<()>
    where
        F: FnOnce(usize, &[f32]) -> Option<Box<dyn RemixConverter>>,
    {
        let conv = if remix_is_identity(num_channels, coefficient) {
            None
        } else {
            make(num_channels, coefficient)
        };
        let _old = self.config_global_remix(conv)?;
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.started.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.post(&message::stop_msg()) {
                error!("failed to stop audio worker: {e}");
            }
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            debug!("audio worker joined");
        }
    }

    /// Stop the worker if it runs, join it, and release both pipes.
    /// Dropping the handle does the same.
    pub fn destroy(self) {}
}

impl Drop for AudioThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

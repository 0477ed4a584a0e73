use crate::debug::AudioDebugInfo;
use crate::device::{Device, RampRequest};
use crate::io::RemixConverter;
use crate::pipe;
use crate::stream::Stream;
use nix::libc;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Big enough for every defined command.
pub(crate) const MAX_MSG_LEN: usize = 256;
const LEN_BYTES: usize = 4;
const HDR_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum CommandId {
    AddOpenDev = 0,
    RmOpenDev,
    IsDevOpen,
    AddStream,
    DisconnectStream,
    Stop,
    DumpThreadInfo,
    DrainStream,
    ConfigGlobalRemix,
    DevStartRamp,
    RemoveCallback,
    AecDump,
}

impl CommandId {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::AddOpenDev),
            1 => Some(Self::RmOpenDev),
            2 => Some(Self::IsDevOpen),
            3 => Some(Self::AddStream),
            4 => Some(Self::DisconnectStream),
            5 => Some(Self::Stop),
            6 => Some(Self::DumpThreadInfo),
            7 => Some(Self::DrainStream),
            8 => Some(Self::ConfigGlobalRemix),
            9 => Some(Self::DevStartRamp),
            10 => Some(Self::RemoveCallback),
            11 => Some(Self::AecDump),
            _ => None,
        }
    }
}

/// Commands as the worker sees them after a frame is decoded. Handles have
/// been reclaimed from their pointer form at this point.
pub(crate) enum Command {
    AddOpenDev(Arc<dyn Device>),
    RmOpenDev(Arc<dyn Device>),
    IsDevOpen(Arc<dyn Device>),
    AddStream {
        stream: Arc<dyn Stream>,
        devs: Vec<Arc<dyn Device>>,
    },
    DisconnectStream {
        stream: Arc<dyn Stream>,
        dev: Option<Arc<dyn Device>>,
    },
    DrainStream(Arc<dyn Stream>),
    DevStartRamp {
        dev: Arc<dyn Device>,
        request: RampRequest,
    },
    ConfigGlobalRemix(Option<Box<dyn RemixConverter>>),
    DumpThreadInfo(*mut AudioDebugInfo),
    AecDump {
        stream_id: u32,
        start: bool,
        fd: RawFd,
    },
    RemoveCallback(RawFd),
    Stop,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::AddOpenDev(_) => "AddOpenDev",
            Command::RmOpenDev(_) => "RmOpenDev",
            Command::IsDevOpen(_) => "IsDevOpen",
            Command::AddStream { .. } => "AddStream",
            Command::DisconnectStream { .. } => "DisconnectStream",
            Command::DrainStream(_) => "DrainStream",
            Command::DevStartRamp { .. } => "DevStartRamp",
            Command::ConfigGlobalRemix(_) => "ConfigGlobalRemix",
            Command::DumpThreadInfo(_) => "DumpThreadInfo",
            Command::AecDump { .. } => "AecDump",
            Command::RemoveCallback(_) => "RemoveCallback",
            Command::Stop => "Stop",
        };
        f.write_str(name)
    }
}

/// One encoded command frame: a length prefix, the command tag, then the
/// packed payload. Handle fields ride along as pointer values since both
/// ends live in the same process; nothing here is ever persisted.
pub(crate) struct Msg {
    buf: [u8; MAX_MSG_LEN],
    len: usize,
}

impl Msg {
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

struct MsgWriter {
    buf: [u8; MAX_MSG_LEN],
    len: usize,
}

impl MsgWriter {
    fn new(id: CommandId) -> Self {
        let mut w = Self {
            buf: [0; MAX_MSG_LEN],
            len: LEN_BYTES,
        };
        w.put_u32(id as u32);
        w
    }

    fn put_u32(&mut self, v: u32) {
        self.buf[self.len..self.len + 4].copy_from_slice(&v.to_ne_bytes());
        self.len += 4;
    }

    fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    fn put_u64(&mut self, v: u64) {
        self.buf[self.len..self.len + 8].copy_from_slice(&v.to_ne_bytes());
        self.len += 8;
    }

    fn finish(mut self) -> Msg {
        self.buf[..LEN_BYTES].copy_from_slice(&(self.len as u32).to_ne_bytes());
        Msg {
            buf: self.buf,
            len: self.len,
        }
    }
}

struct MsgReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MsgReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: HDR_BYTES,
        }
    }

    fn get_u32(&mut self) -> io::Result<u32> {
        if self.pos + 4 > self.buf.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let v = u32::from_ne_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    fn get_i32(&mut self) -> io::Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    fn get_u64(&mut self) -> io::Result<u64> {
        if self.pos + 8 > self.buf.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_ne_bytes(b))
    }
}

fn boxed_ptr<T>(v: T) -> u64 {
    Box::into_raw(Box::new(v)) as u64
}

/// Reclaim a value previously passed through `boxed_ptr`. Zero is the
/// encoded form of "no handle".
unsafe fn from_boxed_ptr<T>(raw: u64) -> Option<T> {
    if raw == 0 {
        return None;
    }
    // SAFETY: raw came out of boxed_ptr::<T> on the controller side of the
    // same process and is consumed exactly once here.
    Some(*unsafe { Box::from_raw(raw as *mut T) })
}

pub(crate) fn open_dev_msg(id: CommandId, dev: Arc<dyn Device>) -> Msg {
    let mut w = MsgWriter::new(id);
    w.put_u64(boxed_ptr(dev));
    w.finish()
}

pub(crate) fn add_stream_msg(stream: Arc<dyn Stream>, devs: Vec<Arc<dyn Device>>) -> Msg {
    let mut w = MsgWriter::new(CommandId::AddStream);
    w.put_u64(boxed_ptr(stream));
    w.put_u64(boxed_ptr(devs));
    w.finish()
}

pub(crate) fn disconnect_stream_msg(stream: Arc<dyn Stream>, dev: Option<Arc<dyn Device>>) -> Msg {
    let mut w = MsgWriter::new(CommandId::DisconnectStream);
    w.put_u64(boxed_ptr(stream));
    w.put_u64(dev.map_or(0, boxed_ptr));
    w.finish()
}

pub(crate) fn drain_stream_msg(stream: Arc<dyn Stream>) -> Msg {
    let mut w = MsgWriter::new(CommandId::DrainStream);
    w.put_u64(boxed_ptr(stream));
    w.finish()
}

pub(crate) fn dev_start_ramp_msg(dev: Arc<dyn Device>, request: RampRequest) -> Msg {
    let mut w = MsgWriter::new(CommandId::DevStartRamp);
    w.put_u64(boxed_ptr(dev));
    w.put_u32(request.to_u32());
    w.finish()
}

pub(crate) fn config_global_remix_msg(conv: Option<Box<dyn RemixConverter>>) -> Msg {
    let mut w = MsgWriter::new(CommandId::ConfigGlobalRemix);
    w.put_u64(conv.map_or(0, boxed_ptr));
    w.finish()
}

pub(crate) fn dump_thread_info_msg(info: *mut AudioDebugInfo) -> Msg {
    let mut w = MsgWriter::new(CommandId::DumpThreadInfo);
    w.put_u64(info as u64);
    w.finish()
}

pub(crate) fn aec_dump_msg(stream_id: u32, start: bool, fd: RawFd) -> Msg {
    let mut w = MsgWriter::new(CommandId::AecDump);
    w.put_u32(stream_id);
    w.put_u32(start as u32);
    w.put_i32(fd);
    w.finish()
}

pub(crate) fn rm_callback_msg(fd: RawFd) -> Msg {
    let mut w = MsgWriter::new(CommandId::RemoveCallback);
    w.put_i32(fd);
    w.finish()
}

pub(crate) fn stop_msg() -> Msg {
    MsgWriter::new(CommandId::Stop).finish()
}

/// Encode a displaced remix converter for the response pipe.
pub(crate) fn remix_response(conv: Option<Box<dyn RemixConverter>>) -> u64 {
    conv.map_or(0, boxed_ptr)
}

/// Reclaim the converter a CONFIG_GLOBAL_REMIX response carried.
pub(crate) fn reclaim_remix(raw: u64) -> Option<Box<dyn RemixConverter>> {
    unsafe { from_boxed_ptr::<Box<dyn RemixConverter>>(raw) }
}

/// Read one complete frame from the command pipe into `buf`. The length
/// prefix is read first; a frame larger than the buffer is ENOMEM.
pub(crate) fn read_frame(fd: RawFd, buf: &mut [u8; MAX_MSG_LEN]) -> io::Result<usize> {
    pipe::read_exact(fd, &mut buf[..LEN_BYTES])?;
    let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_MSG_LEN {
        return Err(io::Error::from_raw_os_error(libc::ENOMEM));
    }
    if len < HDR_BYTES {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    pipe::read_exact(fd, &mut buf[LEN_BYTES..len])?;
    Ok(len)
}

pub(crate) fn frame_id(frame: &[u8]) -> u32 {
    u32::from_ne_bytes([frame[4], frame[5], frame[6], frame[7]])
}

/// Decode a frame into a command, reclaiming any handle fields. Frames
/// must come from the encoders above; that is the command pipe's ABI.
pub(crate) fn decode(frame: &[u8]) -> io::Result<Command> {
    let einval = || io::Error::from_raw_os_error(libc::EINVAL);
    let id = CommandId::from_u32(frame_id(frame)).ok_or_else(einval)?;
    let mut r = MsgReader::new(frame);
    let cmd = match id {
        CommandId::AddOpenDev => Command::AddOpenDev(take_dev(r.get_u64()?)?),
        CommandId::RmOpenDev => Command::RmOpenDev(take_dev(r.get_u64()?)?),
        CommandId::IsDevOpen => Command::IsDevOpen(take_dev(r.get_u64()?)?),
        CommandId::AddStream => {
            let stream = take_stream(r.get_u64()?)?;
            let devs = unsafe { from_boxed_ptr::<Vec<Arc<dyn Device>>>(r.get_u64()?) }
                .ok_or_else(einval)?;
            Command::AddStream { stream, devs }
        }
        CommandId::DisconnectStream => {
            let stream = take_stream(r.get_u64()?)?;
            let dev = unsafe { from_boxed_ptr::<Arc<dyn Device>>(r.get_u64()?) };
            Command::DisconnectStream { stream, dev }
        }
        CommandId::DrainStream => Command::DrainStream(take_stream(r.get_u64()?)?),
        CommandId::DevStartRamp => {
            let dev = take_dev(r.get_u64()?)?;
            let request = RampRequest::from_u32(r.get_u32()?).ok_or_else(einval)?;
            Command::DevStartRamp { dev, request }
        }
        CommandId::ConfigGlobalRemix => Command::ConfigGlobalRemix(unsafe {
            from_boxed_ptr::<Box<dyn RemixConverter>>(r.get_u64()?)
        }),
        CommandId::DumpThreadInfo => {
            let raw = r.get_u64()?;
            if raw == 0 {
                return Err(einval());
            }
            Command::DumpThreadInfo(raw as *mut AudioDebugInfo)
        }
        CommandId::AecDump => Command::AecDump {
            stream_id: r.get_u32()?,
            start: r.get_u32()? != 0,
            fd: r.get_i32()?,
        },
        CommandId::RemoveCallback => Command::RemoveCallback(r.get_i32()?),
        CommandId::Stop => Command::Stop,
    };
    Ok(cmd)
}

fn take_dev(raw: u64) -> io::Result<Arc<dyn Device>> {
    unsafe { from_boxed_ptr::<Arc<dyn Device>>(raw) }
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
}

fn take_stream(raw: u64) -> io::Result<Arc<dyn Stream>> {
    unsafe { from_boxed_ptr::<Arc<dyn Stream>>(raw) }
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
}

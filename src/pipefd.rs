use crate::descriptor::{descriptor_ref, Descriptor, DescriptorRef};
use crate::errors::{Error, Result};
use nix::{fcntl::OFlag, unistd::pipe2};
use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use tracing::trace;

const DRAIN_BUF_SIZE: usize = 2048;

// returns (read_end_fd, write_end_fd) of a pipe with CLOEXEC flag set
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut flags = OFlag::empty();
    flags.set(OFlag::O_CLOEXEC, true);
    pipe2(flags).map_err(|e| Error::os("pipe2", e))
}

/// The two ends of one OS pipe, shared by the pair of endpoint objects
/// created for it. The pipe syscall itself is deferred until either
/// endpoint is first opened, so a pair that is never opened never consumes
/// an OS resource. Each endpoint owns and tears down only its own side.
#[derive(Default)]
struct PipeChannel {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
    created: bool,
}

impl PipeChannel {
    fn create(&mut self) -> Result<()> {
        if self.created {
            return Ok(());
        }
        let (r, w) = cloexec_pipe()?;
        trace!(read_fd = r.as_raw_fd(), write_fd = w.as_raw_fd(), "created pipe");
        self.read = Some(r);
        self.write = Some(w);
        self.created = true;
        Ok(())
    }
}

type PipeChannelRef = Rc<RefCell<PipeChannel>>;

/// Read end of an OS pipe. Constructed unlinked; [`link()`] pairs it with a
/// [`PipeWriteFd`] (or use [`pipe_pair()`] for a pre-linked pair).
#[derive(Default)]
pub struct PipeReadFd {
    channel: Option<PipeChannelRef>,
}

impl PipeReadFd {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Write end of an OS pipe. See [`PipeReadFd`].
#[derive(Default)]
pub struct PipeWriteFd {
    channel: Option<PipeChannelRef>,
}

impl PipeWriteFd {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Descriptor for PipeReadFd {
    fn fd(&self) -> Option<RawFd> {
        let channel = self.channel.as_ref()?;
        let fd = channel.borrow().read.as_ref().map(|fd| fd.as_raw_fd());
        fd
    }

    fn open(&mut self) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or(Error::Usage("pipe endpoint opened before being linked"))?;
        channel.borrow_mut().create()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.as_ref() {
            channel.borrow_mut().read.take();
        }
        Ok(())
    }
}

impl Descriptor for PipeWriteFd {
    fn fd(&self) -> Option<RawFd> {
        let channel = self.channel.as_ref()?;
        let fd = channel.borrow().write.as_ref().map(|fd| fd.as_raw_fd());
        fd
    }

    fn open(&mut self) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or(Error::Usage("pipe endpoint opened before being linked"))?;
        channel.borrow_mut().create()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.as_ref() {
            channel.borrow_mut().write.take();
        }
        Ok(())
    }
}

/// Pairs a read endpoint with a write endpoint as the two ends of one (not
/// yet created) OS pipe. An endpoint may be linked exactly once; a second
/// link on either side is a usage error.
pub fn link(read_end: &mut PipeReadFd, write_end: &mut PipeWriteFd) -> Result<()> {
    if read_end.channel.is_some() || write_end.channel.is_some() {
        return Err(Error::Usage("pipe endpoint is already linked"));
    }
    let channel = Rc::new(RefCell::new(PipeChannel::default()));
    read_end.channel = Some(Rc::clone(&channel));
    write_end.channel = Some(channel);
    Ok(())
}

/// Creates a linked pipe endpoint pair, returned as `(read, write)` shared
/// descriptor handles. The pipe itself is created when either side is first
/// opened.
pub fn pipe_pair() -> (DescriptorRef, DescriptorRef) {
    let mut read_end = PipeReadFd::new();
    let mut write_end = PipeWriteFd::new();
    link(&mut read_end, &mut write_end).expect("fresh pipe endpoints should link");
    (descriptor_ref(read_end), descriptor_ref(write_end))
}

/// Caller-side handle to an in-memory buffer filled by a capture
/// redirection. Clone it, hand one clone to the pipeline, and read the
/// bytes out after the pipeline has run.
#[derive(Clone, Default)]
pub struct Capture(Rc<RefCell<Vec<u8>>>);

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// The captured bytes, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    /// A copy of the captured bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    fn store(&self, data: Vec<u8>) {
        *self.0.borrow_mut() = data;
    }
}

fn drain(fd: OwnedFd) -> Result<Vec<u8>> {
    let mut file = File::from(fd);
    let mut collected = Vec::new();
    let mut buf = [0u8; DRAIN_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::os_io("read", "pipe", e))?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    Ok(collected)
}

/// Write end of a private pipe whose read end drains into a [`Capture`]
/// buffer. Bind it to a process's stdout or stderr slot; when the parent
/// closes the slot after spawning, this endpoint reads the child's output
/// to exhaustion and stores it in the buffer. The drain happens exactly
/// once, on the close that releases the write side.
pub struct CaptureWriteFd {
    channel: PipeChannelRef,
    sink: Capture,
}

impl CaptureWriteFd {
    pub fn new(sink: Capture) -> Self {
        Self {
            channel: Rc::new(RefCell::new(PipeChannel::default())),
            sink,
        }
    }
}

impl Descriptor for CaptureWriteFd {
    fn fd(&self) -> Option<RawFd> {
        let fd = self.channel.borrow().write.as_ref().map(|fd| fd.as_raw_fd());
        fd
    }

    fn open(&mut self) -> Result<()> {
        self.channel.borrow_mut().create()
    }

    fn close(&mut self) -> Result<()> {
        // the parent's write copy must go first, or the drain below never
        // sees EOF
        let Some(write_fd) = self.channel.borrow_mut().write.take() else {
            return Ok(());
        };
        drop(write_fd);
        let Some(read_fd) = self.channel.borrow_mut().read.take() else {
            return Ok(());
        };
        let collected = drain(read_fd)?;
        trace!(bytes = collected.len(), "captured child output");
        self.sink.store(collected);
        Ok(())
    }
}

/// Read end of a private pipe pre-loaded with a payload. Bind it to a
/// process's stdin slot; opening it creates the pipe, writes the whole
/// payload, and releases the write side so the child sees end-of-stream
/// after the payload.
///
/// The payload is written before the child exists, so payloads larger than
/// the kernel pipe capacity block the opening call.
pub struct FeedReadFd {
    channel: PipeChannelRef,
    data: Vec<u8>,
}

impl FeedReadFd {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: Rc::new(RefCell::new(PipeChannel::default())),
            data: data.into(),
        }
    }
}

impl Descriptor for FeedReadFd {
    fn fd(&self) -> Option<RawFd> {
        let fd = self.channel.borrow().read.as_ref().map(|fd| fd.as_raw_fd());
        fd
    }

    fn open(&mut self) -> Result<()> {
        if self.channel.borrow().created {
            return Ok(());
        }
        self.channel.borrow_mut().create()?;
        let write_fd = self
            .channel
            .borrow_mut()
            .write
            .take()
            .expect("freshly created pipe should have a write side");
        let mut file = File::from(write_fd);
        file.write_all(&self.data)
            .map_err(|e| Error::os_io("write", "pipe", e))?;
        trace!(bytes = self.data.len(), "fed input payload");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.channel.borrow_mut().read.take();
        Ok(())
    }
}

use crate::errors::{Error, Result};
use std::cell::RefCell;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::trace;

/// Shared handle to a descriptor. Process slots hold these, and two slots
/// may hold the same handle: binding stderr to the same object as stdout is
/// how output aliasing is represented. Close-idempotence then operates on
/// the one underlying resource, never on a second fd with the same value.
pub type DescriptorRef = Rc<RefCell<dyn Descriptor>>;

/// Capability over one I/O endpoint that can be bound to a child's standard
/// stream: an inherited standard stream, a file, a pipe end, or a
/// buffer-bridging pipe end.
///
/// The lifecycle contract is what [`Process::execute()`](crate::Process::execute)
/// relies on: `open()` establishes the OS resource and is a no-op when
/// already open; `fd()` reports the current descriptor value (`None` until
/// opened, and again once closed); `close()` releases the resource, is a
/// no-op when there is nothing to release, and performs any teardown side
/// effect (a capture descriptor drains its pipe into its buffer) exactly
/// once per resource lifetime.
pub trait Descriptor {
    /// Current OS descriptor value. `None` while unopened or after close.
    fn fd(&self) -> Option<RawFd>;

    /// True iff this object currently owns a real, closable resource.
    /// False for the inherited standard streams, always.
    fn closable(&self) -> bool {
        self.fd().is_some()
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Wraps a descriptor in the shared handle type used by process slots.
pub fn descriptor_ref<T: Descriptor + 'static>(d: T) -> DescriptorRef {
    Rc::new(RefCell::new(d))
}

/// A descriptor the parent already holds, passed through to the child
/// untouched: one of the standard streams, or any other raw fd the caller
/// wants a child stream bound to. Never closable; this object does not own
/// the fd, and open and close are no-ops.
pub struct InheritedFd {
    fd: RawFd,
}

impl InheritedFd {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl Descriptor for InheritedFd {
    fn fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }

    fn closable(&self) -> bool {
        false
    }
}

thread_local! {
    static STDIN_FD: DescriptorRef = descriptor_ref(InheritedFd::new(nix::libc::STDIN_FILENO));
    static STDOUT_FD: DescriptorRef = descriptor_ref(InheritedFd::new(nix::libc::STDOUT_FILENO));
    static STDERR_FD: DescriptorRef = descriptor_ref(InheritedFd::new(nix::libc::STDERR_FILENO));
}

/// The shared stdin singleton. Created once and reused; every process slot
/// that inherits stdin holds the same handle.
pub fn std_in() -> DescriptorRef {
    STDIN_FD.with(Rc::clone)
}

/// The shared stdout singleton.
pub fn std_out() -> DescriptorRef {
    STDOUT_FD.with(Rc::clone)
}

/// The shared stderr singleton.
pub fn std_err() -> DescriptorRef {
    STDERR_FD.with(Rc::clone)
}

/// How a [`FileFd`] opens its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Read-only.
    Read,
    /// Write-only; created if absent, truncated if present.
    Truncate,
    /// Write-only; created if absent, appended to if present.
    Append,
}

/// Descriptor backed by a path on disk, opened lazily when a process slot
/// is prepared for spawning. Dropping an open `FileFd` closes it.
pub struct FileFd {
    path: PathBuf,
    mode: FileMode,
    fd: Option<OwnedFd>,
}

impl FileFd {
    pub fn new(path: impl Into<PathBuf>, mode: FileMode) -> Self {
        Self {
            path: path.into(),
            mode,
            fd: None,
        }
    }
}

impl Descriptor for FileFd {
    fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn open(&mut self) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        let mut opts = OpenOptions::new();
        match self.mode {
            FileMode::Read => opts.read(true),
            FileMode::Truncate => opts.write(true).create(true).truncate(true),
            FileMode::Append => opts.write(true).create(true).append(true),
        };
        let file = opts
            .open(&self.path)
            .map_err(|e| Error::os_io("open", self.path.display().to_string(), e))?;
        trace!(path = %self.path.display(), mode = ?self.mode, "opened file descriptor");
        self.fd = Some(file.into());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // drop closes; repeated calls find nothing to take
        self.fd.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn standard_streams_are_shared_singletons() {
        assert!(Rc::ptr_eq(&std_in(), &std_in()));
        assert_eq!(std_out().borrow().fd(), Some(1));
        assert!(!std_err().borrow().closable());
        // closing a standard stream is a no-op
        std_err().borrow_mut().close().unwrap();
        assert_eq!(std_err().borrow().fd(), Some(2));
    }

    #[test]
    fn file_fd_opens_lazily_and_closes_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let mut f = FileFd::new(&path, FileMode::Truncate);
        assert_eq!(f.fd(), None);
        assert!(!f.closable());

        f.open().unwrap();
        let fd = f.fd().expect("open file should have an fd");
        assert!(fd >= 0);
        assert!(f.closable());
        // re-open is a no-op on the same fd
        f.open().unwrap();
        assert_eq!(f.fd(), Some(fd));

        f.close().unwrap();
        assert_eq!(f.fd(), None);
        f.close().unwrap();
    }

    #[test]
    fn truncate_mode_clobbers_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"previous").unwrap();

        let mut f = FileFd::new(&path, FileMode::Truncate);
        f.open().unwrap();
        let mut file = std::fs::File::from(f.fd.take().unwrap());
        file.write_all(b"new").unwrap();
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn missing_file_is_an_os_error_naming_the_path() {
        let mut f = FileFd::new("/nonexistent/really/not/here", FileMode::Read);
        let err = f.open().unwrap_err();
        match err {
            Error::Os { call, detail, .. } => {
                assert_eq!(call, "open");
                assert!(detail.unwrap().contains("nonexistent"));
            }
            other => panic!("expected os error, got {other:?}"),
        }
    }
}

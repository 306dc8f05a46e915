use crate::errors::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::{self, execvp, execvpe, fork, pipe2, ForkResult, Pid};
use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::Read;
use std::os::fd::{OwnedFd, RawFd};
use tracing::debug;

/// Ordered descriptor actions applied in the child between fork and exec:
/// first every `dup2` onto a standard slot, then every close. Close actions
/// are deduplicated by descriptor value, since an aliased stdout/stderr
/// pair shares one fd and closing it twice would be an error.
#[derive(Default)]
pub struct FileActions {
    dups: Vec<(RawFd, RawFd)>,
    closes: Vec<RawFd>,
}

impl FileActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `dup2(fd, slot)`, wiring `fd` onto a standard stream slot.
    pub fn add_dup(&mut self, fd: RawFd, slot: RawFd) {
        self.dups.push((fd, slot));
    }

    /// Records a close of `fd`. A second close of the same value is
    /// silently dropped.
    pub fn add_close(&mut self, fd: RawFd) {
        if !self.closes.contains(&fd) {
            self.closes.push(fd);
        }
    }
}

// Runs between fork and exec, so only async-signal-safe calls. Returns the
// failing errno; on success the exec does not return.
fn exec_child(
    program: &CStr,
    argv: &[CString],
    env: Option<&[CString]>,
    actions: &FileActions,
) -> Errno {
    for &(fd, slot) in &actions.dups {
        if let Err(e) = unistd::dup2(fd, slot) {
            return e;
        }
    }
    for &fd in &actions.closes {
        let _ = unistd::close(fd);
    }
    let err: std::result::Result<Infallible, Errno> = match env {
        Some(env) => execvpe(program, argv, env),
        None => execvp(program, argv),
    };
    match err {
        Err(e) => e,
        Ok(never) => match never {},
    }
}

/// Spawns `program` with `argv`, applying `actions` in the child before the
/// exec. With `env` set the child gets exactly that environment; otherwise
/// it inherits the parent's.
///
/// Exec failures in the child are reported back over a CLOEXEC status
/// pipe: end-of-stream on it means the exec succeeded, an errno payload
/// means it did not, in which case the dead child is reaped here and an OS
/// error naming the program is returned.
pub fn spawn(
    program: &CStr,
    argv: &[CString],
    env: Option<&[CString]>,
    actions: &FileActions,
) -> Result<Pid> {
    let (status_r, status_w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::os("pipe2", e))?;
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(status_r);
            let errno = exec_child(program, argv, env, actions);
            let _ = unistd::write(&status_w, &(errno as i32).to_ne_bytes());
            unsafe { nix::libc::_exit(127) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(status_w);
            wait_for_exec(status_r, child, program)?;
            debug!(pid = child.as_raw(), program = ?program, "spawned child");
            Ok(child)
        }
        Err(e) => Err(Error::os("fork", e)),
    }
}

fn wait_for_exec(status_r: OwnedFd, child: Pid, program: &CStr) -> Result<()> {
    let mut buf = [0u8; 4];
    let mut pipe = File::from(status_r);
    match pipe.read_exact(&mut buf) {
        // the exec wiped the status pipe's write end without writing
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(()),
        Err(e) => Err(Error::os_io("read", "spawn status pipe", e)),
        Ok(()) => {
            let _ = nix::sys::wait::waitpid(child, None);
            let errno = Errno::from_raw(i32::from_ne_bytes(buf));
            Err(Error::os_detail(
                "execvp",
                program.to_string_lossy().into_owned(),
                errno,
            ))
        }
    }
}

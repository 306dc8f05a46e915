use crate::descriptor::{std_err, std_in, std_out, DescriptorRef};
use crate::envconfig::Environment;
use crate::errors::{Error, Result};
use crate::spawn::{self, FileActions};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::ffi::CString;
use std::os::fd::RawFd;
use tracing::debug;

// Boundary to the word-expansion collaborator: one command string in,
// program plus argv out. Tokenization only; globbing and variable
// expansion are the caller's business.
fn expand_words(cmd: &str) -> Result<Vec<CString>> {
    let words =
        shlex::split(cmd).ok_or(Error::Usage("command string could not be tokenized"))?;
    if words.is_empty() {
        return Err(Error::Usage("command string expands to no words"));
    }
    words
        .into_iter()
        .map(|w| CString::new(w).map_err(|_| Error::Usage("command word contains a NUL byte")))
        .collect()
}

/// One spawnable child process: a command string plus the three descriptors
/// its standard streams will be bound to. The slots default to the
/// process-wide standard stream singletons, and a slot may share its
/// descriptor with another slot (stderr bound to the same object as
/// stdout).
///
/// Lifecycle is created, then [`execute()`](Self::execute), then
/// [`wait()`](Self::wait); waiting before a successful execute is a usage
/// error.
pub struct Process {
    cmd: String,
    stdin_fd: DescriptorRef,
    stdout_fd: DescriptorRef,
    stderr_fd: DescriptorRef,
    env: Option<Environment>,
    pid: Option<Pid>,
}

impl Process {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            stdin_fd: std_in(),
            stdout_fd: std_out(),
            stderr_fd: std_err(),
            env: None,
            pid: None,
        }
    }

    pub fn bind_stdin(&mut self, fd: DescriptorRef) {
        self.stdin_fd = fd;
    }

    pub fn bind_stdout(&mut self, fd: DescriptorRef) {
        self.stdout_fd = fd;
    }

    pub fn bind_stderr(&mut self, fd: DescriptorRef) {
        self.stderr_fd = fd;
    }

    /// Points the stdout slot at the stderr slot's descriptor. One shared
    /// object, never a second fd with the same value.
    pub fn stdout_to_stderr(&mut self) {
        self.stdout_fd = DescriptorRef::clone(&self.stderr_fd);
    }

    /// Points the stderr slot at the stdout slot's descriptor.
    pub fn stderr_to_stdout(&mut self) {
        self.stderr_fd = DescriptorRef::clone(&self.stdout_fd);
    }

    pub fn set_env(&mut self, env: Environment) {
        self.env = Some(env);
    }

    pub(crate) fn pid(&self) -> Option<Pid> {
        self.pid
    }

    fn prepare_slot(&self, fd: &DescriptorRef, slot: RawFd, actions: &mut FileActions) -> Result<()> {
        let mut d = fd.borrow_mut();
        d.open()?;
        let raw = d
            .fd()
            .ok_or(Error::Usage("descriptor produced no fd after open"))?;
        actions.add_dup(raw, slot);
        Ok(())
    }

    /// Spawns the child. For stdin, stdout, stderr in that fixed order the
    /// slot is opened and a dup onto the matching standard slot recorded;
    /// then one close action per closable descriptor, deduplicated by fd
    /// value; then the spawn itself. On success the parent-side copies of
    /// all three descriptors are closed, which is what lets the child see
    /// end-of-stream on a fed stdin and the parent collect the child's
    /// complete output. On failure no pid is recorded and the error names
    /// the program.
    pub fn execute(&mut self) -> Result<()> {
        let argv = expand_words(&self.cmd)?;
        let mut actions = FileActions::new();

        self.prepare_slot(&self.stdin_fd, nix::libc::STDIN_FILENO, &mut actions)?;
        self.prepare_slot(&self.stdout_fd, nix::libc::STDOUT_FILENO, &mut actions)?;
        self.prepare_slot(&self.stderr_fd, nix::libc::STDERR_FILENO, &mut actions)?;
        for fd in [&self.stdin_fd, &self.stdout_fd, &self.stderr_fd] {
            let d = fd.borrow();
            if d.closable() {
                if let Some(raw) = d.fd() {
                    actions.add_close(raw);
                }
            }
        }

        let pid = spawn::spawn(&argv[0], &argv, self.env.as_deref(), &actions)?;
        self.pid = Some(pid);
        debug!(pid = pid.as_raw(), cmd = %self.cmd, "process executing");

        // parent-side teardown; an aliased slot pair closes once, the
        // second call is a no-op
        self.stdin_fd.borrow_mut().close()?;
        self.stdout_fd.borrow_mut().close()?;
        self.stderr_fd.borrow_mut().close()?;
        Ok(())
    }

    /// Blocks until the child terminates and returns its POSIX exit status
    /// (0-255). A child killed by a signal reports 128 plus the signal
    /// number. Usage error if the process was never executed.
    pub fn wait(&mut self) -> Result<i32> {
        let pid = self
            .pid
            .ok_or(Error::Usage("wait() called before execute()"))?;
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!(pid = pid.as_raw(), code, "process exited");
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    debug!(pid = pid.as_raw(), ?signal, "process killed by signal");
                    return Ok(128 + signal as i32);
                }
                // not reachable without WUNTRACED/WCONTINUED, but harmless
                Ok(_) => continue,
                Err(e) => return Err(Error::os("waitpid", e)),
            }
        }
    }

    /// Best-effort SIGTERM to an executing child. Used to clean up
    /// already-spawned stages when a later stage of a pipeline fails to
    /// spawn. A child that already exited (ESRCH) is not an error.
    pub(crate) fn terminate(&self) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::os("kill", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{descriptor_ref, Descriptor};
    use crate::pipefd::{Capture, CaptureWriteFd, FeedReadFd};

    #[test]
    fn wait_before_execute_is_a_usage_error() {
        let mut p = Process::new("true");
        assert!(matches!(p.wait().unwrap_err(), Error::Usage(_)));
    }

    #[test]
    fn empty_command_is_a_usage_error() {
        let mut p = Process::new("   ");
        assert!(matches!(p.execute().unwrap_err(), Error::Usage(_)));
    }

    #[test]
    fn unbalanced_quoting_is_a_usage_error() {
        let mut p = Process::new("echo \"unterminated");
        assert!(matches!(p.execute().unwrap_err(), Error::Usage(_)));
    }

    #[test]
    fn spawn_failure_records_no_pid() {
        let mut p = Process::new("no-such-program-exists");
        let err = p.execute().unwrap_err();
        assert!(matches!(err, Error::Os { .. }));
        assert!(p.pid().is_none());
        assert!(matches!(p.wait().unwrap_err(), Error::Usage(_)));
    }

    #[test]
    fn execute_and_wait_report_the_exit_status() {
        let mut p = Process::new("sh -c 'exit 3'");
        p.execute().unwrap();
        assert_eq!(p.wait().unwrap(), 3);
    }

    #[test]
    fn quoted_words_survive_expansion() {
        let sink = Capture::new();
        let mut p = Process::new("echo 'one word' two");
        p.bind_stdout(descriptor_ref(CaptureWriteFd::new(sink.clone())));
        p.execute().unwrap();
        assert_eq!(p.wait().unwrap(), 0);
        assert_eq!(sink.bytes(), b"one word two\n");
    }

    #[test]
    fn fed_stdin_reaches_the_child_followed_by_eof() {
        let sink = Capture::new();
        let mut p = Process::new("cat");
        p.bind_stdin(descriptor_ref(FeedReadFd::new(&b"fed bytes"[..])));
        p.bind_stdout(descriptor_ref(CaptureWriteFd::new(sink.clone())));
        p.execute().unwrap();
        assert_eq!(p.wait().unwrap(), 0);
        assert_eq!(sink.bytes(), b"fed bytes");
    }

    #[test]
    fn aliased_stderr_shares_the_stdout_descriptor() {
        let sink = Capture::new();
        let mut p = Process::new("sh -c 'echo out; echo err >&2'");
        p.bind_stdout(descriptor_ref(CaptureWriteFd::new(sink.clone())));
        p.stderr_to_stdout();
        p.execute().unwrap();
        assert_eq!(p.wait().unwrap(), 0);
        assert_eq!(sink.bytes(), b"out\nerr\n");
    }

    #[test]
    fn parent_slots_are_closed_after_execute() {
        let sink = Capture::new();
        let out = descriptor_ref(CaptureWriteFd::new(sink.clone()));
        let mut p = Process::new("true");
        p.bind_stdout(DescriptorRef::clone(&out));
        p.execute().unwrap();
        assert_eq!(out.borrow().fd(), None);
        assert!(!out.borrow().closable());
        p.wait().unwrap();
    }
}

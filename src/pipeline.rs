use crate::descriptor::{descriptor_ref, DescriptorRef, FileFd, FileMode};
use crate::envconfig::Environment;
use crate::errors::{Error, Result};
use crate::pipefd::{pipe_pair, Capture, CaptureWriteFd, FeedReadFd};
use crate::process::Process;
use std::path::Path;
use tracing::debug;

/// An ordered chain of processes, adjacent ones joined by one OS pipe:
/// the pipe's write side is the earlier process's stdout slot and its read
/// side is the later process's stdin slot. Built entirely from combinators;
/// nothing is opened or spawned until [`status()`](Self::status) or
/// [`run()`](Self::run).
///
/// ```no_run
/// # use pipework::{Capture, Pipeline};
/// let out = Capture::new();
/// let status = (Pipeline::new("ls -1") | "sort -r")
///     .stdout_capture(&out)
///     .run()
///     .unwrap();
/// ```
///
/// Splicing consumes the appended pipeline, so a chain fragment cannot be
/// reused after it has been moved into a longer chain.
pub struct Pipeline {
    processes: Vec<Process>,
}

impl Pipeline {
    /// A one-process pipeline whose streams default to the parent's
    /// standard streams. The command string is split into words by the
    /// expansion collaborator at spawn time, not here.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            processes: vec![Process::new(cmd)],
        }
    }

    fn first_mut(&mut self) -> &mut Process {
        self.processes
            .first_mut()
            .expect("pipeline should never be empty")
    }

    fn last_mut(&mut self) -> &mut Process {
        self.processes
            .last_mut()
            .expect("pipeline should never be empty")
    }

    /// Number of processes currently chained.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Splices `other` onto the end of this pipeline through a fresh pipe
    /// pair: this pipeline's last stdout feeds `other`'s first stdin.
    /// `other`'s processes are moved in; the pipe itself is created only
    /// when the joined processes spawn.
    pub fn pipe(mut self, mut other: Pipeline) -> Self {
        let (read_end, write_end) = pipe_pair();
        other.first_mut().bind_stdin(read_end);
        self.last_mut().bind_stdout(write_end);
        self.processes.append(&mut other.processes);
        self
    }

    /// Binds the first process's stdin to an explicit descriptor.
    pub fn stdin_descriptor(mut self, fd: DescriptorRef) -> Self {
        self.first_mut().bind_stdin(fd);
        self
    }

    /// First process reads its stdin from a file.
    pub fn stdin_path(self, path: impl AsRef<Path>) -> Self {
        self.stdin_descriptor(descriptor_ref(FileFd::new(path.as_ref(), FileMode::Read)))
    }

    /// First process reads exactly these bytes on stdin, then
    /// end-of-stream.
    pub fn stdin_bytes(self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_descriptor(descriptor_ref(FeedReadFd::new(data)))
    }

    /// Binds the last process's stdout to an explicit descriptor.
    pub fn stdout_descriptor(mut self, fd: DescriptorRef) -> Self {
        self.last_mut().bind_stdout(fd);
        self
    }

    /// Last process writes its stdout to a file, truncating prior
    /// contents.
    pub fn stdout_path(self, path: impl AsRef<Path>) -> Self {
        self.stdout_descriptor(descriptor_ref(FileFd::new(path.as_ref(), FileMode::Truncate)))
    }

    /// Last process appends its stdout to a file.
    pub fn stdout_append(self, path: impl AsRef<Path>) -> Self {
        self.stdout_descriptor(descriptor_ref(FileFd::new(path.as_ref(), FileMode::Append)))
    }

    /// Captures the last process's stdout into an in-memory buffer,
    /// available from the [`Capture`] handle after the pipeline has run.
    pub fn stdout_capture(self, sink: &Capture) -> Self {
        self.stdout_descriptor(descriptor_ref(CaptureWriteFd::new(sink.clone())))
    }

    /// Binds the last process's stderr to an explicit descriptor.
    pub fn stderr_descriptor(mut self, fd: DescriptorRef) -> Self {
        self.last_mut().bind_stderr(fd);
        self
    }

    /// Last process writes its stderr to a file, truncating prior
    /// contents.
    pub fn stderr_path(self, path: impl AsRef<Path>) -> Self {
        self.stderr_descriptor(descriptor_ref(FileFd::new(path.as_ref(), FileMode::Truncate)))
    }

    /// Last process appends its stderr to a file.
    pub fn stderr_append(self, path: impl AsRef<Path>) -> Self {
        self.stderr_descriptor(descriptor_ref(FileFd::new(path.as_ref(), FileMode::Append)))
    }

    /// Captures the last process's stderr into an in-memory buffer.
    pub fn stderr_capture(self, sink: &Capture) -> Self {
        self.stderr_descriptor(descriptor_ref(CaptureWriteFd::new(sink.clone())))
    }

    /// Sends the last process's stderr wherever its stdout goes, by
    /// sharing the stdout slot's descriptor object.
    pub fn stderr_to_stdout(mut self) -> Self {
        self.last_mut().stderr_to_stdout();
        self
    }

    /// Sends the last process's stdout wherever its stderr goes.
    pub fn stdout_to_stderr(mut self) -> Self {
        self.last_mut().stdout_to_stderr();
        self
    }

    /// Every process in the pipeline spawns with this environment instead
    /// of inheriting the parent's.
    pub fn env(mut self, env: Environment) -> Self {
        for process in &mut self.processes {
            process.set_env(env.clone());
        }
        self
    }

    /// Runs the pipeline and returns the exit status of its final process.
    /// A nonzero status is an ordinary return value here, and only the
    /// final process's status counts: `false | cat` reports 0, matching
    /// shell pipeline convention.
    ///
    /// Every process is spawned before any is waited on. The two phases
    /// must not interleave: a downstream pipe is created only when its own
    /// process spawns, and an upstream child may already be blocked
    /// writing into a pipe whose reader does not exist yet.
    ///
    /// If a stage fails to spawn, the stages already running are sent
    /// SIGTERM and reaped before the error propagates.
    pub fn status(mut self) -> Result<i32> {
        debug!(stages = self.processes.len(), "pipeline spawn phase");
        for i in 0..self.processes.len() {
            if let Err(e) = self.processes[i].execute() {
                self.cleanup_spawned(i);
                return Err(e);
            }
        }
        debug!("pipeline reap phase");
        let mut status = 0;
        for process in &mut self.processes {
            status = process.wait()?;
        }
        Ok(status)
    }

    /// Like [`status()`](Self::status), but a nonzero final status becomes
    /// [`Error::Command`] carrying it.
    pub fn run(self) -> Result<i32> {
        let status = self.status()?;
        if status != 0 {
            return Err(Error::Command(status));
        }
        Ok(status)
    }

    // A stage failed to spawn; stages before `failed` are live and would
    // be orphaned if simply dropped.
    fn cleanup_spawned(&mut self, failed: usize) {
        debug!(spawned = failed, "terminating already-spawned pipeline stages");
        for process in &self.processes[..failed] {
            let _ = process.terminate();
        }
        for process in &mut self.processes[..failed] {
            let _ = process.wait();
        }
    }
}

impl From<&str> for Pipeline {
    fn from(cmd: &str) -> Self {
        Self::new(cmd)
    }
}

impl From<String> for Pipeline {
    fn from(cmd: String) -> Self {
        Self::new(cmd)
    }
}

impl<T: Into<Pipeline>> std::ops::BitOr<T> for Pipeline {
    type Output = Pipeline;

    /// `a | b` splices as [`Pipeline::pipe`] does; the right-hand side may
    /// be another pipeline or a command string.
    fn bitor(self, rhs: T) -> Pipeline {
        self.pipe(rhs.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_moves_the_other_chain_in() {
        let a = Pipeline::new("cat") | "tr a b";
        assert_eq!(a.len(), 2);
        let b = Pipeline::new("sort") | "uniq";
        let joined = a.pipe(b);
        assert_eq!(joined.len(), 4);
    }

    #[test]
    fn building_a_pipeline_spawns_nothing() {
        // a chain that is never run must not create pipes or children;
        // dropping it here must be inert
        let p = Pipeline::new("no-such-program-exists") | "also-not-real";
        assert_eq!(p.len(), 2);
    }
}

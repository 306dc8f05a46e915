use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

/// All failures surfaced by this crate fall into one of three classes:
/// misuse of the API, a failed syscall, or a pipeline whose final process
/// exited nonzero. Only [`Pipeline::run()`](crate::Pipeline::run) produces
/// the last kind; the non-throwing [`Pipeline::status()`](crate::Pipeline::status)
/// reports a nonzero exit as an ordinary value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An erroneous call was made to the library: linking a pipe endpoint
    /// that is already linked, waiting on a process that was never
    /// executed, and the like. Never retried.
    #[error("usage error: {0}")]
    Usage(&'static str),
    /// A syscall failed. Carries the name of the originating call, the OS
    /// error code, and, where it helps (exec, file open), the program or
    /// path involved.
    #[error("{} failed: {source}", os_context(.call, .detail))]
    Os {
        call: &'static str,
        detail: Option<String>,
        #[source]
        source: Errno,
    },
    /// The pipeline ran to completion but its final process exited with
    /// the carried nonzero status.
    #[error("command exited with status {0}")]
    Command(i32),
}

fn os_context(call: &str, detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!("{call} {detail}"),
        None => call.to_string(),
    }
}

impl Error {
    pub(crate) fn os(call: &'static str, source: Errno) -> Self {
        Self::Os {
            call,
            detail: None,
            source,
        }
    }

    pub(crate) fn os_detail(call: &'static str, detail: impl Into<String>, source: Errno) -> Self {
        Self::Os {
            call,
            detail: Some(detail.into()),
            source,
        }
    }

    // File opens go through std; recover the errno so the OS class stays
    // uniform for callers matching on the error code.
    pub(crate) fn os_io(call: &'static str, detail: impl Into<String>, err: std::io::Error) -> Self {
        let errno = err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO);
        Self::os_detail(call, detail, errno)
    }

    /// The OS error code, for [`Error::Os`] values.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Os { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// The exit status carried by an [`Error::Command`].
    pub fn status(&self) -> Option<i32> {
        match self {
            Self::Command(status) => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_reports_call_and_detail() {
        let e = Error::os_detail("execvp", "nosuch", Errno::ENOENT);
        let msg = e.to_string();
        assert!(msg.contains("execvp"), "{msg}");
        assert!(msg.contains("nosuch"), "{msg}");
        assert_eq!(e.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn io_error_round_trips_errno() {
        let io = std::io::Error::from_raw_os_error(Errno::EACCES as i32);
        let e = Error::os_io("open", "/root/x", io);
        assert_eq!(e.errno(), Some(Errno::EACCES));
    }

    #[test]
    fn command_error_carries_status() {
        assert_eq!(Error::Command(7).status(), Some(7));
        assert_eq!(Error::Usage("nope").status(), None);
    }
}

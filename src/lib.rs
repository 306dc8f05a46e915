//! Describe a pipeline of child processes the way a shell does, wire their
//! standard streams to files, in-memory buffers, or each other, then spawn
//! the whole chain and reap it. [`Pipeline`] is the heart of this crate:
//! build one from a command string, splice chains together with
//! [`Pipeline::pipe()`] or the `|` operator, and bind endpoints with the
//! redirection methods. The [`descriptor`] module holds the capability
//! trait every endpoint kind implements, [`pipefd`] the lazily created
//! pipe pairs and the buffer-bridging endpoints, and [`envconfig`] a
//! builder for child process environments.
//!
//! Nothing touches the OS until a pipeline runs. At that point every
//! process is spawned in order (opening its endpoints, duplicating them
//! onto the child's standard slots, and closing the parent's copies), and
//! only after the whole chain is up is any process waited on. Unix only.
//!
//! ```no_run
//! use pipework::{Capture, Pipeline};
//!
//! let out = Capture::new();
//! (Pipeline::new("echo hello") | "tr a-z A-Z")
//!     .stdout_capture(&out)
//!     .run()
//!     .unwrap();
//! assert_eq!(out.take(), b"HELLO\n");
//! ```

/// Capability trait over I/O endpoints, the shared standard stream
/// singletons, and the file-backed endpoint.
pub mod descriptor;
/// Types for building the environment variables of a child process.
pub mod envconfig;
/// The error taxonomy: API misuse, failed syscalls, and nonzero pipeline
/// exits.
pub mod errors;
/// Pipe endpoint pairs with deferred creation, and the endpoints that
/// bridge a pipe to an in-memory buffer.
pub mod pipefd;
/// One spawnable process bound to three endpoints, with the
/// create/execute/wait lifecycle.
pub mod process;
/// The spawn collaborator: fork, apply descriptor actions, exec, report
/// failure.
pub mod spawn;

/// Ordered chains of processes joined by pipes, with redirection and the
/// two-phase run/reap orchestration.
pub mod pipeline;

// re-exports
pub use descriptor::{
    descriptor_ref, std_err, std_in, std_out, DescriptorRef, FileFd, FileMode, InheritedFd,
};
pub use errors::{Error, Result};
pub use pipefd::Capture;
pub use pipeline::Pipeline;
pub use process::Process;

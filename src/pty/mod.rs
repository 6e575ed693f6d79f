//! Platform PTY primitive and process launcher
//!
//! One backend is compiled per target:
//!
//! - `unix`: a `/dev/ptmx` master/slave pair and a forked child whose
//!   controlling terminal is the slave. One bidirectional master descriptor.
//! - `windows`: a pseudo console fed by two anonymous pipes and a process
//!   created through an attribute list. Separate read and write endpoints plus
//!   the console object.
//!
//! Both hand back the same three pieces: a [`PtyBackend`] for write/resize,
//! the read endpoint for the output pump, and a [`ChildReaper`].

use std::fs::File;
use std::io;
use std::sync::Arc;

use crate::sink::ExitStatus;
use crate::size::WindowSize;

#[cfg_attr(not(windows), allow(dead_code))]
mod marshal;

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::EXEC_FAILED_EXIT_CODE;
#[cfg(unix)]
pub(crate) use unix::{is_end_of_stream, launch, NativePty, NativeReaper};

#[cfg(windows)]
pub(crate) use windows::{is_end_of_stream, launch, NativePty, NativeReaper};

/// Write side and control surface of a live terminal.
///
/// Callers serialize access; implementations don't lock.
pub(crate) trait PtyBackend: Send {
    /// OS process id of the child
    fn pid(&self) -> u32;

    /// Forward all of `data` to the child's input
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn resize(&mut self, size: WindowSize) -> io::Result<()>;

    /// Geometry as the terminal object reports it
    fn current_size(&self) -> io::Result<WindowSize>;

    /// Ask the child to terminate (SIGHUP / closing the pseudo console)
    fn hangup(&mut self) -> io::Result<()>;

    /// Terminate the child unconditionally
    fn kill(&mut self) -> io::Result<()>;

    /// Release auxiliary resources once the pump is done or detached
    fn shutdown(&mut self);
}

/// Collects the child's exit status for the output pump.
pub(crate) trait ChildReaper: Clone + Send + 'static {
    /// Block until the child has terminated, without releasing its process id
    fn wait(&mut self) -> io::Result<()>;

    /// Collect the exit status. Only called after `wait`, under the session's
    /// lifecycle lock.
    fn reap(&mut self) -> ExitStatus;
}

/// Result of a successful launch
pub(crate) struct Launched {
    pub backend: NativePty,
    /// Read endpoint for the pump. On POSIX the backend shares the same descriptor.
    pub reader: Arc<File>,
    pub reaper: NativeReaper,
}

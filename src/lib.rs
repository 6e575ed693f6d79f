//! ptyhost: cross-platform pseudo-terminal sessions
//!
//! Spawns a child process on a freshly allocated terminal, streams its output
//! to an [`EventSink`] from a background thread, and accepts input and resize
//! requests while it runs.
//!
//! - `pty`: POSIX pseudo-terminals (`/dev/ptmx` + fork/exec) or Windows
//!   pseudo consoles (ConPTY + `CreateProcessW`), one per target
//! - `session`: [`PtySession`], the handle owning one child and its terminal
//! - `sink`: delivery of output chunks and the exit notification
//!
//! ```no_run
//! use std::sync::Arc;
//! use ptyhost::{ChannelSink, PtySession, PtySpawnRequest, SessionEvent};
//!
//! let (sink, events) = ChannelSink::pair();
//! let request = PtySpawnRequest::new("/bin/sh").args(["-c", "echo hello"]);
//! let session = PtySession::create(request, Arc::new(sink))?;
//!
//! for event in events {
//!     match event {
//!         SessionEvent::Output(chunk) => print!("{}", String::from_utf8_lossy(&chunk.data)),
//!         SessionEvent::Exited(exit) => println!("[{}]", exit.status),
//!     }
//!     # break;
//! }
//! session.release();
//! # Ok::<(), ptyhost::PtyCreationError>(())
//! ```

pub mod config;
pub mod error;
pub mod request;
pub mod session;
pub mod sink;
pub mod size;

mod last_error;
mod pty;
mod pump;

pub use config::PtyConfig;
pub use error::{CreateResult, PtyCreationError, PtyIoError, PtyResult};
pub use last_error::last_error;
pub use request::PtySpawnRequest;
pub use session::{PtySession, SessionId, SessionState};
pub use sink::{ChannelSink, EventSink, ExitEvent, ExitStatus, OutputChunk, PortId, SessionEvent};
pub use size::WindowSize;

#[cfg(unix)]
pub use pty::EXEC_FAILED_EXIT_CODE;

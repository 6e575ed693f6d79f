//! Error types for PTY sessions

use std::io;

use thiserror::Error;

/// A terminal object or child process could not be allocated.
///
/// No session exists when this is returned. Every OS-level variant keeps the
/// original `io::Error` so the raw error code survives.
#[derive(Error, Debug)]
pub enum PtyCreationError {
    #[error("Invalid spawn request: {0}")]
    InvalidRequest(String),

    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] io::Error),

    #[error("Failed to set close-on-exec on PTY master: {0}")]
    CloseOnExec(#[source] io::Error),

    #[error("Failed to grant PTY access: {0}")]
    GrantPty(#[source] io::Error),

    #[error("Failed to unlock PTY: {0}")]
    UnlockPty(#[source] io::Error),

    #[error("Failed to get PTY slave name: {0}")]
    PtsName(#[source] io::Error),

    #[error("Failed to open PTY slave: {0}")]
    OpenSlave(#[source] io::Error),

    #[error("Failed to set window size: {0}")]
    SetWindowSize(#[source] io::Error),

    #[error("Failed to fork: {0}")]
    Fork(#[source] io::Error),

    #[error("Failed to create {which} pipe: {source}")]
    CreatePipe {
        which: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create pseudo console: {0}")]
    CreatePseudoConsole(#[source] io::Error),

    #[error("Failed to build process attribute list: {0}")]
    AttributeList(#[source] io::Error),

    #[error("Failed to create process: {0}")]
    CreateProcess(#[source] io::Error),

    #[error("Failed to start output pump: {0}")]
    StartPump(#[source] io::Error),
}

impl PtyCreationError {
    /// The underlying OS error, if this failure came from a system call
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            Self::InvalidRequest(_) => None,
            Self::OpenMaster(e)
            | Self::CloseOnExec(e)
            | Self::GrantPty(e)
            | Self::UnlockPty(e)
            | Self::PtsName(e)
            | Self::OpenSlave(e)
            | Self::SetWindowSize(e)
            | Self::Fork(e)
            | Self::CreatePseudoConsole(e)
            | Self::AttributeList(e)
            | Self::CreateProcess(e)
            | Self::StartPump(e) => Some(e),
            Self::CreatePipe { source, .. } => Some(source),
        }
    }

    /// Raw OS error code (errno / `GetLastError`), if any
    pub fn raw_os_error(&self) -> Option<i32> {
        self.os_error().and_then(io::Error::raw_os_error)
    }
}

/// A `write`/`resize` call failed against a session.
///
/// The session stays in its prior state; the caller decides whether to release it.
#[derive(Error, Debug)]
pub enum PtyIoError {
    #[error("Session has been released")]
    Released,

    #[error("Invalid window size {rows}x{cols}: rows and columns must be positive")]
    InvalidSize { rows: u16, cols: u16 },

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to resize PTY: {0}")]
    Resize(#[source] io::Error),

    #[error("Failed to query PTY size: {0}")]
    QuerySize(#[source] io::Error),
}

impl PtyIoError {
    /// Raw OS error code, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Write(e) | Self::Resize(e) | Self::QuerySize(e) => e.raw_os_error(),
            Self::Released | Self::InvalidSize { .. } => None,
        }
    }
}

/// OS error code carried by a failed HRESULT.
///
/// `HRESULT_FROM_WIN32` values (facility 7) unwrap to their Win32 code so
/// callers compare against `ERROR_*` constants; other HRESULTs pass through.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn os_code_from_hresult(hresult: i32) -> i32 {
    const FACILITY_WIN32: u32 = 7;
    let bits = hresult as u32;
    let failed = bits & 0x8000_0000 != 0;
    let facility = (bits >> 16) & 0x1FFF;
    if failed && facility == FACILITY_WIN32 {
        (bits & 0xFFFF) as i32
    } else {
        hresult
    }
}

/// Result type for session creation
pub type CreateResult<T> = Result<T, PtyCreationError>;

/// Result type for operations on a live session
pub type PtyResult<T> = Result<T, PtyIoError>;

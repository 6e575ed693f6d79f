//! PTY session: one child process on one terminal
//!
//! A [`PtySession`] binds the platform backend, the child's identity and the
//! output pump together. Creation starts the pump right away; output and the
//! exit notification arrive through the [`EventSink`] given at creation.
//!
//! `write`, `resize` and `release` run on the caller's thread. One mutex
//! serializes them, so geometry bookkeeping can't tear. The pump reads without
//! taking it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::PtyConfig;
use crate::error::{CreateResult, PtyCreationError, PtyIoError, PtyResult};
use crate::last_error;
use crate::pty::{self, ChildReaper, Launched, NativePty, PtyBackend};
use crate::pump::{self, PumpTarget};
use crate::request::PtySpawnRequest;
use crate::sink::{EventSink, ExitStatus};
use crate::size::WindowSize;

/// Process-unique session number, used in logs and thread names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a session's child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Terminal allocated and child launched
    Created,
    /// Pump streaming output
    Running,
    /// Child reaped; the exit event has been or is being posted
    Exited(ExitStatus),
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    pump_finished: bool,
}

/// Lifecycle state shared by the session and its pump
#[derive(Debug)]
pub(crate) struct SessionShared {
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Created,
                pump_finished: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lock().state
    }

    pub(crate) fn mark_running(&self) {
        let mut lifecycle = self.lock();
        if lifecycle.state == SessionState::Created {
            lifecycle.state = SessionState::Running;
            self.changed.notify_all();
        }
    }

    /// Move to `Exited` with the status `reap` collects. `reap` runs under the
    /// lock, so nothing signals the child's pid once it may have been reused.
    /// Later calls return the first status without reaping again.
    pub(crate) fn mark_exited(&self, reap: impl FnOnce() -> ExitStatus) -> ExitStatus {
        let mut lifecycle = self.lock();
        if let SessionState::Exited(status) = lifecycle.state {
            return status;
        }
        let status = reap();
        lifecycle.state = SessionState::Exited(status);
        self.changed.notify_all();
        status
    }

    pub(crate) fn mark_pump_finished(&self) {
        self.lock().pump_finished = true;
        self.changed.notify_all();
    }

    pub(crate) fn is_pump_finished(&self) -> bool {
        self.lock().pump_finished
    }

    /// Wait up to `timeout` for the pump; true if it finished
    pub(crate) fn wait_pump_finished(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |l| !l.pump_finished)
            .unwrap_or_else(PoisonError::into_inner);
        guard.pump_finished
    }

    pub(crate) fn wait_exited(&self, timeout: Option<Duration>) -> Option<ExitStatus> {
        let not_exited = |l: &mut Lifecycle| !matches!(l.state, SessionState::Exited(_));
        let guard = self.lock();
        let guard = match timeout {
            Some(timeout) => {
                self.changed
                    .wait_timeout_while(guard, timeout, not_exited)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            },
            None => self
                .changed
                .wait_while(guard, not_exited)
                .unwrap_or_else(PoisonError::into_inner),
        };
        match guard.state {
            SessionState::Exited(status) => Some(status),
            _ => None,
        }
    }

    /// Run `f` only while the child hasn't been reaped, holding the lifecycle lock
    pub(crate) fn while_running<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let lifecycle = self.lock();
        match lifecycle.state {
            SessionState::Exited(_) => None,
            _ => Some(f()),
        }
    }
}

struct SessionInner {
    /// `None` once released
    backend: Option<NativePty>,
    /// Last successfully applied geometry
    size: WindowSize,
    pump: Option<JoinHandle<()>>,
}

/// A child process running on its own pseudo-terminal.
///
/// `Send + Sync`: share it through an `Arc` to write from one thread while
/// another resizes. Dropping the session releases it.
pub struct PtySession {
    id: SessionId,
    pid: u32,
    inner: Mutex<SessionInner>,
    shared: Arc<SessionShared>,
    release_grace: Duration,
}

impl PtySession {
    /// Spawn `request` with the default configuration
    pub fn create(request: PtySpawnRequest, sink: Arc<dyn EventSink>) -> CreateResult<Self> {
        Self::create_with_config(request, &PtyConfig::default(), sink)
    }

    /// Allocate the terminal, launch the child and start the output pump.
    ///
    /// On failure nothing is left running and the message is also available
    /// through [`last_error`](crate::last_error).
    pub fn create_with_config(
        request: PtySpawnRequest,
        config: &PtyConfig,
        sink: Arc<dyn EventSink>,
    ) -> CreateResult<Self> {
        let result = Self::start(request, config, sink);
        if let Err(e) = &result {
            warn!(error = %e, "failed to create PTY session");
            last_error::record(e.to_string());
        }
        result
    }

    fn start(
        request: PtySpawnRequest,
        config: &PtyConfig,
        sink: Arc<dyn EventSink>,
    ) -> CreateResult<Self> {
        request.validate()?;
        config
            .validate()
            .map_err(PtyCreationError::InvalidRequest)?;

        let Launched {
            mut backend,
            reader,
            reaper,
        } = pty::launch(&request)?;

        let id = SessionId::next();
        let shared = Arc::new(SessionShared::new());
        let target = PumpTarget {
            sink,
            output_port: request.output_port,
            exit_port: request.exit_port,
            buffer_size: config.read_buffer_size,
        };

        let pump = match pump::spawn(id, reader, reaper.clone(), target, Arc::clone(&shared)) {
            Ok(handle) => handle,
            Err(e) => {
                // No pump will ever reap this child
                let mut reaper = reaper;
                if let Err(kill_err) = backend.kill() {
                    debug!(error = %kill_err, "failed to kill orphaned child");
                }
                if reaper.wait().is_ok() {
                    reaper.reap();
                }
                backend.shutdown();
                return Err(PtyCreationError::StartPump(e));
            },
        };

        shared.mark_running();

        let pid = backend.pid();
        let size = request.window_size();
        info!(
            session = %id,
            pid,
            executable = %request.executable,
            size = %size,
            "PTY session started"
        );

        Ok(Self {
            id,
            pid,
            inner: Mutex::new(SessionInner {
                backend: Some(backend),
                size,
                pump: Some(pump),
            }),
            shared,
            release_grace: config.release_grace(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// OS process id of the child
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Forward `data` to the child's input, looping until all of it is accepted
    pub fn write(&self, data: &[u8]) -> PtyResult<()> {
        let mut inner = self.lock();
        let backend = inner.backend.as_mut().ok_or(PtyIoError::Released)?;
        if data.is_empty() {
            return Ok(());
        }
        backend.write_all(data).map_err(PtyIoError::Write)
    }

    /// Apply new geometry to the terminal
    pub fn resize(&self, rows: u16, cols: u16) -> PtyResult<()> {
        let size = WindowSize::new(cols, rows);
        if !size.is_valid() {
            return Err(PtyIoError::InvalidSize { rows, cols });
        }

        let mut inner = self.lock();
        let backend = inner.backend.as_mut().ok_or(PtyIoError::Released)?;
        backend.resize(size).map_err(PtyIoError::Resize)?;
        inner.size = size;
        debug!(session = %self.id, size = %size, "resized PTY");
        Ok(())
    }

    /// Geometry of the last successful resize (or creation)
    pub fn size(&self) -> WindowSize {
        self.lock().size
    }

    /// Geometry as the terminal object itself reports it
    pub fn query_size(&self) -> PtyResult<WindowSize> {
        let inner = self.lock();
        let backend = inner.backend.as_ref().ok_or(PtyIoError::Released)?;
        backend.current_size().map_err(PtyIoError::QuerySize)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Exit status, once the child has been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.shared.state() {
            SessionState::Exited(status) => Some(status),
            _ => None,
        }
    }

    /// Block until the child has exited, or `timeout` passes
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> Option<ExitStatus> {
        self.shared.wait_exited(timeout)
    }

    pub fn is_released(&self) -> bool {
        self.lock().backend.is_none()
    }

    /// Stop the child if needed and close the session's resources.
    ///
    /// Idempotent. A running child is hung up, then killed if it outlives the
    /// grace period. The pump is joined once it has seen end of stream.
    pub fn release(&self) {
        let (mut backend, pump) = {
            let mut inner = self.lock();
            match inner.backend.take() {
                Some(backend) => (backend, inner.pump.take()),
                None => return,
            }
        };

        if !self.shared.is_pump_finished() {
            if let Some(Err(e)) = self.shared.while_running(|| backend.hangup()) {
                debug!(session = %self.id, error = %e, "hangup failed");
            }
            if !self.shared.wait_pump_finished(self.release_grace) {
                debug!(session = %self.id, "child outlived hangup, killing");
                if let Some(Err(e)) = self.shared.while_running(|| backend.kill()) {
                    warn!(session = %self.id, error = %e, "kill failed");
                }
                self.shared.wait_pump_finished(self.release_grace);
            }
        }

        if let Some(handle) = pump {
            if self.shared.is_pump_finished() {
                if handle.join().is_err() {
                    warn!(session = %self.id, "output pump panicked");
                }
            } else {
                // Something else still holds the terminal open. The pump owns
                // its read endpoint, so leaving it behind is safe.
                warn!(session = %self.id, "detaching output pump still waiting for end of stream");
            }
        }

        backend.shutdown();
        drop(backend);
        info!(session = %self.id, "PTY session released");
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PtySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

//! Unix PTY implementation
//!
//! Opens the master through `posix_openpt`, prepares the slave, and forks a
//! child that adopts the slave as its controlling terminal before exec.
//!
//! Everything the child needs is turned into C strings and pointer arrays
//! before `fork`. The child then only makes async-signal-safe calls, so a
//! lock held by another thread of the parent at fork time can't deadlock it.

use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{mem, ptr};

use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::libc::{self, c_char, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::signal::{kill, signal, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, close, dup2, fork, setsid, ForkResult, Pid};
use tracing::{debug, warn};

use super::{ChildReaper, Launched, PtyBackend};
use crate::error::{CreateResult, PtyCreationError};
use crate::request::PtySpawnRequest;
use crate::sink::ExitStatus;
use crate::size::WindowSize;

/// Exit code of a child whose program could not be executed
pub const EXEC_FAILED_EXIT_CODE: i32 = 127;

/// Exit code of a child that failed to adopt the terminal
const SETUP_FAILED_EXIT_CODE: i32 = 1;

/// Search path used when the child's environment has no PATH
const DEFAULT_SEARCH_PATH: &str = "/usr/bin:/bin";

/// Master side of a running session
pub(crate) struct NativePty {
    master: Arc<File>,
    pid: Pid,
}

impl PtyBackend for NativePty {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        // write_all loops over partial writes and EINTR
        (&*self.master).write_all(data)
    }

    fn resize(&mut self, size: WindowSize) -> io::Result<()> {
        // The kernel raises SIGWINCH in the foreground process group
        set_window_size(self.master.as_raw_fd(), size)
    }

    fn current_size(&self) -> io::Result<WindowSize> {
        get_window_size(self.master.as_raw_fd())
    }

    fn hangup(&mut self) -> io::Result<()> {
        kill(self.pid, Signal::SIGHUP).map_err(io::Error::from)
    }

    fn kill(&mut self) -> io::Result<()> {
        kill(self.pid, Signal::SIGKILL).map_err(io::Error::from)
    }

    fn shutdown(&mut self) {}
}

/// Waits for and reaps the forked child
#[derive(Debug, Clone)]
pub(crate) struct NativeReaper {
    pid: Pid,
}

impl ChildReaper for NativeReaper {
    fn wait(&mut self) -> io::Result<()> {
        loop {
            // SAFETY: siginfo_t is plain data; waitid only writes into it
            let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
            // WNOWAIT leaves the child a zombie, so its pid can't be reused
            // until `reap` runs under the lifecycle lock.
            let rc = unsafe {
                libc::waitid(
                    libc::P_PID,
                    self.pid.as_raw() as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOWAIT,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn reap(&mut self) -> ExitStatus {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return ExitStatus::from_code(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return ExitStatus::from_signal(signal as i32)
                },
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(pid = self.pid.as_raw(), error = %e, "failed to reap child");
                    return ExitStatus::default();
                },
            }
        }
    }
}

/// EIO on the master means every slave descriptor was closed
pub(crate) fn is_end_of_stream(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

/// Allocate the terminal and start the child on it
pub(crate) fn launch(request: &PtySpawnRequest) -> CreateResult<Launched> {
    let plan = ChildPlan::from_request(request)?;
    let pair = open_pair(request.window_size())?;

    let argv = plan.argv_ptrs();
    let envp = plan.envp_ptrs();
    let slave_fd = pair.slave.as_raw_fd();

    // SAFETY: the child branch only makes async-signal-safe calls and never
    // returns; it ends in execve or _exit.
    match unsafe { fork() }.map_err(|e| PtyCreationError::Fork(e.into()))? {
        ForkResult::Child => exec_child(slave_fd, &plan, &argv, &envp),
        ForkResult::Parent { child } => {
            // The child has its own copy. Ours must go, or the master never
            // sees the slave close.
            drop(pair.slave);

            debug!(
                pid = child.as_raw(),
                program = %plan.program.to_string_lossy(),
                "spawned child on PTY"
            );

            let master = Arc::new(pair.master);
            Ok(Launched {
                backend: NativePty {
                    master: Arc::clone(&master),
                    pid: child,
                },
                reader: master,
                reaper: NativeReaper { pid: child },
            })
        },
    }
}

/// Runs in the forked child
fn exec_child(
    slave: RawFd,
    plan: &ChildPlan,
    argv: &[*const c_char],
    envp: &[*const c_char],
) -> ! {
    // Rust ignores SIGPIPE and the parent thread may have signals blocked;
    // neither should leak into the new program.
    // SAFETY: installing the default disposition is always sound
    let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) };
    let _ = SigSet::empty().thread_set_mask();

    if setsid().is_err() {
        child_exit(SETUP_FAILED_EXIT_CODE);
    }

    // SAFETY: TIOCSCTTY takes an int argument; slave is a valid terminal fd
    if unsafe { libc::ioctl(slave, libc::TIOCSCTTY as _, 0) } < 0 {
        child_exit(SETUP_FAILED_EXIT_CODE);
    }

    for target in [STDIN_FILENO, STDOUT_FILENO, STDERR_FILENO] {
        if dup2(slave, target).is_err() {
            child_exit(SETUP_FAILED_EXIT_CODE);
        }
    }

    if slave > STDERR_FILENO {
        let _ = close(slave);
    } else if fcntl(slave, FcntlArg::F_SETFD(FdFlag::empty())).is_err() {
        // dup2 onto itself left O_CLOEXEC set; exec would close this stream
        child_exit(SETUP_FAILED_EXIT_CODE);
    }

    if let Some(dir) = &plan.working_directory {
        if chdir(dir.as_c_str()).is_err() {
            child_exit(SETUP_FAILED_EXIT_CODE);
        }
    }

    // SAFETY: both arrays are null-terminated and point into `plan`
    unsafe {
        libc::execve(plan.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }

    // execve only returns on failure
    child_exit(EXEC_FAILED_EXIT_CODE)
}

fn child_exit(code: i32) -> ! {
    // SAFETY: _exit skips atexit handlers and stdio flushing, which belong to
    // the parent's copy of the process state
    unsafe { libc::_exit(code) }
}

/// Master and slave descriptors of a fresh pseudoterminal
struct PtyPair {
    master: File,
    slave: OwnedFd,
}

/// Open a master/slave pair with the requested geometry already applied
fn open_pair(size: WindowSize) -> CreateResult<PtyPair> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
        .map_err(|e| PtyCreationError::OpenMaster(e.into()))?;

    fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| PtyCreationError::CloseOnExec(e.into()))?;

    grantpt(&master).map_err(|e| PtyCreationError::GrantPty(e.into()))?;
    unlockpt(&master).map_err(|e| PtyCreationError::UnlockPty(e.into()))?;

    let slave_name = slave_name(&master).map_err(|e| PtyCreationError::PtsName(e.into()))?;

    // O_CLOEXEC keeps the slave out of children other threads fork and exec
    // concurrently; dup2 in our own child clears the flag on 0/1/2.
    let slave = open(
        slave_name.as_str(),
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| PtyCreationError::OpenSlave(e.into()))?;
    // SAFETY: `open` just returned this descriptor and nothing else owns it
    let slave = unsafe { OwnedFd::from_raw_fd(slave) };

    // SAFETY: into_raw_fd hands over sole ownership of the master descriptor
    let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };

    set_window_size(master.as_raw_fd(), size).map_err(PtyCreationError::SetWindowSize)?;

    Ok(PtyPair { master, slave })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> nix::Result<String> {
    nix::pty::ptsname_r(master)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> nix::Result<String> {
    use std::sync::{Mutex, PoisonError};

    // ptsname returns a pointer into a static buffer
    static PTSNAME_LOCK: Mutex<()> = Mutex::new(());
    let _guard = PTSNAME_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    // SAFETY: calls are serialized by PTSNAME_LOCK and the name is copied out
    unsafe { nix::pty::ptsname(master) }
}

/// Set the window size on a PTY file descriptor
fn set_window_size(fd: RawFd, size: WindowSize) -> io::Result<()> {
    let winsize = size.to_winsize();

    // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call
    let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &winsize) };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Get the window size from a PTY file descriptor
fn get_window_size(fd: RawFd) -> io::Result<WindowSize> {
    let mut winsize = WindowSize::new(0, 0).to_winsize();

    // SAFETY: TIOCGWINSZ writes into a winsize struct we own
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut winsize) };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(WindowSize::from(winsize))
    }
}

/// Program, argument vector, environment and directory for the child,
/// materialized before fork
struct ChildPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    working_directory: Option<CString>,
}

impl ChildPlan {
    fn from_request(request: &PtySpawnRequest) -> CreateResult<Self> {
        let environment: Vec<Vec<u8>> = match &request.environment {
            Some(entries) => entries.iter().map(|e| e.clone().into_bytes()).collect(),
            None => inherited_environment(),
        };

        let search_path = environment
            .iter()
            .find_map(|entry| entry.strip_prefix(b"PATH="))
            .map(OsStr::from_bytes);
        let program = resolve_program(&request.executable, search_path);

        let working_directory = match &request.working_directory {
            Some(dir) if !dir.is_dir() => {
                return Err(PtyCreationError::InvalidRequest(format!(
                    "working directory {} does not exist",
                    dir.display()
                )))
            },
            Some(dir) => Some(c_string(dir.as_os_str().as_bytes().to_vec())?),
            None => None,
        };

        Ok(Self {
            program: c_string(program.into_os_string().into_vec())?,
            argv: request
                .argv()
                .into_iter()
                .map(|arg| c_string(arg.as_bytes().to_vec()))
                .collect::<CreateResult<_>>()?,
            envp: environment
                .into_iter()
                .map(c_string)
                .collect::<CreateResult<_>>()?,
            working_directory,
        })
    }

    fn argv_ptrs(&self) -> Vec<*const c_char> {
        null_terminated(&self.argv)
    }

    fn envp_ptrs(&self) -> Vec<*const c_char> {
        null_terminated(&self.envp)
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

fn c_string(bytes: Vec<u8>) -> CreateResult<CString> {
    CString::new(bytes).map_err(|e| PtyCreationError::InvalidRequest(e.to_string()))
}

/// `NAME=VALUE` entries of the current process
fn inherited_environment() -> Vec<Vec<u8>> {
    std::env::vars_os()
        .map(|(name, value)| {
            let mut entry: OsString = name;
            entry.push("=");
            entry.push(value);
            entry.into_vec()
        })
        .collect()
}

/// Find `program` on the search path the way execvp would.
///
/// Names containing a slash are used as given. Names that aren't found are
/// returned unchanged so the exec fails in the child with ENOENT.
fn resolve_program(program: &str, search_path: Option<&OsStr>) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }

    let search_path = search_path.unwrap_or_else(|| OsStr::new(DEFAULT_SEARCH_PATH));
    std::env::split_paths(search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .unwrap_or_else(|| PathBuf::from(program))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_to_end_of_stream(file: &File) -> Vec<u8> {
        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match (&*file).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_end_of_stream(&e) => break,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        output
    }

    #[test]
    fn test_open_pair_applies_geometry() {
        let pair = open_pair(WindowSize::new(132, 43)).expect("Failed to open PTY");
        let size = get_window_size(pair.master.as_raw_fd()).unwrap();
        assert_eq!(size.cols, 132);
        assert_eq!(size.rows, 43);
        // the slave reports the same geometry
        let slave_size = get_window_size(pair.slave.as_raw_fd()).unwrap();
        assert_eq!(slave_size, size);
    }

    #[test]
    fn test_master_is_close_on_exec() {
        let pair = open_pair(WindowSize::default()).unwrap();
        let flags = fcntl(pair.master.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        let flags = fcntl(pair.slave.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_set_window_size() {
        let pair = open_pair(WindowSize::default()).unwrap();
        set_window_size(pair.master.as_raw_fd(), WindowSize::new(120, 40)).unwrap();
        let size = get_window_size(pair.master.as_raw_fd()).unwrap();
        assert_eq!((size.rows, size.cols), (40, 120));
    }

    #[test]
    fn test_resolve_program_keeps_paths() {
        assert_eq!(
            resolve_program("./run.sh", None),
            PathBuf::from("./run.sh")
        );
        assert_eq!(resolve_program("/bin/sh", None), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_resolve_program_searches_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("ptyhost-tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let search = std::env::join_paths([Path::new("/nonexistent-dir"), dir.path()]).unwrap();
        assert_eq!(resolve_program("ptyhost-tool", Some(search.as_os_str())), tool);
    }

    #[test]
    fn test_resolve_program_skips_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("notes");
        std::fs::write(&data, "text").unwrap();
        std::fs::set_permissions(&data, std::fs::Permissions::from_mode(0o644)).unwrap();

        let search = dir.path().as_os_str();
        assert_eq!(resolve_program("notes", Some(search)), PathBuf::from("notes"));
    }

    #[test]
    fn test_plan_uses_request_environment_path() {
        let request = PtySpawnRequest::new("sh").environment(["PATH=/bin:/usr/bin", "X=1"]);
        let plan = ChildPlan::from_request(&request).unwrap();
        assert!(plan.program.to_bytes().ends_with(b"/sh"));
        assert_eq!(plan.envp.len(), 2);
        assert_eq!(plan.argv_ptrs().len(), 2);
        assert!(plan.argv_ptrs().last().unwrap().is_null());
    }

    #[test]
    fn test_plan_inherits_environment() {
        let plan = ChildPlan::from_request(&PtySpawnRequest::new("/bin/true")).unwrap();
        assert_eq!(plan.envp.len(), std::env::vars_os().count());
    }

    #[test]
    fn test_plan_rejects_missing_working_directory() {
        let request = PtySpawnRequest::new("/bin/sh").working_directory("/definitely/not/here");
        assert!(matches!(
            ChildPlan::from_request(&request),
            Err(PtyCreationError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_launch_and_reap_exit_code() {
        let request = PtySpawnRequest::new("/bin/sh").args(["-c", "printf hi; exit 7"]);
        let Launched {
            backend,
            reader,
            mut reaper,
        } = launch(&request).expect("Failed to launch");
        assert!(backend.pid() > 0);

        let output = read_to_end_of_stream(&reader);
        assert!(String::from_utf8_lossy(&output).contains("hi"));

        reaper.wait().unwrap();
        assert_eq!(reaper.reap(), ExitStatus::from_code(7));
    }

    #[test]
    fn test_exec_failure_exits_127() {
        let request = PtySpawnRequest::new("/nonexistent/ptyhost-missing");
        let Launched {
            reader, mut reaper, ..
        } = launch(&request).expect("fork itself should succeed");
        let _ = read_to_end_of_stream(&reader);
        reaper.wait().unwrap();
        assert_eq!(reaper.reap(), ExitStatus::from_code(EXEC_FAILED_EXIT_CODE));
    }
}

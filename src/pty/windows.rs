//! Windows pseudo console implementation
//!
//! The child's terminal is a ConPTY object fed by two anonymous pipes: we
//! write keystrokes into one and read rendered output from the other. The
//! process is attached to the console through a thread attribute list.
//!
//! ConPTY keeps the output pipe open after the child exits, so a watcher thread
//! closes the console once the process handle is signaled. That is what lets
//! the output pump see end of stream.

use std::ffi::c_void;
use std::fs::File;
use std::io::{self, Write};
use std::mem;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_BROKEN_PIPE, HANDLE, S_OK, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::FlushFileBuffers;
use windows_sys::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, HPCON,
};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT, INFINITE,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION, PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
    STARTF_USESTDHANDLES, STARTUPINFOEXW,
};

use super::{marshal, ChildReaper, Launched, PtyBackend};
use crate::error::{os_code_from_hresult, CreateResult, PtyCreationError};
use crate::request::PtySpawnRequest;
use crate::sink::ExitStatus;
use crate::size::WindowSize;

/// Exit code given to a process we terminate
const KILLED_EXIT_CODE: u32 = 1;

fn raw(handle: &OwnedHandle) -> HANDLE {
    handle.as_raw_handle() as HANDLE
}

/// Take ownership of a handle the OS just returned
///
/// SAFETY: `handle` must be valid and owned by nobody else
unsafe fn owned(handle: HANDLE) -> OwnedHandle {
    OwnedHandle::from_raw_handle(handle as RawHandle)
}

fn hresult(code: i32) -> io::Result<()> {
    if code == S_OK {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(os_code_from_hresult(code)))
    }
}

/// (read end, write end) of an anonymous pipe
fn create_pipe(which: &'static str) -> CreateResult<(OwnedHandle, OwnedHandle)> {
    let mut read: HANDLE = 0;
    let mut write: HANDLE = 0;
    // SAFETY: both out-pointers are valid; default security attributes
    let ok = unsafe { CreatePipe(&mut read, &mut write, ptr::null(), 0) };
    if ok == 0 {
        return Err(PtyCreationError::CreatePipe {
            which,
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: CreatePipe succeeded and handed us both handles
    Ok(unsafe { (owned(read), owned(write)) })
}

/// Owned pseudo console handle
struct PseudoConsole(HPCON);

impl PseudoConsole {
    fn new(size: WindowSize, input: &OwnedHandle, output: &OwnedHandle) -> io::Result<Self> {
        let mut console: HPCON = 0;
        // SAFETY: the pipe handles are valid for the duration of the call;
        // ConPTY duplicates what it needs
        hresult(unsafe {
            CreatePseudoConsole(size.to_coord(), raw(input), raw(output), 0, &mut console)
        })?;
        Ok(Self(console))
    }

    fn resize(&self, size: WindowSize) -> io::Result<()> {
        // SAFETY: self.0 stays valid until drop
        hresult(unsafe { ResizePseudoConsole(self.0, size.to_coord()) })
    }
}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        // SAFETY: the handle is owned and closed exactly once
        unsafe { ClosePseudoConsole(self.0) };
    }
}

/// Console shared between the session and the exit watcher; whoever gets
/// there first closes it
type ConsoleSlot = Arc<Mutex<Option<PseudoConsole>>>;

fn close_console(slot: &ConsoleSlot) {
    let console = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    drop(console);
}

/// Attribute list carrying the pseudo console into `CreateProcessW`
struct ProcThreadAttributeList {
    // u64 keeps the opaque list suitably aligned
    storage: Vec<u64>,
}

impl ProcThreadAttributeList {
    fn with_pseudo_console(console: &PseudoConsole) -> io::Result<Self> {
        let mut bytes = 0usize;
        // SAFETY: sizing call; fails with ERROR_INSUFFICIENT_BUFFER by contract
        unsafe { InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut bytes) };
        if bytes == 0 {
            return Err(io::Error::last_os_error());
        }

        let words = (bytes + mem::size_of::<u64>() - 1) / mem::size_of::<u64>();
        let mut storage = vec![0u64; words];
        // SAFETY: storage holds at least `bytes` bytes
        let ok = unsafe {
            InitializeProcThreadAttributeList(
                storage.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST,
                1,
                0,
                &mut bytes,
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }

        // Initialized from here on, so Drop must delete it
        let mut list = Self { storage };

        // SAFETY: the pseudo console attribute takes the HPCON value itself
        let ok = unsafe {
            UpdateProcThreadAttribute(
                list.as_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE as usize,
                console.0 as *const c_void,
                mem::size_of::<HPCON>(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(list)
    }

    fn as_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.storage.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST
    }
}

impl Drop for ProcThreadAttributeList {
    fn drop(&mut self) {
        // SAFETY: the list was initialized in with_pseudo_console
        unsafe { DeleteProcThreadAttributeList(self.as_ptr()) };
    }
}

/// Write side and control surface of a running ConPTY session
pub(crate) struct NativePty {
    input: File,
    console: ConsoleSlot,
    process: Arc<OwnedHandle>,
    pid: u32,
    size: WindowSize,
    watcher: Option<JoinHandle<()>>,
}

impl PtyBackend for NativePty {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.input.write_all(data)?;
        // SAFETY: the input handle is owned by self.input
        if unsafe { FlushFileBuffers(self.input.as_raw_handle() as HANDLE) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn resize(&mut self, size: WindowSize) -> io::Result<()> {
        let slot = self.console.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(console) => console.resize(size)?,
            None => return Err(io::Error::from_raw_os_error(ERROR_BROKEN_PIPE as i32)),
        }
        self.size = size;
        Ok(())
    }

    fn current_size(&self) -> io::Result<WindowSize> {
        // ConPTY has no query call; the last applied geometry is authoritative
        Ok(self.size)
    }

    fn hangup(&mut self) -> io::Result<()> {
        // Closing the console ends console clients the way SIGHUP ends a shell
        close_console(&self.console);
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        // SAFETY: the process handle stays open while self.process lives
        if unsafe { TerminateProcess(raw(&self.process), KILLED_EXIT_CODE) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        close_console(&self.console);
        if let Some(watcher) = self.watcher.take() {
            if watcher.is_finished() {
                let _ = watcher.join();
            }
        }
    }
}

/// Waits on the process handle
#[derive(Debug, Clone)]
pub(crate) struct NativeReaper {
    process: Arc<OwnedHandle>,
}

impl ChildReaper for NativeReaper {
    fn wait(&mut self) -> io::Result<()> {
        wait_for_process(&self.process)
    }

    fn reap(&mut self) -> ExitStatus {
        let mut code = 0u32;
        // SAFETY: valid process handle and out-pointer
        if unsafe { GetExitCodeProcess(raw(&self.process), &mut code) } == 0 {
            warn!(error = %io::Error::last_os_error(), "failed to read exit code");
            return ExitStatus::default();
        }
        ExitStatus::from_code(code as i32)
    }
}

fn wait_for_process(process: &OwnedHandle) -> io::Result<()> {
    // SAFETY: valid process handle
    if unsafe { WaitForSingleObject(raw(process), INFINITE) } == WAIT_OBJECT_0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// A broken pipe on the output side means the console is gone
pub(crate) fn is_end_of_stream(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32)
}

/// Create the pseudo console and start the child attached to it
pub(crate) fn launch(request: &PtySpawnRequest) -> CreateResult<Launched> {
    let working_directory = match &request.working_directory {
        Some(dir) if !dir.is_dir() => {
            return Err(PtyCreationError::InvalidRequest(format!(
                "working directory {} does not exist",
                dir.display()
            )))
        },
        Some(dir) => Some(marshal::wide_path(dir)),
        None => None,
    };

    let argv = request.argv();
    let mut command = marshal::command_line(&request.executable, &argv[1..]);
    let environment = match &request.environment {
        Some(entries) => marshal::environment_block(entries),
        None => marshal::environment_block(&marshal::inherited_environment()),
    };

    let size = request.window_size();
    let (input_read, input_write) = create_pipe("input")?;
    let (output_read, output_write) = create_pipe("output")?;

    let console = PseudoConsole::new(size, &input_read, &output_write)
        .map_err(PtyCreationError::CreatePseudoConsole)?;
    let mut attributes = ProcThreadAttributeList::with_pseudo_console(&console)
        .map_err(PtyCreationError::AttributeList)?;

    // SAFETY: all-zero is a valid STARTUPINFOEXW
    let mut startup: STARTUPINFOEXW = unsafe { mem::zeroed() };
    startup.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
    // Null std handles keep the parent's console handles out of the child;
    // ConPTY supplies its own.
    startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
    startup.StartupInfo.hStdInput = 0;
    startup.StartupInfo.hStdOutput = 0;
    startup.StartupInfo.hStdError = 0;
    startup.lpAttributeList = attributes.as_ptr();

    // SAFETY: all-zero is a valid out-parameter
    let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    // SAFETY: every buffer is null-terminated and outlives the call
    let ok = unsafe {
        CreateProcessW(
            ptr::null(),
            command.as_mut_ptr(),
            ptr::null(),
            ptr::null(),
            0,
            EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
            environment.as_ptr() as *const c_void,
            working_directory
                .as_ref()
                .map_or(ptr::null(), |dir| dir.as_ptr()),
            &startup.StartupInfo,
            &mut info,
        )
    };
    if ok == 0 {
        return Err(PtyCreationError::CreateProcess(io::Error::last_os_error()));
    }

    // SAFETY: the thread handle is ours and unused
    unsafe { CloseHandle(info.hThread) };
    // SAFETY: CreateProcessW succeeded, so hProcess is ours
    let process = Arc::new(unsafe { owned(info.hProcess) });

    // ConPTY holds its own duplicates of the far ends
    drop(input_read);
    drop(output_write);
    drop(attributes);

    debug!(pid = info.dwProcessId, executable = %request.executable, "spawned child on pseudo console");

    let console: ConsoleSlot = Arc::new(Mutex::new(Some(console)));
    let watcher = {
        let console = Arc::clone(&console);
        let process = Arc::clone(&process);
        thread::Builder::new()
            .name("pty-exit-watch".into())
            .spawn(move || {
                if let Err(e) = wait_for_process(&process) {
                    warn!(error = %e, "waiting for child failed");
                }
                close_console(&console);
            })
    };
    let watcher = match watcher {
        Ok(handle) => Some(handle),
        Err(e) => {
            // Without the watcher, end of stream arrives at release instead
            warn!(error = %e, "failed to start exit watcher");
            None
        },
    };

    Ok(Launched {
        backend: NativePty {
            input: File::from(input_write),
            console,
            process: Arc::clone(&process),
            pid: info.dwProcessId,
            size,
            watcher,
        },
        reader: Arc::new(File::from(output_read)),
        reaper: NativeReaper { process },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn drain(reader: &File) -> Vec<u8> {
        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match (&*reader).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                Err(e) if is_end_of_stream(&e) => break,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        output
    }

    #[test]
    fn test_launch_reports_exit_code() {
        let request = PtySpawnRequest::new("cmd.exe").args(["/c", "exit 7"]);
        let Launched {
            backend,
            reader,
            mut reaper,
        } = launch(&request).expect("Failed to launch");
        assert!(backend.pid() > 0);

        let _ = drain(&reader);
        reaper.wait().unwrap();
        assert_eq!(reaper.reap(), ExitStatus::from_code(7));
    }

    #[test]
    fn test_resize_updates_reported_size() {
        let request = PtySpawnRequest::new("cmd.exe").args(["/c", "ping -n 2 127.0.0.1 >NUL"]);
        let Launched {
            mut backend,
            reader,
            ..
        } = launch(&request).unwrap();
        backend.resize(WindowSize::new(120, 50)).unwrap();
        assert_eq!(backend.current_size().unwrap(), WindowSize::new(120, 50));
        backend.kill().unwrap();
        backend.shutdown();
        let _ = drain(&reader);
    }
}

//! ptyhost-run: run a program inside a PTY session
//!
//! Relays this terminal's input to the session and prints its output until the
//! child exits, then exits with the child's code.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use ptyhost::{
    ChannelSink, ExitStatus, PtyConfig, PtySession, PtySpawnRequest, SessionEvent, WindowSize,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ptyhost-run")]
#[command(about = "Run a program on a pseudo-terminal and relay its I/O")]
#[command(version)]
struct Args {
    /// Terminal rows (default: this terminal's, or 24)
    #[arg(short, long)]
    rows: Option<u16>,

    /// Terminal columns (default: this terminal's, or 80)
    #[arg(short, long)]
    cols: Option<u16>,

    /// Working directory of the child
    #[arg(short = 'd', long)]
    cwd: Option<PathBuf>,

    /// Set an environment variable (NAME=VALUE, repeatable)
    #[arg(short, long = "env", value_name = "NAME=VALUE")]
    env: Vec<String>,

    /// Start from an empty environment instead of inheriting this one
    #[arg(long)]
    clear_env: bool,

    /// Load the whole spawn request from a JSON file
    #[arg(long, value_name = "FILE", conflicts_with = "command")]
    request: Option<PathBuf>,

    /// Session configuration as a JSON file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Program and arguments (default: $SHELL)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(status) => exit_code(status),
        Err(message) => {
            eprintln!("ptyhost-run: {message}");
            ExitCode::FAILURE
        },
    }
}

fn run(args: Args) -> Result<ExitStatus, String> {
    let config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            PtyConfig::from_json(&text).map_err(|e| format!("invalid config: {e}"))?
        },
        None => PtyConfig::default(),
    };

    let request = build_request(&args)?;
    let (sink, events) = ChannelSink::pair();
    let session = Arc::new(
        PtySession::create_with_config(request, &config, Arc::new(sink))
            .map_err(|e| e.to_string())?,
    );
    tracing::debug!(pid = session.pid(), "child started");

    let raw_mode = RawModeGuard::enable();

    {
        let session = Arc::clone(&session);
        // Never joined: it stays blocked on stdin after the child is gone
        thread::Builder::new()
            .name("stdin-relay".into())
            .spawn(move || relay_stdin(&session))
            .map_err(|e| format!("cannot start input relay: {e}"))?;
    }

    let mut stdout = io::stdout();
    let mut status = None;
    for event in events {
        match event {
            SessionEvent::Output(chunk) => {
                if stdout.write_all(&chunk.data).and_then(|_| stdout.flush()).is_err() {
                    break;
                }
            },
            SessionEvent::Exited(exit) => {
                status = Some(exit.status);
                break;
            },
        }
    }

    drop(raw_mode);
    session.release();

    let status = status
        .or_else(|| session.exit_status())
        .unwrap_or_default();
    tracing::info!(status = %status, "session finished");
    Ok(status)
}

fn build_request(args: &Args) -> Result<PtySpawnRequest, String> {
    let mut request = match &args.request {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str(&text).map_err(|e| format!("invalid request: {e}"))?
        },
        None => match args.command.split_first() {
            Some((program, rest)) => {
                PtySpawnRequest::new(program.as_str()).args(rest.iter().cloned())
            },
            None => PtySpawnRequest::new(default_shell()),
        },
    };

    if args.request.is_none() {
        let size = host_window_size().unwrap_or_default();
        request = request.size(size.rows, size.cols);
    }
    if let Some(rows) = args.rows {
        request.rows = rows;
    }
    if let Some(cols) = args.cols {
        request.cols = cols;
    }
    if let Some(dir) = &args.cwd {
        request = request.working_directory(dir);
    }

    if args.clear_env {
        request = request.environment(args.env.iter().cloned());
    } else if !args.env.is_empty() {
        let mut entries: Vec<String> = match request.environment.take() {
            Some(entries) => entries,
            None => std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
        };
        entries.extend(args.env.iter().cloned());
        request = request.environment(entries);
    }

    Ok(request)
}

fn relay_stdin(session: &PtySession) {
    let mut stdin = io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = session.write(&buf[..n]) {
                    tracing::debug!(error = %e, "stopping input relay");
                    break;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn exit_code(status: ExitStatus) -> ExitCode {
    match (status.code, status.signal) {
        (Some(code), _) => ExitCode::from((code & 0xff) as u8),
        (None, Some(signal)) => ExitCode::from((128 + signal).clamp(0, 255) as u8),
        (None, None) => ExitCode::FAILURE,
    }
}

#[cfg(unix)]
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(windows)]
fn default_shell() -> String {
    std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
}

/// Size of the terminal this program runs in
#[cfg(unix)]
fn host_window_size() -> Option<WindowSize> {
    use std::os::fd::AsRawFd;

    let mut ws = WindowSize::new(0, 0).to_winsize();
    // SAFETY: TIOCGWINSZ writes into a winsize struct we own
    let result = unsafe {
        nix::libc::ioctl(io::stdout().as_raw_fd(), nix::libc::TIOCGWINSZ as _, &mut ws)
    };
    let size = WindowSize::from(ws);
    (result == 0 && size.is_valid()).then_some(size)
}

#[cfg(windows)]
fn host_window_size() -> Option<WindowSize> {
    None
}

/// Puts this terminal in raw mode so keystrokes reach the child unprocessed
struct RawModeGuard {
    #[cfg(unix)]
    original: Option<nix::sys::termios::Termios>,
}

impl RawModeGuard {
    #[cfg(unix)]
    fn enable() -> Self {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
        use std::io::IsTerminal;

        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Self { original: None };
        }
        let original = match tcgetattr(&stdin) {
            Ok(termios) => termios,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read terminal attributes");
                return Self { original: None };
            },
        };
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        if let Err(e) = tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
            tracing::warn!(error = %e, "cannot enable raw mode");
            return Self { original: None };
        }
        Self {
            original: Some(original),
        }
    }

    #[cfg(windows)]
    fn enable() -> Self {
        Self {}
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(original) = self.original.take() {
            use nix::sys::termios::{tcsetattr, SetArg};
            let _ = tcsetattr(&io::stdin(), SetArg::TCSANOW, &original);
        }
    }
}

//! Output pump
//!
//! One thread per session. It reads the terminal's output until end of stream,
//! posts every chunk in order, then collects the child's exit status and posts
//! the single exit event.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

use crate::pty::{is_end_of_stream, ChildReaper};
use crate::session::{SessionId, SessionShared};
use crate::sink::{EventSink, ExitEvent, OutputChunk, PortId};

/// Where the pump delivers and how much it reads at a time
pub(crate) struct PumpTarget {
    pub sink: Arc<dyn EventSink>,
    pub output_port: PortId,
    pub exit_port: PortId,
    pub buffer_size: usize,
}

/// Start the pump thread for one session
pub(crate) fn spawn<R: ChildReaper>(
    session: SessionId,
    reader: Arc<File>,
    reaper: R,
    target: PumpTarget,
    shared: Arc<SessionShared>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("pty-pump-{session}"))
        .spawn(move || run(session, &reader, reaper, &target, &shared))
}

fn run<R: ChildReaper>(
    session: SessionId,
    reader: &File,
    mut reaper: R,
    target: &PumpTarget,
    shared: &SessionShared,
) {
    let total = forward_output(session, reader, target);
    debug!(session = %session, bytes = total, "output stream ended");

    if let Err(e) = reaper.wait() {
        warn!(session = %session, error = %e, "failed to wait for child");
    }
    let status = shared.mark_exited(|| reaper.reap());
    info!(session = %session, status = %status, "child exited");

    if !target.sink.post_exit(ExitEvent {
        port: target.exit_port,
        status,
    }) {
        debug!(session = %session, "exit notification dropped");
    }

    shared.mark_pump_finished();
}

/// Copy output into the sink until end of stream; returns the byte count
fn forward_output(session: SessionId, mut reader: &File, target: &PumpTarget) -> u64 {
    let mut buf = vec![0u8; target.buffer_size];
    let mut total = 0u64;
    let mut dropped = false;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_end_of_stream(&e) => break,
            Err(e) => {
                warn!(session = %session, error = %e, "PTY read failed");
                break;
            },
        };

        total += n as u64;
        trace!(session = %session, bytes = n, "read from PTY");

        let chunk = OutputChunk::new(target.output_port, buf[..n].to_vec());
        // Keep draining even when nobody listens, or the child blocks on a full terminal
        if !target.sink.post_output(chunk) && !dropped {
            debug!(session = %session, "output sink rejected a chunk");
            dropped = true;
        }
    }

    total
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::sink::{ChannelSink, ExitStatus, SessionEvent};
    use std::io::Write;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    #[derive(Clone)]
    struct FakeReaper(i32);

    impl ChildReaper for FakeReaper {
        fn wait(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn reap(&mut self) -> ExitStatus {
            ExitStatus::from_code(self.0)
        }
    }

    fn socket_file(stream: UnixStream) -> File {
        File::from(OwnedFd::from(stream))
    }

    #[test]
    fn test_pump_delivers_chunks_then_one_exit() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let (sink, rx) = ChannelSink::pair();
        let shared = Arc::new(SessionShared::new());
        shared.mark_running();

        let payload: Vec<u8> = (0..2500u32).map(|i| b'a' + (i % 26) as u8).collect();
        writer.write_all(&payload).unwrap();
        drop(writer);

        let target = PumpTarget {
            sink: Arc::new(sink),
            output_port: PortId(1),
            exit_port: PortId(2),
            buffer_size: 1024,
        };
        let handle = spawn(
            SessionId::next(),
            Arc::new(socket_file(reader)),
            FakeReaper(3),
            target,
            Arc::clone(&shared),
        )
        .unwrap();
        handle.join().unwrap();

        let events: Vec<SessionEvent> = rx.try_iter().collect();
        let mut received = Vec::new();
        let mut exits = 0;
        for event in &events {
            match event {
                SessionEvent::Output(chunk) => {
                    assert_eq!(chunk.port, PortId(1));
                    assert!(!chunk.is_empty() && chunk.len() <= 1024);
                    assert_eq!(exits, 0, "output after exit");
                    received.extend_from_slice(&chunk.data);
                },
                SessionEvent::Exited(exit) => {
                    assert_eq!(exit.port, PortId(2));
                    assert_eq!(exit.status, ExitStatus::from_code(3));
                    exits += 1;
                },
            }
        }
        assert_eq!(received, payload);
        assert_eq!(exits, 1);
        assert_eq!(shared.state(), SessionState::Exited(ExitStatus::from_code(3)));
        assert!(shared.is_pump_finished());
    }

    #[test]
    fn test_pump_survives_closed_sink() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let (sink, rx) = ChannelSink::pair();
        drop(rx);
        let shared = Arc::new(SessionShared::new());

        writer.write_all(b"ignored").unwrap();
        drop(writer);

        let target = PumpTarget {
            sink: Arc::new(sink),
            output_port: PortId(0),
            exit_port: PortId(0),
            buffer_size: 16,
        };
        spawn(
            SessionId::next(),
            Arc::new(socket_file(reader)),
            FakeReaper(0),
            target,
            Arc::clone(&shared),
        )
        .unwrap()
        .join()
        .unwrap();

        assert!(shared.is_pump_finished());
        assert_eq!(shared.state(), SessionState::Exited(ExitStatus::from_code(0)));
    }
}

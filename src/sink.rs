//! Delivery channel for session output and exit notifications
//!
//! The output pump posts every chunk it reads and a single exit event through an
//! [`EventSink`]. A post must not wait for a consumer to drain; a rejected post
//! is dropped and never retried.

use std::fmt;
use std::sync::mpsc;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a destination chosen by the embedding application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub u64);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Bytes read from the terminal in one go, tagged with their destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub port: PortId,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn new(port: PortId, data: Vec<u8>) -> Self {
        Self { port, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// How the child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitStatus {
    /// Exit code, when the child exited normally
    pub code: Option<i32>,
    /// Terminating signal (POSIX only)
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// The child exited with code 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// The single terminal notification of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub port: PortId,
    pub status: ExitStatus,
}

/// Everything a session can deliver, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(OutputChunk),
    Exited(ExitEvent),
}

/// Receiver side of the delivery contract.
///
/// Implementations are called from the pump thread. They return `false` when the
/// post could not be accepted.
pub trait EventSink: Send + Sync {
    fn post_output(&self, chunk: OutputChunk) -> bool;

    fn post_exit(&self, exit: ExitEvent) -> bool;
}

/// Sink backed by an unbounded channel; posting never blocks
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SessionEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end
    pub fn pair() -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelSink {
    fn post_output(&self, chunk: OutputChunk) -> bool {
        self.tx.send(SessionEvent::Output(chunk)).is_ok()
    }

    fn post_exit(&self, exit: ExitEvent) -> bool {
        self.tx.send(SessionEvent::Exited(exit)).is_ok()
    }
}

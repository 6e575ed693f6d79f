//! Spawn request: what to run and where its output goes

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CreateResult, PtyCreationError};
use crate::sink::PortId;
use crate::size::WindowSize;

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

/// Everything needed to start one session. Consumed by session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySpawnRequest {
    /// Initial number of rows
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Initial number of columns
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Program to run
    pub executable: String,
    /// Argument vector, argv[0] first by convention
    #[serde(default)]
    pub arguments: Vec<String>,
    /// `NAME=VALUE` entries replacing the environment; `None` inherits the caller's
    #[serde(default)]
    pub environment: Option<Vec<String>>,
    /// Working directory of the child; `None` inherits the caller's
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Destination of output chunks
    #[serde(default)]
    pub output_port: PortId,
    /// Destination of the exit notification
    #[serde(default)]
    pub exit_port: PortId,
}

impl PtySpawnRequest {
    /// Request for `executable` with argv = `[executable]` and an 80x24 terminal
    pub fn new(executable: impl Into<String>) -> Self {
        let executable = executable.into();
        Self {
            rows: default_rows(),
            cols: default_cols(),
            arguments: vec![executable.clone()],
            executable,
            environment: None,
            working_directory: None,
            output_port: PortId::default(),
            exit_port: PortId::default(),
        }
    }

    /// Append one argument after the existing ones
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add one variable to an explicit environment, starting from an empty one
    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.environment
            .get_or_insert_with(Vec::new)
            .push(format!("{name}={value}"));
        self
    }

    /// Replace the environment with exactly these entries
    pub fn environment<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environment = Some(entries.into_iter().map(Into::into).collect());
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn ports(mut self, output: PortId, exit: PortId) -> Self {
        self.output_port = output;
        self.exit_port = exit;
        self
    }

    pub fn window_size(&self) -> WindowSize {
        WindowSize::new(self.cols, self.rows)
    }

    /// Argument vector handed to the child
    pub fn argv(&self) -> Vec<&str> {
        if self.arguments.is_empty() {
            vec![self.executable.as_str()]
        } else {
            self.arguments.iter().map(String::as_str).collect()
        }
    }

    /// Check the invariants a session relies on
    pub fn validate(&self) -> CreateResult<()> {
        if !self.window_size().is_valid() {
            return Err(invalid(format!(
                "rows and columns must be positive, got {}x{}",
                self.rows, self.cols
            )));
        }
        if self.executable.is_empty() {
            return Err(invalid("executable is empty".to_string()));
        }
        if self.executable.contains('\0') {
            return Err(invalid("executable contains a NUL byte".to_string()));
        }
        if let Some(arg) = self.arguments.iter().find(|a| a.contains('\0')) {
            return Err(invalid(format!("argument {arg:?} contains a NUL byte")));
        }
        if let Some(entries) = &self.environment {
            for entry in entries {
                if entry.contains('\0') {
                    return Err(invalid(format!(
                        "environment entry {entry:?} contains a NUL byte"
                    )));
                }
                if !entry.contains('=') {
                    return Err(invalid(format!(
                        "environment entry {entry:?} is not NAME=VALUE"
                    )));
                }
            }
        }
        if let Some(dir) = &self.working_directory {
            if dir.as_os_str().is_empty() {
                return Err(invalid("working directory is empty".to_string()));
            }
            if dir.to_string_lossy().contains('\0') {
                return Err(invalid("working directory contains a NUL byte".to_string()));
            }
        }
        Ok(())
    }
}

fn invalid(reason: String) -> PtyCreationError {
    PtyCreationError::InvalidRequest(reason)
}

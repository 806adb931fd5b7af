use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::parser::RecordKind;
use crate::poller::PollerState;

/// Why an external resource-manager command did not produce usable output
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("`{program}` was not found")]
    NotFound { program: String },
    #[error("permission denied executing `{program}`")]
    PermissionDenied { program: String },
    #[error("`{program}` did not finish within {timeout:?} and was killed")]
    Timeout { program: String, timeout: Duration },
    #[error("`{program}` exited with {}: {}", describe_exit(.code), .stderr.trim())]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to run `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

impl CommandError {
    /// Classifies a spawn failure by its OS error kind
    pub fn from_spawn(program: &str, err: io::Error) -> Self {
        let program = program.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => CommandError::NotFound { program },
            io::ErrorKind::PermissionDenied => CommandError::PermissionDenied { program },
            _ => CommandError::Io {
                program,
                source: err,
            },
        }
    }
}

/// The output as a whole did not look like the expected layout
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error(
        "unrecognized {kind} output: none of {lines} non-empty lines matched the expected layout (first problem: {first_reason})"
    )]
    UnrecognizedFormat {
        kind: RecordKind,
        lines: usize,
        first_reason: String,
    },
}

/// A poll cycle that ended in the Failed state
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("collecting {kind} failed: {source}")]
    Command {
        kind: RecordKind,
        #[source]
        source: CommandError,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl CycleError {
    /// The poller stage in which the cycle failed
    pub fn stage(&self) -> PollerState {
        match self {
            CycleError::Command { .. } => PollerState::Collecting,
            CycleError::Parse(_) => PollerState::Parsing,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

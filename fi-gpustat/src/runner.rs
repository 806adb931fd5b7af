use std::fmt;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::CommandError;
use crate::parser::RecordKind;

/// A program and its arguments, run without a shell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Node query producing the layout read by [`crate::nodes::parse_nodes`]
    pub fn sinfo_default() -> Self {
        Self::new(
            "sinfo",
            &[
                "--Node",
                "--noheader",
                "--Format=NodeHost:64|,Partition:64|,CPUsState:32|,Memory:16|,AllocMem:16|,Gres:128|,GresUsed:128|,StateLong:32",
            ],
        )
    }

    /// Job query producing the layout read by [`crate::jobs::parse_jobs`]
    pub fn squeue_default() -> Self {
        Self::new(
            "squeue",
            &[
                "--noheader",
                "--states=RUNNING,PENDING",
                "--format=%i|%u|%P|%T|%C|%D|%b|%m|%V|%S|%N",
            ],
        )
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs one external command at a time with a hard time limit
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner {
    pub timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs `spec` to completion and returns its stdout.
    ///
    /// A command still running after `timeout` is killed and reported as
    /// [`CommandError::Timeout`]; the call returns shortly after the limit
    /// whatever the child does
    pub async fn run(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        debug!(command = %spec, "running");

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommandError::from_spawn(&spec.program, e))?;

        // dropping the wait future on timeout drops the child, which kills it
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| CommandError::Io {
                program: spec.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(CommandError::Timeout {
                    program: spec.program.clone(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            return Err(CommandError::NonZeroExit {
                program: spec.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Where the poller gets raw node and job text from
pub trait StatusSource: Send + Sync {
    fn fetch(&self, kind: RecordKind) -> impl Future<Output = Result<String, CommandError>> + Send;
}

/// The live source: the configured Slurm commands
#[derive(Debug, Clone)]
pub struct SlurmCommands {
    pub runner: CommandRunner,
    pub nodes: CommandSpec,
    pub jobs: CommandSpec,
}

impl StatusSource for SlurmCommands {
    async fn fetch(&self, kind: RecordKind) -> Result<String, CommandError> {
        let spec = match kind {
            RecordKind::Nodes => &self.nodes,
            RecordKind::Jobs => &self.jobs,
        };
        self.runner.run(spec).await
    }
}

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::runner::{CommandRunner, CommandSpec, SlurmCommands};

/// Looked for next to the binary when no `--config` is given
pub static CONFIG_FN: &str = "fi-gpus.toml";

/// Poller and command settings. Every field has a default, so an empty file or
/// no file at all is a valid configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub poll_interval_secs: u64,
    pub command_timeout_secs: u64,
    /// `tracing` filter directive used when `RUST_LOG` is not set
    pub log_level: String,
    pub nodes: CommandSpec,
    pub jobs: CommandSpec,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            command_timeout_secs: 10,
            log_level: "info".to_string(),
            nodes: CommandSpec::sinfo_default(),
            jobs: CommandSpec::squeue_default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Loads the configuration.
    ///
    /// An explicit path must exist. Without one, `fi-gpus.toml` in the
    /// binary's directory is used if present, and the defaults otherwise.
    /// The result is validated either way
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match site_config_path().filter(|p| p.is_file()) {
                Some(path) => {
                    debug!(path = %path.display(), "using site config");
                    Self::from_file(&path)?
                }
                None => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_secs must be at least 1".to_string(),
            ));
        }
        for (name, spec) in [("nodes", &self.nodes), ("jobs", &self.jobs)] {
            if spec.program.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "[{}] program must not be empty",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// The live status source described by this configuration
    pub fn slurm_commands(&self) -> SlurmCommands {
        SlurmCommands {
            runner: CommandRunner::new(self.command_timeout()),
            nodes: self.nodes.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

/// `fi-gpus.toml` in the directory holding the running binary, so a site can
/// ship its settings alongside the install
pub fn site_config_path() -> Option<PathBuf> {
    let exe_path = env::current_exe().ok()?;
    Some(exe_path.parent()?.join(CONFIG_FN))
}

pub mod aggregate;
pub mod config;
pub mod error;
pub mod jobs;
pub mod nodes;
pub mod parser;
pub mod poller;
pub mod runner;
pub mod snapshot;
pub mod states;
pub mod utils;

pub use config::Config;
pub use error::{CommandError, ConfigError, CycleError, ParseError};
pub use poller::{Poller, PollerState};
pub use runner::{CommandRunner, CommandSpec, SlurmCommands, StatusSource};
pub use snapshot::{CollectionStatus, CycleFailure, Snapshot, SnapshotStore};

pub const AUTHOR_HELP: &str = "Scientific Computing Core, Flatiron Institute";

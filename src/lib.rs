pub mod api;
pub mod config;
pub mod errors;
pub mod job;
pub mod launcher;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod script;
pub mod server;
pub mod store;
pub mod validate;

pub use config::{RunnerConfig, Settings};
pub use errors::{Result, RunnerError};
pub use job::{ArchiveFormat, JobState, JobStatus};
pub use launcher::{ProcessSpawner, ShellSpawner, WorkerHandle};
pub use runner::Runner;
pub use validate::{BuildParams, BuildRequest};

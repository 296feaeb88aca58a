//! CLI command implementations.
//!
//! | Module   | Commands handled              |
//! |----------|-------------------------------|
//! | `serve`  | `Serve`                       |
//! | `jobs`   | `Status`, `List`, `Trigger`   |

pub mod jobs;
pub mod serve;

pub use jobs::{cmd_list, cmd_status, cmd_trigger};
pub use serve::cmd_serve;

use anyhow::{Context, Result};
use std::path::Path;
use synth_runner::{Runner, RunnerConfig};

/// Load settings and construct the runner, reconciling the jobs directory.
pub(crate) fn open_runner(config_path: &Path) -> Result<Runner> {
    let config = RunnerConfig::from_toml_file(config_path)?;
    Runner::new(config).context("Failed to start synthesis runner")
}

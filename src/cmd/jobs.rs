//! Offline job commands: `status`, `list`, `trigger`.
//!
//! These operate directly on the jobs directory. `trigger` only queues; the
//! build launches when a server is running the worker.

use anyhow::Result;
use std::path::Path;

use synth_runner::validate::{BuildParams, IdArg};

pub fn cmd_status(config_path: &Path, id: &str) -> Result<()> {
    let runner = super::open_runner(config_path)?;
    let job = runner.status(id);
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub fn cmd_list(config_path: &Path) -> Result<()> {
    let runner = super::open_runner(config_path)?;
    let jobs = runner.list();
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

pub fn cmd_trigger(
    config_path: &Path,
    collections: &[String],
    root_id: &str,
    user: Option<&str>,
) -> Result<()> {
    let runner = super::open_runner(config_path)?;
    let params = BuildParams {
        input_collections: Some(collections.to_vec()),
        root_id: Some(IdArg::from(root_id)),
        user_initiating_run: user.map(str::to_string),
        ..Default::default()
    };
    let job = runner.trigger_params(params)?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

//! Runner configuration.
//!
//! Settings arrive as a flat mapping of dotted keys, the way the hosting web
//! service hands them over. A TOML file whose tables flatten to the same keys
//! is also accepted:
//!
//! ```toml
//! [synth]
//! scratch_dir = "/var/lib/synth/scratch"
//! build_tool_dir = "/opt/propinquity"
//! taxonomy_dir = "/opt/ott/ott3.2"
//! base_config_file = "/opt/propinquity/config.opentree.synth"
//! env_file = "/opt/propinquity/env.sh"
//! poll_interval_secs = 30
//! download_url_prefix = "/v3/tree_of_life/custom_built_tree"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::errors::RunnerError;

pub const SCRATCH_DIR_KEY: &str = "synth.scratch_dir";
pub const BUILD_TOOL_DIR_KEY: &str = "synth.build_tool_dir";
pub const TAXONOMY_DIR_KEY: &str = "synth.taxonomy_dir";
pub const BASE_CONFIG_FILE_KEY: &str = "synth.base_config_file";
pub const ENV_FILE_KEY: &str = "synth.env_file";
pub const POLL_INTERVAL_KEY: &str = "synth.poll_interval_secs";
pub const DOWNLOAD_URL_PREFIX_KEY: &str = "synth.download_url_prefix";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DOWNLOAD_URL_PREFIX: &str = "/v3/tree_of_life/custom_built_tree";

/// Flat settings mapping as handed over by the hosting service.
pub type Settings = HashMap<String, String>;

/// Validated runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub scratch_dir: PathBuf,
    pub build_tool_dir: PathBuf,
    pub taxonomy_dir: PathBuf,
    pub base_config_file: PathBuf,
    pub env_file: Option<PathBuf>,
    pub poll_interval: Duration,
    pub download_url_prefix: String,
}

impl RunnerConfig {
    /// Validate a settings mapping.
    ///
    /// The scratch directory is created if missing. Every failure is a
    /// configuration error (501), so a runner can never exist half-configured.
    pub fn from_settings(settings: &Settings) -> Result<Self, RunnerError> {
        let scratch_dir = required_path(settings, SCRATCH_DIR_KEY)?;
        if !scratch_dir.exists() {
            std::fs::create_dir_all(&scratch_dir).map_err(|e| {
                RunnerError::MisconfiguredSetting {
                    key: SCRATCH_DIR_KEY,
                    reason: format!("Could not create scratch dir: {}", e),
                }
            })?;
        } else if !scratch_dir.is_dir() {
            return Err(RunnerError::MisconfiguredSetting {
                key: SCRATCH_DIR_KEY,
                reason: "Path for scratch dir is not a directory.".to_string(),
            });
        }

        let build_tool_dir = required_path(settings, BUILD_TOOL_DIR_KEY)?;
        require_dir(&build_tool_dir, BUILD_TOOL_DIR_KEY)?;

        let taxonomy_dir = required_path(settings, TAXONOMY_DIR_KEY)?;
        require_dir(&taxonomy_dir, TAXONOMY_DIR_KEY)?;

        let base_config_file = required_path(settings, BASE_CONFIG_FILE_KEY)?;
        if !base_config_file.is_file() {
            return Err(RunnerError::MisconfiguredSetting {
                key: BASE_CONFIG_FILE_KEY,
                reason: "File not found.".to_string(),
            });
        }

        let env_file = optional(settings, ENV_FILE_KEY).map(PathBuf::from);
        if let Some(ref path) = env_file
            && !path.is_file()
        {
            return Err(RunnerError::MisconfiguredSetting {
                key: ENV_FILE_KEY,
                reason: "File not found.".to_string(),
            });
        }

        let poll_interval = match optional(settings, POLL_INTERVAL_KEY) {
            Some(raw) => parse_interval(raw)?,
            None => DEFAULT_POLL_INTERVAL,
        };

        let download_url_prefix = optional(settings, DOWNLOAD_URL_PREFIX_KEY)
            .unwrap_or(DEFAULT_DOWNLOAD_URL_PREFIX)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            scratch_dir,
            build_tool_dir,
            taxonomy_dir,
            base_config_file,
            env_file,
            poll_interval,
            download_url_prefix,
        })
    }

    /// Load settings from a TOML file and validate them.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let settings = load_settings(path)?;
        Self::from_settings(&settings)
            .with_context(|| format!("Invalid runner settings in {}", path.display()))
    }

    /// Directory holding one subdirectory per job.
    pub fn jobs_dir(&self) -> PathBuf {
        self.scratch_dir.join("jobs")
    }

    /// Public URL of a job's results archive.
    pub fn download_url(&self, id: &str) -> String {
        format!("{}/{}.tar.gz", self.download_url_prefix, id)
    }
}

/// Read a TOML file into a flat settings mapping with dotted keys.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let table: toml::Table = toml::from_str(&content)
        .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
    let mut settings = Settings::new();
    flatten_into(&mut settings, "", &table);
    Ok(settings)
}

fn flatten_into(settings: &mut Settings, prefix: &str, table: &toml::Table) {
    for (key, value) in table {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            toml::Value::Table(inner) => flatten_into(settings, &full_key, inner),
            toml::Value::String(s) => {
                settings.insert(full_key, s.clone());
            }
            other => {
                settings.insert(full_key, other.to_string());
            }
        }
    }
}

fn optional<'a>(settings: &'a Settings, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn required_path(settings: &Settings, key: &'static str) -> Result<PathBuf, RunnerError> {
    optional(settings, key)
        .map(PathBuf::from)
        .ok_or(RunnerError::MissingSetting { key })
}

fn require_dir(path: &Path, key: &'static str) -> Result<(), RunnerError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(RunnerError::MisconfiguredSetting {
            key,
            reason: "Directory not found.".to_string(),
        })
    }
}

fn parse_interval(raw: &str) -> Result<Duration, RunnerError> {
    raw.parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| RunnerError::MisconfiguredSetting {
            key: POLL_INTERVAL_KEY,
            reason: format!("\"{}\" is not a positive number of seconds.", raw),
        })
}

//! Typed error hierarchy for the synthesis runner.
//!
//! Every variant maps onto an HTTP-like status code via
//! [`RunnerError::status_code`]:
//! - client input problems are 400
//! - misconfiguration detected at construction is 501
//! - unknown jobs and missing artifacts are 404, unfinished jobs are 410
//! - storage failures are 500

use std::path::PathBuf;

use thiserror::Error;

const MISCONFIGURED_PREAMBLE: &str = "This instance of the web server was not configured correctly \
to support the launching of custom synthesis jobs.";

/// Errors surfaced by the runner and its components.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Expecting a \"{name}\" parameter.")]
    MissingParameter { name: &'static str },

    #[error(
        "Expecting a \"input_collection\" to have the form \"owner_name/collection_name\". \
\"{value}\" did not match this form."
    )]
    InvalidCollection { value: String },

    #[error("Expecting a \"root_id\" parameter to be an integer or \"ott#\", got \"{value}\".")]
    InvalidRootId { value: String },

    #[error("Conflicting arguments: {message}")]
    ConflictingArguments { message: String },

    #[error("Unsupported archive format \"{ext}\". Supported: tar.gz")]
    UnsupportedFormat { ext: String },

    #[error("{} The config file lacks a {key} setting.", MISCONFIGURED_PREAMBLE)]
    MissingSetting { key: &'static str },

    #[error(
        "{} When checking the {key} setting, an error was encountered: {reason}",
        MISCONFIGURED_PREAMBLE
    )]
    MisconfiguredSetting { key: &'static str, reason: String },

    #[error("Custom synthesis job \"{id}\" not found")]
    JobNotFound { id: String },

    #[error("Custom synthesis job \"{id}\" is {state}; results are not available")]
    JobNotReady { id: String, state: String },

    #[error("Could not create directory for custom synthesis at {path}: {source}")]
    JobDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize job status: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Could not allocate a unique job id after {attempts} attempts")]
    IdExhausted { attempts: u32 },
}

impl RunnerError {
    /// HTTP-like status code reported to the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            RunnerError::MissingParameter { .. }
            | RunnerError::InvalidCollection { .. }
            | RunnerError::InvalidRootId { .. }
            | RunnerError::ConflictingArguments { .. }
            | RunnerError::UnsupportedFormat { .. } => 400,
            RunnerError::MissingSetting { .. } | RunnerError::MisconfiguredSetting { .. } => 501,
            RunnerError::JobNotFound { .. } => 404,
            RunnerError::JobNotReady { .. } => 410,
            RunnerError::JobDirectory { .. }
            | RunnerError::WriteFailed { .. }
            | RunnerError::Serialize(_)
            | RunnerError::IdExhausted { .. } => 500,
        }
    }

    /// Whether the error was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;

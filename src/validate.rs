//! Validation of build requests.
//!
//! The collection grammar is deliberately narrow: owner and name become part
//! of the job id, and the job id is a directory name.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, RunnerError};

static COLLECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([-a-zA-Z0-9]+)/([-a-zA-Z0-9]+)$").expect("valid regex"));

/// A collection reference of the form `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionRef {
    pub owner: String,
    pub name: String,
}

impl CollectionRef {
    pub fn parse(value: &str) -> Result<Self> {
        let caps = COLLECTION_RE
            .captures(value.trim())
            .ok_or_else(|| RunnerError::InvalidCollection {
                value: value.to_string(),
            })?;
        Ok(Self {
            owner: caps[1].to_string(),
            name: caps[2].to_string(),
        })
    }
}

impl std::fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// An id argument as it arrives over the wire: a bare integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdArg {
    Int(u64),
    Text(String),
}

impl IdArg {
    fn raw(&self) -> String {
        match self {
            IdArg::Int(n) => n.to_string(),
            IdArg::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for IdArg {
    fn from(value: &str) -> Self {
        IdArg::Text(value.to_string())
    }
}

impl From<u64> for IdArg {
    fn from(value: u64) -> Self {
        IdArg::Int(value)
    }
}

/// Parse a taxon id given as `123` or `ott123`.
pub fn parse_ott_id(value: &IdArg) -> Result<u64> {
    let invalid = || RunnerError::InvalidRootId { value: value.raw() };
    match value {
        IdArg::Int(n) => Ok(*n),
        IdArg::Text(s) => {
            let s = s.trim();
            let digits = s.strip_prefix("ott").unwrap_or(s).trim();
            digits.parse::<u64>().map_err(|_| invalid())
        }
    }
}

/// Raw build-tree parameters, as posted by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParams {
    #[serde(default)]
    pub input_collection: Option<String>,
    #[serde(default)]
    pub input_collections: Option<Vec<String>>,
    #[serde(default)]
    pub root_id: Option<IdArg>,
    #[serde(default)]
    pub ott_id: Option<IdArg>,
    #[serde(default)]
    pub user_initiating_run: Option<String>,
}

/// A validated build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub collections: Vec<CollectionRef>,
    pub root_ott_id: u64,
    pub user: Option<String>,
}

impl BuildRequest {
    /// A single-collection request from already separated parts.
    pub fn single(owner: &str, name: &str, root_id: &str) -> Result<Self> {
        let collection = CollectionRef::parse(&format!("{}/{}", owner, name))?;
        Ok(Self {
            collections: vec![collection],
            root_ott_id: parse_ott_id(&IdArg::from(root_id))?,
            user: None,
        })
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn collection_strings(&self) -> Vec<String> {
        self.collections.iter().map(ToString::to_string).collect()
    }
}

impl TryFrom<BuildParams> for BuildRequest {
    type Error = RunnerError;

    fn try_from(params: BuildParams) -> Result<Self> {
        let raw_collections = match (params.input_collection, params.input_collections) {
            (Some(_), Some(_)) => {
                return Err(RunnerError::ConflictingArguments {
                    message: "supply either \"input_collection\" or \"input_collections\", not both"
                        .to_string(),
                });
            }
            (Some(one), None) => vec![one],
            (None, Some(many)) => many,
            (None, None) => Vec::new(),
        };
        if raw_collections.is_empty() {
            return Err(RunnerError::MissingParameter {
                name: "input_collection",
            });
        }
        let mut collections = raw_collections
            .iter()
            .map(|c| CollectionRef::parse(c))
            .collect::<Result<Vec<_>>>()?;
        // Order matters to the build tool (earlier collections rank higher),
        // so only exact repeats are dropped.
        let mut seen = std::collections::HashSet::new();
        collections.retain(|c| seen.insert(c.clone()));

        let root_ott_id = match (params.root_id, params.ott_id) {
            (None, None) => return Err(RunnerError::MissingParameter { name: "root_id" }),
            (Some(root), None) => parse_ott_id(&root)?,
            (None, Some(ott)) => parse_ott_id(&ott)?,
            (Some(root), Some(ott)) => {
                let root_int = parse_ott_id(&root)?;
                let ott_int = parse_ott_id(&ott)?;
                if root_int != ott_int {
                    return Err(RunnerError::ConflictingArguments {
                        message: format!(
                            "\"root_id\" ({}) and \"ott_id\" ({}) name different taxa",
                            root.raw(),
                            ott.raw()
                        ),
                    });
                }
                root_int
            }
        };

        Ok(Self {
            collections,
            root_ott_id,
            user: params.user_initiating_run.filter(|u| !u.trim().is_empty()),
        })
    }
}

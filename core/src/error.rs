use gather_protocol::SearchPhaseName;
use gather_protocol::ShardFailureRecord;
use std::path::PathBuf;
use thiserror::Error;

/// Whole-request fatal errors. Per-shard failures never surface here unless
/// they leave the request without any usable result.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no shards available for indices {indices:?}")]
    NoShardsAvailable { indices: Vec<String> },

    #[error("all shards failed during the {phase} phase")]
    AllShardsFailed {
        phase: SearchPhaseName,
        failures: Vec<ShardFailureRecord>,
    },

    #[error("{} shard(s) failed and partial results are not allowed", failures.len())]
    PartialResultsNotAllowed { failures: Vec<ShardFailureRecord> },

    #[error("search timed out before the {phase} phase produced any result")]
    TimedOut { phase: SearchPhaseName },

    #[error("search was cancelled")]
    Cancelled,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("invalid search request: {message}")]
    InvalidRequest { message: String },

    #[error("shard resolution failed: {message}")]
    Locator { message: String },

    #[error("internal coordinator error: {message}")]
    Internal { message: String },
}

impl SearchError {
    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when the request ended without a single usable shard, either
    /// because none matched or because every one of them failed.
    pub fn is_no_shards_available(&self) -> bool {
        matches!(
            self,
            SearchError::NoShardsAvailable { .. } | SearchError::AllShardsFailed { .. }
        )
    }

    pub fn failures(&self) -> &[ShardFailureRecord] {
        match self {
            SearchError::AllShardsFailed { failures, .. }
            | SearchError::PartialResultsNotAllowed { failures } => failures,
            _ => &[],
        }
    }
}

/// Errors raised while enriching finalized hits. They fail the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("unable to fetch source from index [{index}]: _source is disabled")]
    SourceDisabled { index: String },

    #[error("script fields requested but no script engine is configured")]
    ScriptEngineMissing,

    #[error("failed to compile script field [{name}]: {message}")]
    ScriptCompilation { name: String, message: String },

    #[error("failed to execute script field [{name}]: {message}")]
    ScriptExecution { name: String, message: String },

    #[error("stored _source is not valid JSON: {message}")]
    InvalidSource { message: String },

    #[error("fetched doc {doc} references unknown segment {segment}")]
    UnknownSegment { doc: u32, segment: u32 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse coordinator config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid coordinator config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SearchError>;

use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Coordinator-wide defaults. Values set on an individual request always win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Fan-out width used when the request does not set its own cap.
    #[serde(default = "default_max_concurrent_shard_requests")]
    pub max_concurrent_shard_requests: usize,

    /// Wall-clock budget for a whole request, in milliseconds.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,

    /// Minimum time a pinned follow-up phase (query after DFS, fetch) gets
    /// to reach the copies that already answered, even past the deadline.
    #[serde(default = "default_follow_up_grace_ms")]
    pub follow_up_grace_ms: u64,

    #[serde(default = "default_track_total_hits_up_to")]
    pub default_track_total_hits_up_to: u64,

    #[serde(default = "default_true")]
    pub allow_partial_search_results: bool,

    /// Attach the running bottom sort key to query requests so shards can
    /// skip documents that cannot make the window.
    #[serde(default = "default_true")]
    pub bottom_sort_optimization: bool,

    /// Free shard contexts whose documents did not make the final window.
    #[serde(default = "default_true")]
    pub release_unused_contexts: bool,
}

fn default_max_concurrent_shard_requests() -> usize {
    5
}

fn default_follow_up_grace_ms() -> u64 {
    1_000
}

fn default_track_total_hits_up_to() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_shard_requests: default_max_concurrent_shard_requests(),
            default_timeout_ms: None,
            follow_up_grace_ms: default_follow_up_grace_ms(),
            default_track_total_hits_up_to: default_track_total_hits_up_to(),
            allow_partial_search_results: true,
            bottom_sort_optimization: true,
            release_unused_contexts: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_shard_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_shard_requests must be > 0".to_string(),
            ));
        }

        if self.default_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "default_timeout_ms must be > 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn follow_up_grace(&self) -> Duration {
        Duration::from_millis(self.follow_up_grace_ms)
    }
}

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::sort::SortField;
use crate::sort::SortSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    #[default]
    QueryThenFetch,
    /// Collect corpus-wide term statistics before scoring.
    DfsQueryThenFetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "limit", rename_all = "snake_case")]
pub enum TrackTotalHits {
    Disabled,
    /// Count exactly up to the limit; past it the total is a lower bound.
    UpTo(u64),
    Accurate,
}

impl Default for TrackTotalHits {
    fn default() -> Self {
        TrackTotalHits::UpTo(10_000)
    }
}

/// Keeps shard-local search contexts open after the response, so the caller
/// can continue iterating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeepAlive {
    Scroll { keep_alive_ms: u64 },
    PointInTime { id: String, keep_alive_ms: u64 },
}

/// The query itself is opaque to the coordinator; only the terms matter for
/// distributed term statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub terms: Vec<String>,
    #[serde(default)]
    pub body: Value,
}

impl Query {
    pub fn terms<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            terms: terms.into_iter().map(Into::into).collect(),
            body: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedQuery {
    pub name: String,
    #[serde(default)]
    pub query: Value,
}

impl NamedQuery {
    pub fn new(name: impl Into<String>, query: Value) -> Self {
        Self {
            name: name.into(),
            query,
        }
    }
}

/// `_source` projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSource {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for FetchSource {
    fn default() -> Self {
        Self {
            enabled: true,
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }
}

impl FetchSource {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn filtered<I, E>(includes: I, excludes: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            enabled: true,
            includes: includes.into_iter().map(Into::into).collect(),
            excludes: excludes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_projection(&self) -> bool {
        !self.includes.is_empty() || !self.excludes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptField {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

impl ScriptField {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            params: serde_json::Map::new(),
        }
    }
}

/// A search over one or more indices. Built once by the caller and never
/// mutated by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub indices: Vec<String>,
    #[serde(default)]
    pub query: Query,
    #[serde(default)]
    pub named_queries: Vec<NamedQuery>,
    #[serde(default)]
    pub from: usize,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default)]
    pub sort: Vec<SortField>,
    #[serde(default)]
    pub track_scores: bool,
    /// Falls back to the coordinator default when unset.
    #[serde(default)]
    pub track_total_hits: Option<TrackTotalHits>,
    #[serde(default)]
    pub search_type: SearchType,
    /// Overrides the coordinator default when set.
    #[serde(default)]
    pub max_concurrent_shard_requests: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub keep_alive: Option<KeepAlive>,
    #[serde(default)]
    pub allow_partial_search_results: Option<bool>,
    #[serde(default)]
    pub source: FetchSource,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub script_fields: Vec<ScriptField>,
}

fn default_size() -> usize {
    10
}

impl SearchRequest {
    pub fn new<I, S>(indices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            indices: indices.into_iter().map(Into::into).collect(),
            query: Query::default(),
            named_queries: Vec::new(),
            from: 0,
            size: default_size(),
            sort: Vec::new(),
            track_scores: false,
            track_total_hits: None,
            search_type: SearchType::default(),
            max_concurrent_shard_requests: None,
            timeout_ms: None,
            keep_alive: None,
            allow_partial_search_results: None,
            source: FetchSource::default(),
            fields: Vec::new(),
            script_fields: Vec::new(),
        }
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn with_window(mut self, from: usize, size: usize) -> Self {
        self.from = from;
        self.size = size;
        self
    }

    pub fn with_sort(mut self, sort: Vec<SortField>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_search_type(mut self, search_type: SearchType) -> Self {
        self.search_type = search_type;
        self
    }

    pub fn with_max_concurrent_shard_requests(mut self, max: usize) -> Self {
        self.max_concurrent_shard_requests = Some(max);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_track_total_hits(mut self, track: TrackTotalHits) -> Self {
        self.track_total_hits = Some(track);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn with_allow_partial_search_results(mut self, allow: bool) -> Self {
        self.allow_partial_search_results = Some(allow);
        self
    }

    pub fn with_source(mut self, source: FetchSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_script_field(mut self, field: ScriptField) -> Self {
        self.script_fields.push(field);
        self
    }

    pub fn with_named_query(mut self, query: NamedQuery) -> Self {
        self.named_queries.push(query);
        self
    }

    /// Number of top documents every shard must return: `from + size`.
    pub fn window(&self) -> usize {
        self.from.saturating_add(self.size)
    }

    pub fn sort_spec(&self) -> SortSpec {
        SortSpec::from_fields(&self.sort)
    }

    /// Scroll and point-in-time requests keep shard contexts open.
    pub fn is_continuation(&self) -> bool {
        self.keep_alive.is_some()
    }
}

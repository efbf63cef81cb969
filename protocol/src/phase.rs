use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::failure::ShardFailureRecord;
use crate::ids::ContextId;
use crate::ids::ShardId;
use crate::ids::ShardOrdinal;
use crate::request::FetchSource;
use crate::request::KeepAlive;
use crate::request::NamedQuery;
use crate::request::Query;
use crate::request::SearchRequest;
use crate::request::TrackTotalHits;
use crate::sort::SortField;
use crate::sort::SortValue;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SearchPhaseName {
    Dfs,
    Query,
    Fetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TermStatistics {
    pub doc_freq: u64,
    pub total_term_freq: u64,
}

/// Term statistics summed over every shard that answered the DFS phase.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregatedDfs {
    pub term_stats: BTreeMap<String, TermStatistics>,
    pub max_doc: u64,
}

/// Shared by the DFS and query phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSearchRequest {
    pub shard_id: ShardId,
    pub ordinal: ShardOrdinal,
    pub shard_count: usize,
    pub query: Query,
    pub sort: Vec<SortField>,
    /// `from + size` of the original request.
    pub size: usize,
    pub track_scores: bool,
    pub track_total_hits: TrackTotalHits,
    #[serde(default)]
    pub keep_alive: Option<KeepAlive>,
    /// Worst sort key still inside the global window; documents that sort
    /// strictly after it cannot reach the response.
    #[serde(default)]
    pub bottom_sort_values: Option<Vec<SortValue>>,
    /// Context created by the DFS phase on the same copy.
    #[serde(default)]
    pub context_id: Option<ContextId>,
    #[serde(default)]
    pub dfs: Option<AggregatedDfs>,
}

impl ShardSearchRequest {
    pub fn from_request(
        request: &SearchRequest,
        shard_id: ShardId,
        ordinal: ShardOrdinal,
        shard_count: usize,
    ) -> Self {
        Self {
            shard_id,
            ordinal,
            shard_count,
            query: request.query.clone(),
            sort: request.sort.clone(),
            size: request.window(),
            track_scores: request.track_scores,
            track_total_hits: request.track_total_hits.unwrap_or_default(),
            keep_alive: request.keep_alive.clone(),
            bottom_sort_values: None,
            context_id: None,
            dfs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardFetchRequest {
    pub shard_id: ShardId,
    pub ordinal: ShardOrdinal,
    pub context_id: ContextId,
    /// Sorted ascending.
    pub doc_ids: Vec<u32>,
    pub source: FetchSource,
    #[serde(default)]
    pub named_queries: Vec<NamedQuery>,
    /// Keep the context after the fetch instead of freeing it.
    #[serde(default)]
    pub keep_context: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ShardRequest {
    Dfs(ShardSearchRequest),
    Query(ShardSearchRequest),
    Fetch(ShardFetchRequest),
    ReleaseContext { context_id: ContextId },
}

impl ShardRequest {
    pub fn phase(&self) -> Option<SearchPhaseName> {
        match self {
            ShardRequest::Dfs(_) => Some(SearchPhaseName::Dfs),
            ShardRequest::Query(_) => Some(SearchPhaseName::Query),
            ShardRequest::Fetch(_) => Some(SearchPhaseName::Fetch),
            ShardRequest::ReleaseContext { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DfsResult {
    pub context_id: ContextId,
    pub term_stats: BTreeMap<String, TermStatistics>,
    pub max_doc: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDoc {
    pub doc: u32,
    pub score: f32,
    #[serde(default)]
    pub sort_values: Vec<SortValue>,
}

impl ScoreDoc {
    pub fn scored(doc: u32, score: f32) -> Self {
        Self {
            doc,
            score,
            sort_values: Vec::new(),
        }
    }

    pub fn sorted(doc: u32, sort_values: Vec<SortValue>) -> Self {
        Self {
            doc,
            score: f32::NAN,
            sort_values,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalHitsRelation {
    Eq,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalHits {
    pub value: u64,
    pub relation: TotalHitsRelation,
}

impl TotalHits {
    pub fn exact(value: u64) -> Self {
        Self {
            value,
            relation: TotalHitsRelation::Eq,
        }
    }

    pub fn at_least(value: u64) -> Self {
        Self {
            value,
            relation: TotalHitsRelation::Gte,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub context_id: ContextId,
    /// Sorted by the request's sort, at most `from + size` long.
    pub top_docs: Vec<ScoreDoc>,
    #[serde(default)]
    pub total_hits: Option<TotalHits>,
    #[serde(default)]
    pub max_score: Option<f32>,
    /// The shard stopped early because of its local time budget.
    #[serde(default)]
    pub timed_out: bool,
}

/// Position of a nested child document inside its root document's source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NestedIdentity {
    pub field: String,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedDoc {
    pub doc: u32,
    pub segment: u32,
    /// Raw stored `_source`, if the index keeps it.
    #[serde(default)]
    pub source: Option<Bytes>,
    #[serde(default)]
    pub nested: Option<NestedIdentity>,
}

/// Per-segment information the fetch stages need, reported by the shard
/// alongside the documents.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub ord: u32,
    pub source_enabled: bool,
    /// For every named query of the request, the fetched docs in this segment
    /// that match it.
    #[serde(default)]
    pub named_matches: BTreeMap<String, Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub context_id: ContextId,
    /// In segment order.
    pub segments: Vec<SegmentInfo>,
    pub docs: Vec<FetchedDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ShardResponse {
    Dfs(DfsResult),
    Query(QueryResult),
    Fetch(FetchResult),
    Released,
}

/// Terminal outcome of one shard ordinal in one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseResult {
    Dfs(DfsResult),
    Query(QueryResult),
    Fetch(FetchResult),
    Failure(ShardFailureRecord),
}

impl PhaseResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, PhaseResult::Failure(_))
    }

    pub fn context_id(&self) -> Option<&ContextId> {
        match self {
            PhaseResult::Dfs(result) => Some(&result.context_id),
            PhaseResult::Query(result) => Some(&result.context_id),
            PhaseResult::Fetch(result) => Some(&result.context_id),
            PhaseResult::Failure(_) => None,
        }
    }

    /// Maps a shard response onto the result variant expected for `phase`.
    /// A response for a different phase is returned back as `Err`.
    pub fn from_response(
        phase: SearchPhaseName,
        response: ShardResponse,
    ) -> Result<Self, ShardResponse> {
        match (phase, response) {
            (SearchPhaseName::Dfs, ShardResponse::Dfs(result)) => Ok(PhaseResult::Dfs(result)),
            (SearchPhaseName::Query, ShardResponse::Query(result)) => {
                Ok(PhaseResult::Query(result))
            }
            (SearchPhaseName::Fetch, ShardResponse::Fetch(result)) => {
                Ok(PhaseResult::Fetch(result))
            }
            (_, other) => Err(other),
        }
    }
}

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::failure::ShardFailureRecord;
use crate::ids::ContextId;
use crate::ids::ShardOrdinal;
use crate::ids::ShardTarget;
use crate::phase::NestedIdentity;
use crate::phase::SearchPhaseName;
use crate::phase::TotalHits;
use crate::sort::SortValue;

/// A fully materialized result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub index: String,
    pub shard: ShardTarget,
    pub ordinal: ShardOrdinal,
    pub doc: u32,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub sort_values: Vec<SortValue>,
    #[serde(default)]
    pub source: Option<Bytes>,
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub matched_queries: Vec<String>,
    #[serde(default)]
    pub nested: Option<NestedIdentity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShardStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTook {
    pub phase: SearchPhaseName,
    pub took: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardContext {
    pub target: ShardTarget,
    pub context_id: ContextId,
}

/// Shard contexts left open for a scroll or point-in-time continuation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Continuation {
    pub contexts: Vec<ShardContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    #[serde(default)]
    pub total_hits: Option<TotalHits>,
    #[serde(default)]
    pub max_score: Option<f32>,
    pub took: Duration,
    #[serde(default)]
    pub phase_took: Vec<PhaseTook>,
    pub shards: ShardStats,
    /// Always present, empty when every shard succeeded.
    #[serde(default)]
    pub failures: Vec<ShardFailureRecord>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub continuation: Option<Continuation>,
}

impl SearchResponse {
    pub fn empty(took: Duration) -> Self {
        Self {
            hits: Vec::new(),
            total_hits: Some(TotalHits::exact(0)),
            max_score: None,
            took,
            phase_took: Vec::new(),
            shards: ShardStats::default(),
            failures: Vec::new(),
            timed_out: false,
            continuation: None,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

//! Data model exchanged between the search coordinator and the shards it
//! fans out to.
//!
//! Everything in this crate is plain data: identities of shards and their
//! physical copies, the immutable [`SearchRequest`], the per-phase
//! [`ShardRequest`]/[`ShardResponse`] pairs, the coordinator-side
//! [`PhaseResult`] sum type, and the merged [`SearchResponse`].

mod failure;
mod ids;
mod phase;
mod request;
mod response;
mod sort;

pub use failure::FailureClass;
pub use failure::ShardError;
pub use failure::ShardFailureRecord;
pub use ids::ContextId;
pub use ids::NodeId;
pub use ids::ShardGroup;
pub use ids::ShardId;
pub use ids::ShardOrdinal;
pub use ids::ShardTarget;
pub use phase::AggregatedDfs;
pub use phase::DfsResult;
pub use phase::FetchResult;
pub use phase::FetchedDoc;
pub use phase::NestedIdentity;
pub use phase::PhaseResult;
pub use phase::QueryResult;
pub use phase::ScoreDoc;
pub use phase::SearchPhaseName;
pub use phase::SegmentInfo;
pub use phase::ShardFetchRequest;
pub use phase::ShardRequest;
pub use phase::ShardResponse;
pub use phase::ShardSearchRequest;
pub use phase::TermStatistics;
pub use phase::TotalHits;
pub use phase::TotalHitsRelation;
pub use request::FetchSource;
pub use request::KeepAlive;
pub use request::NamedQuery;
pub use request::Query;
pub use request::ScriptField;
pub use request::SearchRequest;
pub use request::SearchType;
pub use request::TrackTotalHits;
pub use response::Continuation;
pub use response::PhaseTook;
pub use response::SearchHit;
pub use response::SearchResponse;
pub use response::ShardContext;
pub use response::ShardStats;
pub use sort::SCORE_FIELD;
pub use sort::SortField;
pub use sort::SortOrder;
pub use sort::SortSpec;
pub use sort::SortValue;

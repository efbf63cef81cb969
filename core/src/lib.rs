//! Scatter-gather search coordination.
//!
//! A [`SearchCoordinator`] resolves the shards a [`SearchRequest`] touches,
//! fans the request out phase by phase (optional DFS, query, fetch), merges
//! the per-shard results into one globally ordered window and enriches the
//! surviving hits through the fetch sub-phase pipeline.
//!
//! [`SearchRequest`]: gather_protocol::SearchRequest

mod bottom_sort;
mod config;
mod coordinator;
pub mod error;
mod failures;
pub mod fetch;
mod listener;
pub mod phase;
mod reducer;
mod result_store;
mod retry;
mod transport;

pub use bottom_sort::BottomSortValuesCollector;
pub use config::CoordinatorConfig;
pub use coordinator::SearchCoordinator;
pub use coordinator::execute;
pub use error::ConfigError;
pub use error::FetchError;
pub use error::SearchError;
pub use failures::ShardFailureSet;
pub use listener::PhaseContext;
pub use listener::PhaseListener;
pub use listener::PhaseListenerBus;
pub use listener::PhaseSummary;
pub use listener::TracingPhaseListener;
pub use reducer::RankedDoc;
pub use reducer::ReducedQueryPhase;
pub use reducer::ResultReducer;
pub use reducer::compare_ranked;
pub use result_store::PhaseResultStore;
pub use result_store::SlotEntry;
pub use result_store::SlotError;
pub use result_store::SlotWrite;
pub use retry::DefaultRetryPolicy;
pub use retry::RetryPolicy;
pub use transport::LocatorError;
pub use transport::RpcClient;
pub use transport::ShardLocator;

mod executor;
mod fanout;
mod state;

use gather_protocol::AggregatedDfs;
use gather_protocol::SearchPhaseName;
use gather_protocol::SearchRequest;
use gather_protocol::SearchType;

use crate::reducer::ReducedQueryPhase;
use crate::reducer::ResultReducer;
use crate::result_store::PhaseResultStore;

pub use executor::ExecutorSettings;
pub use executor::PhaseExecutor;
pub use state::ExecutorState;
pub use state::StateMachine;
pub use state::Transition;

/// What the executor does once every slot of a phase holds a result.
#[derive(Debug, Clone, PartialEq)]
pub enum NextPhase {
    Query { dfs: Option<AggregatedDfs> },
    Fetch {
        reduced: ReducedQueryPhase,
        /// Per ordinal, the doc ids inside the window.
        docs_to_load: Vec<Vec<u32>>,
    },
    /// Go straight to the final reduce. `reduced` is `None` after the fetch
    /// phase, whose reduction already happened before it.
    Reduce { reduced: Option<ReducedQueryPhase> },
}

pub fn first_phase(request: &SearchRequest) -> SearchPhaseName {
    match request.search_type {
        SearchType::DfsQueryThenFetch => SearchPhaseName::Dfs,
        SearchType::QueryThenFetch => SearchPhaseName::Query,
    }
}

/// Decides the step after the phase `store` belongs to. Depends only on its
/// arguments.
pub fn get_next_phase(
    store: &PhaseResultStore,
    reducer: &ResultReducer,
    counting_relaxed: bool,
) -> NextPhase {
    match store.phase() {
        SearchPhaseName::Dfs => NextPhase::Query {
            dfs: Some(reducer.aggregate_dfs(store.dfs_results().map(|(_, result)| result))),
        },
        SearchPhaseName::Query => {
            let reduced = reducer.reduce_query(store.query_results(), counting_relaxed);
            if reduced.hits.is_empty() {
                NextPhase::Reduce {
                    reduced: Some(reduced),
                }
            } else {
                let docs_to_load = reducer.doc_ids_to_load(&reduced.hits, store.len());
                NextPhase::Fetch {
                    reduced,
                    docs_to_load,
                }
            }
        }
        SearchPhaseName::Fetch => NextPhase::Reduce { reduced: None },
    }
}

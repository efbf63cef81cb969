use futures::StreamExt;
use futures::stream;
use gather_protocol::AggregatedDfs;
use gather_protocol::Continuation;
use gather_protocol::ContextId;
use gather_protocol::PhaseResult;
use gather_protocol::PhaseTook;
use gather_protocol::SearchHit;
use gather_protocol::SearchPhaseName;
use gather_protocol::SearchRequest;
use gather_protocol::SearchResponse;
use gather_protocol::ShardContext;
use gather_protocol::ShardError;
use gather_protocol::ShardFetchRequest;
use gather_protocol::ShardGroup;
use gather_protocol::ShardOrdinal;
use gather_protocol::ShardRequest;
use gather_protocol::ShardSearchRequest;
use gather_protocol::ShardStats;
use gather_protocol::ShardTarget;
use gather_protocol::SortSpec;
use gather_protocol::TrackTotalHits;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use super::NextPhase;
use super::fanout::FanOut;
use super::fanout::PhaseOutcome;
use super::fanout::ShardTask;
use super::first_phase;
use super::get_next_phase;
use super::state::ExecutorState;
use super::state::StateMachine;
use super::state::Transition;
use crate::bottom_sort::BottomSortValuesCollector;
use crate::config::CoordinatorConfig;
use crate::error::SearchError;
use crate::failures::ShardFailureSet;
use crate::fetch::FetchPipeline;
use crate::fetch::HitContext;
use crate::fetch::PerHitStageFactory;
use crate::listener::PhaseListenerBus;
use crate::reducer::RankedDoc;
use crate::reducer::ReducedQueryPhase;
use crate::reducer::ResultReducer;
use crate::result_store::PhaseResultStore;
use crate::retry::RetryPolicy;
use crate::transport::LocatorError;
use crate::transport::RpcClient;
use crate::transport::ShardLocator;

/// Per-request knobs, resolved from request overrides and the coordinator
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub max_concurrent_shard_requests: usize,
    pub timeout: Option<Duration>,
    pub follow_up_grace: Duration,
    pub track_total_hits: TrackTotalHits,
    pub allow_partial_search_results: bool,
    pub bottom_sort_optimization: bool,
    pub release_unused_contexts: bool,
}

impl ExecutorSettings {
    pub fn resolve(config: &CoordinatorConfig, request: &SearchRequest) -> Self {
        Self {
            max_concurrent_shard_requests: request
                .max_concurrent_shard_requests
                .unwrap_or(config.max_concurrent_shard_requests),
            timeout: request
                .timeout_ms
                .map(Duration::from_millis)
                .or_else(|| config.default_timeout()),
            follow_up_grace: config.follow_up_grace(),
            track_total_hits: request
                .track_total_hits
                .unwrap_or(TrackTotalHits::UpTo(config.default_track_total_hits_up_to)),
            allow_partial_search_results: request
                .allow_partial_search_results
                .unwrap_or(config.allow_partial_search_results),
            bottom_sort_optimization: config.bottom_sort_optimization,
            release_unused_contexts: config.release_unused_contexts,
        }
    }
}

/// Everything a phase reads while it runs. Kept apart from the state
/// machine so phases can borrow both at once.
struct ExecutionContext<'a> {
    request: &'a SearchRequest,
    settings: ExecutorSettings,
    rpc: Arc<dyn RpcClient>,
    retry: Arc<dyn RetryPolicy>,
    stage_factory: Arc<dyn PerHitStageFactory>,
    listeners: PhaseListenerBus,
    groups: Vec<ShardGroup>,
    failures: ShardFailureSet,
    started: Instant,
    deadline: Option<Instant>,
}

/// Drives one search request through DFS, query, fetch and the final
/// reduce. Owns all per-request state; nothing outlives the request.
pub struct PhaseExecutor<'a> {
    ctx: ExecutionContext<'a>,
    machine: StateMachine,
    current_phase: Option<SearchPhaseName>,
}

impl<'a> PhaseExecutor<'a> {
    pub fn new(
        request: &'a SearchRequest,
        settings: ExecutorSettings,
        rpc: Arc<dyn RpcClient>,
        retry: Arc<dyn RetryPolicy>,
        stage_factory: Arc<dyn PerHitStageFactory>,
        listeners: PhaseListenerBus,
    ) -> Self {
        let started = Instant::now();
        Self {
            ctx: ExecutionContext {
                request,
                settings,
                rpc,
                retry,
                stage_factory,
                listeners,
                groups: Vec::new(),
                failures: ShardFailureSet::new(),
                started,
                deadline: settings.timeout.map(|timeout| started + timeout),
            },
            machine: StateMachine::new(),
            current_phase: None,
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.machine.state()
    }

    pub fn trace(&self) -> &[Transition] {
        self.machine.trace()
    }

    pub fn into_trace(self) -> Vec<Transition> {
        self.machine.into_trace()
    }

    /// Resolves the shard groups the request fans out to.
    pub fn start(&mut self, locator: &dyn ShardLocator) -> Result<(), SearchError> {
        match locator.resolve(self.ctx.request) {
            Ok(groups) => {
                debug!(shards = groups.len(), "resolved shard groups");
                self.ctx.groups = groups;
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    LocatorError::NoShardsAvailable { indices } => {
                        SearchError::NoShardsAvailable { indices }
                    }
                    LocatorError::Other(message) => SearchError::Locator { message },
                };
                self.machine.fail();
                Err(err)
            }
        }
    }

    pub async fn run(&mut self) -> Result<SearchResponse, SearchError> {
        let result = self.run_phases().await;
        if let Err(err) = &result {
            self.abort(err);
        }
        result
    }

    /// Marks the request failed, for instance after its run future was
    /// dropped on cancellation.
    pub fn abort(&mut self, error: &SearchError) {
        if self.machine.state().is_terminal() {
            return;
        }
        if let Some(phase) = self.current_phase {
            self.ctx.listeners.phase_failure(phase, error);
        }
        self.machine.fail();
    }

    async fn run_phases(&mut self) -> Result<SearchResponse, SearchError> {
        let ctx = &self.ctx;
        // Built up front so a misconfigured fetch fails before any shard work.
        let mut pipeline = FetchPipeline::build(ctx.stage_factory.as_ref(), ctx.request)?;

        if ctx.groups.is_empty() {
            self.machine.transition(ExecutorState::Reducing)?;
            self.machine.transition(ExecutorState::Done)?;
            return Ok(SearchResponse::empty(ctx.started.elapsed()));
        }

        let shard_count = ctx.groups.len();
        let first = first_phase(ctx.request);
        let reducer =
            ResultReducer::new(ctx.request).with_track_total_hits(ctx.settings.track_total_hits);
        let mut phase_took = Vec::new();
        let mut timed_out = false;

        let mut dfs: Option<(PhaseResultStore, AggregatedDfs)> = None;
        if first == SearchPhaseName::Dfs {
            self.current_phase = Some(SearchPhaseName::Dfs);
            let store = PhaseResultStore::new(SearchPhaseName::Dfs, shard_count);
            let outcome = ctx
                .fan_out(true)
                .run(
                    &mut self.machine,
                    &store,
                    ctx.initial_tasks(),
                    |ordinal| ctx.shard_search_request(ordinal).map(ShardRequest::Dfs),
                    |_, _| {},
                )
                .await?;
            timed_out |= ctx.record_outcome(&store, outcome, &mut phase_took, true)?;
            let NextPhase::Query { dfs: Some(stats) } = get_next_phase(&store, &reducer, false)
            else {
                return Err(SearchError::internal("dfs phase must be followed by query"));
            };
            dfs = Some((store, stats));
        }

        self.current_phase = Some(SearchPhaseName::Query);
        let (query_store, tasks) = match &dfs {
            Some((dfs_store, _)) => {
                // The query phase reuses the context each copy opened for DFS.
                let tasks: Vec<ShardTask> = dfs_store
                    .iter()
                    .filter(|(_, entry)| !entry.result.is_failure())
                    .filter_map(|(ordinal, entry)| {
                        entry
                            .target
                            .clone()
                            .map(|target| ShardTask::pinned(ordinal, target))
                    })
                    .collect();
                let participants: Vec<ShardOrdinal> =
                    tasks.iter().map(ShardTask::ordinal).collect();
                let store =
                    PhaseResultStore::for_ordinals(SearchPhaseName::Query, shard_count, participants);
                (store, tasks)
            }
            None => (
                PhaseResultStore::new(SearchPhaseName::Query, shard_count),
                ctx.initial_tasks(),
            ),
        };

        let collector = ctx.bottom_sort_collector(first);
        let counting_relaxed = AtomicBool::new(false);
        let build_query = |ordinal: ShardOrdinal| -> Result<ShardRequest, ShardError> {
            let mut shard_request = ctx.shard_search_request(ordinal)?;
            if let Some((dfs_store, stats)) = &dfs {
                shard_request.context_id = dfs_store
                    .result(ordinal)
                    .and_then(PhaseResult::context_id)
                    .cloned();
                shard_request.dfs = Some(stats.clone());
            }
            if let Some(collector) = &collector {
                if let TrackTotalHits::UpTo(limit) = shard_request.track_total_hits
                    && collector.total_hits() > limit
                {
                    shard_request.track_total_hits = TrackTotalHits::Disabled;
                    counting_relaxed.store(true, Ordering::Release);
                }
                shard_request.bottom_sort_values = collector.bottom_sort_values();
            }
            Ok(ShardRequest::Query(shard_request))
        };
        let on_query_result = |_ordinal: ShardOrdinal, result: &PhaseResult| {
            if let Some(collector) = &collector
                && let PhaseResult::Query(query) = result
            {
                collector.consume(&query.top_docs, query.total_hits);
            }
        };
        let outcome = ctx
            .fan_out(first == SearchPhaseName::Query)
            .run(
                &mut self.machine,
                &query_store,
                tasks,
                build_query,
                on_query_result,
            )
            .await?;
        timed_out |= ctx.record_outcome(
            &query_store,
            outcome,
            &mut phase_took,
            first == SearchPhaseName::Query,
        )?;

        let relaxed = counting_relaxed.load(Ordering::Acquire);
        let (reduced, fetch_store) = match get_next_phase(&query_store, &reducer, relaxed) {
            NextPhase::Reduce {
                reduced: Some(reduced),
            } => {
                ctx.release_contexts(&query_store, &[]).await;
                (reduced, None)
            }
            NextPhase::Fetch {
                reduced,
                docs_to_load,
            } => {
                self.current_phase = Some(SearchPhaseName::Fetch);
                let fetch_requests = ctx.fetch_requests(&query_store, &docs_to_load);
                let tasks: Vec<ShardTask> = fetch_requests
                    .keys()
                    .filter_map(|ordinal| {
                        query_store
                            .target(*ordinal)
                            .cloned()
                            .map(|target| ShardTask::pinned(*ordinal, target))
                    })
                    .collect();
                let store = PhaseResultStore::for_ordinals(
                    SearchPhaseName::Fetch,
                    shard_count,
                    tasks.iter().map(ShardTask::ordinal).collect::<Vec<_>>(),
                );
                let outcome = ctx
                    .fan_out(false)
                    .run(
                        &mut self.machine,
                        &store,
                        tasks,
                        |ordinal| {
                            fetch_requests
                                .get(&ordinal)
                                .cloned()
                                .map(ShardRequest::Fetch)
                                .ok_or_else(|| {
                                    ShardError::internal("no query context to fetch from")
                                })
                        },
                        |_, _| {},
                    )
                    .await?;
                timed_out |= ctx.record_outcome(&store, outcome, &mut phase_took, false)?;
                ctx.release_contexts(&query_store, &docs_to_load).await;
                (reduced, Some(store))
            }
            other => {
                return Err(SearchError::internal(format!(
                    "unexpected step after the query phase: {other:?}"
                )));
            }
        };

        self.machine.transition(ExecutorState::Reducing)?;
        let hits = match &fetch_store {
            Some(store) => ctx.merge_hits(&reduced.hits, store, &mut pipeline)?,
            None => Vec::new(),
        };
        let response = ctx.response(hits, &reduced, phase_took, timed_out, &query_store);
        self.machine.transition(ExecutorState::Done)?;
        info!(
            hits = response.hits.len(),
            shards = response.shards.total,
            failed = response.shards.failed,
            took_ms = response.took.as_millis() as u64,
            "search completed"
        );
        Ok(response)
    }
}

impl ExecutionContext<'_> {
    fn fan_out(&self, first_phase: bool) -> FanOut<'_> {
        FanOut {
            rpc: self.rpc.as_ref(),
            retry: self.retry.as_ref(),
            listeners: &self.listeners,
            failures: &self.failures,
            max_concurrent: self.settings.max_concurrent_shard_requests,
            deadline: self.phase_deadline(first_phase),
        }
    }

    /// Follow-up phases only talk to copies that already answered, so they
    /// always get at least the grace period, even once the deadline passed.
    fn phase_deadline(&self, first_phase: bool) -> Option<Instant> {
        let deadline = self.deadline?;
        if first_phase {
            return Some(deadline);
        }
        Some(deadline.max(Instant::now() + self.settings.follow_up_grace))
    }

    fn initial_tasks(&self) -> Vec<ShardTask> {
        self.groups
            .iter()
            .enumerate()
            .map(|(index, group)| {
                ShardTask::new(
                    ShardOrdinal::new(index),
                    group.shard_id.clone(),
                    group.candidates.clone(),
                )
            })
            .collect()
    }

    fn shard_search_request(&self, ordinal: ShardOrdinal) -> Result<ShardSearchRequest, ShardError> {
        let group = self
            .groups
            .get(ordinal.get())
            .ok_or_else(|| ShardError::internal(format!("no shard group for ordinal {ordinal}")))?;
        let mut request = ShardSearchRequest::from_request(
            self.request,
            group.shard_id.clone(),
            ordinal,
            self.groups.len(),
        );
        request.track_total_hits = self.settings.track_total_hits;
        Ok(request)
    }

    /// The collector only pays off when several shards compete for a window
    /// ordered by explicit sort fields.
    fn bottom_sort_collector(&self, first: SearchPhaseName) -> Option<BottomSortValuesCollector> {
        let sort = self.request.sort_spec();
        let applicable = self.settings.bottom_sort_optimization
            && first == SearchPhaseName::Query
            && !self.request.is_continuation()
            && self.groups.len() > 1
            && self.request.window() > 0
            && matches!(sort, SortSpec::Fields(_))
            && !sort.is_relevance_first();
        if !applicable {
            return None;
        }
        Some(BottomSortValuesCollector::new(self.request.window(), sort))
    }

    /// Appends the phase timing and fails the request when the phase left
    /// nothing to continue with. Returns whether the deadline expired.
    fn record_outcome(
        &self,
        store: &PhaseResultStore,
        outcome: PhaseOutcome,
        phase_took: &mut Vec<PhaseTook>,
        is_first_phase: bool,
    ) -> Result<bool, SearchError> {
        let phase = store.phase();
        phase_took.push(PhaseTook {
            phase,
            took: outcome.took,
        });
        if store.expected() > 0 && store.successes() == 0 {
            if is_first_phase && outcome.deadline_expired {
                return Err(SearchError::TimedOut { phase });
            }
            return Err(SearchError::AllShardsFailed {
                phase,
                failures: self.failures.snapshot(),
            });
        }
        if !self.settings.allow_partial_search_results && !self.failures.is_empty() {
            return Err(SearchError::PartialResultsNotAllowed {
                failures: self.failures.snapshot(),
            });
        }
        Ok(outcome.deadline_expired)
    }

    /// One fetch request per ordinal that has documents inside the window.
    fn fetch_requests(
        &self,
        query_store: &PhaseResultStore,
        docs_to_load: &[Vec<u32>],
    ) -> BTreeMap<ShardOrdinal, ShardFetchRequest> {
        query_store
            .query_results()
            .filter_map(|(ordinal, result)| {
                let doc_ids = docs_to_load.get(ordinal.get())?;
                if doc_ids.is_empty() {
                    return None;
                }
                let shard_id = self.groups.get(ordinal.get())?.shard_id.clone();
                Some((
                    ordinal,
                    ShardFetchRequest {
                        shard_id,
                        ordinal,
                        context_id: result.context_id.clone(),
                        doc_ids: doc_ids.clone(),
                        source: self.request.source.clone(),
                        named_queries: self.request.named_queries.clone(),
                        keep_context: self.request.is_continuation(),
                    },
                ))
            })
            .collect()
    }

    /// Best-effort release of query contexts that no fetch will read.
    async fn release_contexts(&self, query_store: &PhaseResultStore, docs_to_load: &[Vec<u32>]) {
        if self.request.is_continuation() || !self.settings.release_unused_contexts {
            return;
        }
        let unused: Vec<(ShardTarget, ContextId)> = query_store
            .query_results()
            .filter(|(ordinal, _)| {
                docs_to_load
                    .get(ordinal.get())
                    .is_none_or(Vec::is_empty)
            })
            .filter_map(|(ordinal, result)| {
                query_store
                    .target(ordinal)
                    .map(|target| (target.clone(), result.context_id.clone()))
            })
            .collect();
        if unused.is_empty() {
            return;
        }

        let rpc = self.rpc.as_ref();
        stream::iter(unused)
            .map(|(target, context_id)| async move {
                let request = ShardRequest::ReleaseContext {
                    context_id: context_id.clone(),
                };
                if let Err(err) = rpc.send(&target, request).await {
                    debug!(
                        shard = %target,
                        context = %context_id,
                        error = %err,
                        "failed to release search context"
                    );
                }
            })
            .buffer_unordered(self.settings.max_concurrent_shard_requests.max(1))
            .collect::<Vec<()>>()
            .await;
    }

    /// Runs the fetch pipeline over every fetched shard and lays the hits out
    /// in reduced order. Documents whose fetch failed are dropped.
    fn merge_hits(
        &self,
        ranked: &[RankedDoc],
        fetch_store: &PhaseResultStore,
        pipeline: &mut FetchPipeline,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let mut fetched: HashMap<(ShardOrdinal, u32), HitContext> = HashMap::new();
        for (ordinal, result) in fetch_store.fetch_results() {
            let Some(group) = self.groups.get(ordinal.get()) else {
                continue;
            };
            for hit in pipeline.run(ordinal, &group.shard_id, result)? {
                fetched.insert((ordinal, hit.doc()), hit);
            }
        }

        let mut hits = Vec::with_capacity(ranked.len());
        for doc in ranked {
            let (Some(context), Some(target)) = (
                fetched.remove(&(doc.ordinal, doc.doc.doc)),
                fetch_store.target(doc.ordinal),
            ) else {
                debug!(
                    ordinal = doc.ordinal.get(),
                    doc = doc.doc.doc,
                    "dropping hit without fetch result"
                );
                continue;
            };
            hits.push(search_hit(doc, target, context));
        }
        Ok(hits)
    }

    fn response(
        &self,
        hits: Vec<SearchHit>,
        reduced: &ReducedQueryPhase,
        phase_took: Vec<PhaseTook>,
        timed_out: bool,
        query_store: &PhaseResultStore,
    ) -> SearchResponse {
        let total = self.groups.len();
        let failures = self.failures.snapshot();
        let continuation = self.request.is_continuation().then(|| Continuation {
            contexts: query_store
                .query_results()
                .filter_map(|(ordinal, result)| {
                    query_store.target(ordinal).map(|target| ShardContext {
                        target: target.clone(),
                        context_id: result.context_id.clone(),
                    })
                })
                .collect(),
        });
        SearchResponse {
            hits,
            total_hits: reduced.total_hits,
            max_score: reduced.max_score,
            took: self.started.elapsed(),
            phase_took,
            shards: ShardStats {
                total,
                successful: total.saturating_sub(failures.len()),
                failed: failures.len(),
            },
            failures,
            timed_out: timed_out || reduced.timed_out,
            continuation,
        }
    }
}

fn search_hit(ranked: &RankedDoc, target: &ShardTarget, context: HitContext) -> SearchHit {
    let nested = context.nested().cloned();
    let score = ranked.doc.score;
    SearchHit {
        index: target.shard_id.index.clone(),
        shard: target.clone(),
        ordinal: ranked.ordinal,
        doc: ranked.doc.doc,
        score: (!score.is_nan()).then_some(score),
        sort_values: ranked.doc.sort_values.clone(),
        source: context.source,
        fields: context.fields,
        matched_queries: context.matched_queries,
        nested,
    }
}

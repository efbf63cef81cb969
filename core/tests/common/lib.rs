//! In-memory cluster used by the coordinator integration tests. It plays both
//! the shard locator and the shard transport, records every request it sees
//! and can inject failures and latency per copy.

use async_trait::async_trait;
use bytes::Bytes;
use gather_core::CoordinatorConfig;
use gather_core::LocatorError;
use gather_core::RpcClient;
use gather_core::SearchCoordinator;
use gather_core::ShardLocator;
use gather_protocol::ContextId;
use gather_protocol::DfsResult;
use gather_protocol::FetchResult;
use gather_protocol::FetchedDoc;
use gather_protocol::NodeId;
use gather_protocol::QueryResult;
use gather_protocol::ScoreDoc;
use gather_protocol::SearchPhaseName;
use gather_protocol::SearchRequest;
use gather_protocol::SearchResponse;
use gather_protocol::SegmentInfo;
use gather_protocol::ShardError;
use gather_protocol::ShardFetchRequest;
use gather_protocol::ShardGroup;
use gather_protocol::ShardId;
use gather_protocol::ShardRequest;
use gather_protocol::ShardResponse;
use gather_protocol::ShardSearchRequest;
use gather_protocol::ShardTarget;
use gather_protocol::SortSpec;
use gather_protocol::SortValue;
use gather_protocol::TermStatistics;
use gather_protocol::TotalHits;
use gather_protocol::TrackTotalHits;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Duration;

/// One indexed document of a fake shard.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeDoc {
    pub id: u32,
    pub score: f32,
    pub sort_values: Vec<SortValue>,
    pub source: Option<Value>,
    pub segment: u32,
    pub terms: Vec<String>,
    pub named_queries: Vec<String>,
}

impl FakeDoc {
    pub fn scored(id: u32, score: f32) -> Self {
        Self {
            id,
            score,
            sort_values: Vec::new(),
            source: Some(serde_json::json!({ "id": id })),
            segment: 0,
            terms: Vec::new(),
            named_queries: Vec::new(),
        }
    }

    pub fn sorted(id: u32, sort_values: Vec<SortValue>) -> Self {
        Self {
            sort_values,
            ..Self::scored(id, 1.0)
        }
    }

    pub fn with_source(mut self, source: Value) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_segment(mut self, segment: u32) -> Self {
        self.segment = segment;
        self
    }

    pub fn with_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terms = terms.into_iter().map(Into::into).collect();
        self
    }

    pub fn matching_query(mut self, name: impl Into<String>) -> Self {
        self.named_queries.push(name.into());
        self
    }

    fn matches(&self, terms: &[String]) -> bool {
        terms.is_empty() || terms.iter().any(|term| self.terms.contains(term))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub target: ShardTarget,
    pub request: ShardRequest,
}

#[derive(Debug)]
struct FakeShard {
    shard_id: ShardId,
    nodes: Vec<NodeId>,
    docs: Vec<FakeDoc>,
    source_enabled: bool,
}

#[derive(Debug, Clone)]
enum Action {
    Fail(ShardError),
    Delay(Duration),
}

#[derive(Debug, Clone)]
struct Rule {
    shard: Option<ShardId>,
    node: Option<NodeId>,
    phase: Option<SearchPhaseName>,
    action: Action,
}

impl Rule {
    fn applies(&self, target: &ShardTarget, phase: Option<SearchPhaseName>) -> bool {
        self.shard.as_ref().is_none_or(|shard| *shard == target.shard_id)
            && self.node.as_ref().is_none_or(|node| *node == target.node_id)
            && self.phase.is_none_or(|expected| Some(expected) == phase)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Gauge {
    current: usize,
    max: usize,
}

#[derive(Debug, Default)]
struct InFlight {
    total: Gauge,
    per_shard: HashMap<ShardId, Gauge>,
}

#[derive(Debug, Default)]
pub struct InMemoryCluster {
    shards: Vec<FakeShard>,
    rules: Vec<Rule>,
    locator_error: Option<LocatorError>,
    next_context: AtomicU64,
    open_contexts: Mutex<HashSet<ContextId>>,
    released: Mutex<Vec<ContextId>>,
    requests: Mutex<Vec<RecordedRequest>>,
    in_flight: Mutex<InFlight>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds shard `shard` of `index` with a copy on every node of `nodes`,
    /// tried in that order.
    pub fn add_shard(
        &mut self,
        index: &str,
        shard: u32,
        nodes: &[&str],
        docs: Vec<FakeDoc>,
    ) -> &mut Self {
        self.shards.push(FakeShard {
            shard_id: ShardId::new(index, shard),
            nodes: nodes.iter().map(|node| NodeId::new(*node)).collect(),
            docs,
            source_enabled: true,
        });
        self
    }

    pub fn disable_source(&mut self, shard_id: &ShardId) -> &mut Self {
        for shard in self.shards.iter_mut().filter(|shard| shard.shard_id == *shard_id) {
            shard.source_enabled = false;
        }
        self
    }

    /// Every request a copy of `shard_id` on `node` receives fails with `error`.
    pub fn fail(&mut self, shard_id: &ShardId, node: &str, error: ShardError) -> &mut Self {
        self.rules.push(Rule {
            shard: Some(shard_id.clone()),
            node: Some(NodeId::new(node)),
            phase: None,
            action: Action::Fail(error),
        });
        self
    }

    pub fn fail_phase(
        &mut self,
        shard_id: &ShardId,
        node: &str,
        phase: SearchPhaseName,
        error: ShardError,
    ) -> &mut Self {
        self.rules.push(Rule {
            shard: Some(shard_id.clone()),
            node: Some(NodeId::new(node)),
            phase: Some(phase),
            action: Action::Fail(error),
        });
        self
    }

    pub fn delay_node(&mut self, node: &str, delay: Duration) -> &mut Self {
        self.rules.push(Rule {
            shard: None,
            node: Some(NodeId::new(node)),
            phase: None,
            action: Action::Delay(delay),
        });
        self
    }

    pub fn delay_shard(&mut self, shard_id: &ShardId, delay: Duration) -> &mut Self {
        self.rules.push(Rule {
            shard: Some(shard_id.clone()),
            node: None,
            phase: None,
            action: Action::Delay(delay),
        });
        self
    }

    pub fn delay_phase(
        &mut self,
        node: &str,
        phase: SearchPhaseName,
        delay: Duration,
    ) -> &mut Self {
        self.rules.push(Rule {
            shard: None,
            node: Some(NodeId::new(node)),
            phase: Some(phase),
            action: Action::Delay(delay),
        });
        self
    }

    pub fn fail_locator(&mut self, error: LocatorError) -> &mut Self {
        self.locator_error = Some(error);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    /// Requests of one phase, in the order they were sent.
    pub fn phase_requests(&self, phase: SearchPhaseName) -> Vec<RecordedRequest> {
        lock(&self.requests)
            .iter()
            .filter(|recorded| recorded.request.phase() == Some(phase))
            .cloned()
            .collect()
    }

    pub fn query_requests(&self) -> Vec<ShardSearchRequest> {
        lock(&self.requests)
            .iter()
            .filter_map(|recorded| match &recorded.request {
                ShardRequest::Query(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn fetch_requests(&self) -> Vec<ShardFetchRequest> {
        lock(&self.requests)
            .iter()
            .filter_map(|recorded| match &recorded.request {
                ShardRequest::Fetch(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Contexts freed through an explicit release request.
    pub fn released(&self) -> Vec<ContextId> {
        lock(&self.released).clone()
    }

    pub fn open_contexts(&self) -> usize {
        lock(&self.open_contexts).len()
    }

    pub fn max_in_flight(&self) -> usize {
        lock(&self.in_flight).total.max
    }

    /// Highest number of simultaneous requests any single shard saw.
    pub fn max_in_flight_per_shard(&self) -> usize {
        lock(&self.in_flight)
            .per_shard
            .values()
            .map(|gauge| gauge.max)
            .max()
            .unwrap_or(0)
    }

    pub fn coordinator(self: &Arc<Self>, config: CoordinatorConfig) -> SearchCoordinator {
        let locator: Arc<dyn ShardLocator> = Arc::clone(self) as Arc<dyn ShardLocator>;
        let rpc: Arc<dyn RpcClient> = Arc::clone(self) as Arc<dyn RpcClient>;
        SearchCoordinator::new(config, locator, rpc)
    }

    fn shard(&self, shard_id: &ShardId) -> Result<&FakeShard, ShardError> {
        self.shards
            .iter()
            .find(|shard| shard.shard_id == *shard_id)
            .ok_or_else(|| ShardError::ShardNotAvailable {
                shard: shard_id.clone(),
                message: "unknown shard".to_string(),
            })
    }

    fn open_context(&self, node: &NodeId) -> ContextId {
        let id = self.next_context.fetch_add(1, AtomicOrdering::Relaxed);
        let context_id = ContextId::new(node.clone(), id);
        lock(&self.open_contexts).insert(context_id.clone());
        context_id
    }

    fn enter(&self, shard_id: &ShardId) -> InFlightGuard<'_> {
        let mut in_flight = lock(&self.in_flight);
        in_flight.total.current += 1;
        in_flight.total.max = in_flight.total.max.max(in_flight.total.current);
        let shard = in_flight.per_shard.entry(shard_id.clone()).or_default();
        shard.current += 1;
        shard.max = shard.max.max(shard.current);
        InFlightGuard {
            cluster: self,
            shard_id: shard_id.clone(),
        }
    }

    fn dfs(
        &self,
        shard: &FakeShard,
        target: &ShardTarget,
        request: &ShardSearchRequest,
    ) -> DfsResult {
        let mut term_stats = BTreeMap::new();
        for term in &request.query.terms {
            let doc_freq = shard
                .docs
                .iter()
                .filter(|doc| doc.terms.contains(term))
                .count() as u64;
            let total_term_freq = shard
                .docs
                .iter()
                .map(|doc| doc.terms.iter().filter(|t| *t == term).count() as u64)
                .sum();
            term_stats.insert(
                term.clone(),
                TermStatistics {
                    doc_freq,
                    total_term_freq,
                },
            );
        }
        DfsResult {
            context_id: self.open_context(&target.node_id),
            term_stats,
            max_doc: shard.docs.len() as u64,
        }
    }

    fn query(
        &self,
        shard: &FakeShard,
        target: &ShardTarget,
        request: &ShardSearchRequest,
    ) -> QueryResult {
        let sort = SortSpec::from_fields(&request.sort);
        let scoring = sort.is_relevance_first() || request.track_scores;
        let matching: Vec<&FakeDoc> = shard
            .docs
            .iter()
            .filter(|doc| doc.matches(&request.query.terms))
            .collect();

        let mut top_docs: Vec<ScoreDoc> = matching
            .iter()
            .map(|doc| ScoreDoc {
                doc: doc.id,
                score: if scoring { doc.score } else { f32::NAN },
                sort_values: match sort {
                    SortSpec::Relevance => Vec::new(),
                    SortSpec::Fields(_) => doc.sort_values.clone(),
                },
            })
            .collect();
        if let Some(bottom) = &request.bottom_sort_values {
            top_docs.retain(|doc| sort.compare_values(&doc.sort_values, bottom) != Ordering::Greater);
        }
        top_docs.sort_by(|a, b| sort.compare_docs(a, b).then(a.doc.cmp(&b.doc)));
        top_docs.truncate(request.size);

        let total = matching.len() as u64;
        let total_hits = match request.track_total_hits {
            TrackTotalHits::Disabled => None,
            TrackTotalHits::Accurate => Some(TotalHits::exact(total)),
            // Counting stops one hit past the threshold.
            TrackTotalHits::UpTo(limit) if total > limit => {
                Some(TotalHits::at_least(limit.saturating_add(1)))
            }
            TrackTotalHits::UpTo(_) => Some(TotalHits::exact(total)),
        };
        let max_score = if scoring {
            matching.iter().map(|doc| doc.score).reduce(f32::max)
        } else {
            None
        };
        // A DFS round already opened the context this query runs in.
        let context_id = request
            .context_id
            .clone()
            .unwrap_or_else(|| self.open_context(&target.node_id));
        QueryResult {
            context_id,
            top_docs,
            total_hits,
            max_score,
            timed_out: false,
        }
    }

    fn fetch(
        &self,
        shard: &FakeShard,
        request: &ShardFetchRequest,
    ) -> Result<FetchResult, ShardError> {
        {
            let mut open = lock(&self.open_contexts);
            if !open.contains(&request.context_id) {
                return Err(ShardError::SearchContextMissing {
                    context_id: request.context_id.clone(),
                });
            }
            if !request.keep_context {
                open.remove(&request.context_id);
            }
        }

        let docs: Vec<&FakeDoc> = request
            .doc_ids
            .iter()
            .filter_map(|id| shard.docs.iter().find(|doc| doc.id == *id))
            .collect();
        let segment_ords: BTreeSet<u32> = docs.iter().map(|doc| doc.segment).collect();
        let segments = segment_ords
            .into_iter()
            .map(|ord| {
                let mut named_matches = BTreeMap::new();
                for named in &request.named_queries {
                    let matched: Vec<u32> = docs
                        .iter()
                        .filter(|doc| doc.segment == ord && doc.named_queries.contains(&named.name))
                        .map(|doc| doc.id)
                        .collect();
                    if !matched.is_empty() {
                        named_matches.insert(named.name.clone(), matched);
                    }
                }
                SegmentInfo {
                    ord,
                    source_enabled: shard.source_enabled,
                    named_matches,
                }
            })
            .collect();
        let docs = docs
            .iter()
            .map(|doc| FetchedDoc {
                doc: doc.id,
                segment: doc.segment,
                source: match (&doc.source, shard.source_enabled) {
                    (Some(source), true) => serde_json::to_vec(source).ok().map(Bytes::from),
                    _ => None,
                },
                nested: None,
            })
            .collect();
        Ok(FetchResult {
            context_id: request.context_id.clone(),
            segments,
            docs,
        })
    }

    fn release(&self, context_id: &ContextId) -> Result<ShardResponse, ShardError> {
        if !lock(&self.open_contexts).remove(context_id) {
            return Err(ShardError::SearchContextMissing {
                context_id: context_id.clone(),
            });
        }
        lock(&self.released).push(context_id.clone());
        Ok(ShardResponse::Released)
    }
}

impl ShardLocator for InMemoryCluster {
    fn resolve(&self, request: &SearchRequest) -> Result<Vec<ShardGroup>, LocatorError> {
        if let Some(error) = &self.locator_error {
            return Err(error.clone());
        }
        let mut groups = Vec::new();
        for index in &request.indices {
            let mut shards: Vec<&FakeShard> = self
                .shards
                .iter()
                .filter(|shard| shard.shard_id.index == *index)
                .collect();
            shards.sort_by_key(|shard| shard.shard_id.shard);
            groups.extend(
                shards
                    .into_iter()
                    .map(|shard| ShardGroup::on_nodes(shard.shard_id.clone(), shard.nodes.clone())),
            );
        }
        // An empty cluster resolves to no groups; unknown indices on a
        // populated one are an error.
        if groups.is_empty() && !self.shards.is_empty() {
            return Err(LocatorError::NoShardsAvailable {
                indices: request.indices.clone(),
            });
        }
        Ok(groups)
    }
}

#[async_trait]
impl RpcClient for InMemoryCluster {
    async fn send(
        &self,
        target: &ShardTarget,
        request: ShardRequest,
    ) -> Result<ShardResponse, ShardError> {
        lock(&self.requests).push(RecordedRequest {
            target: target.clone(),
            request: request.clone(),
        });
        let _guard = self.enter(&target.shard_id);

        let phase = request.phase();
        let rules: Vec<Rule> = self
            .rules
            .iter()
            .filter(|rule| rule.applies(target, phase))
            .cloned()
            .collect();
        for rule in &rules {
            if let Action::Delay(delay) = rule.action {
                tokio::time::sleep(delay).await;
            }
        }
        if let Some(error) = rules.into_iter().find_map(|rule| match rule.action {
            Action::Fail(error) => Some(error),
            Action::Delay(_) => None,
        }) {
            return Err(error);
        }

        let shard = self.shard(&target.shard_id)?;
        match request {
            ShardRequest::Dfs(request) => Ok(ShardResponse::Dfs(self.dfs(shard, target, &request))),
            ShardRequest::Query(request) => {
                if let Some(context_id) = &request.context_id
                    && !lock(&self.open_contexts).contains(context_id)
                {
                    return Err(ShardError::SearchContextMissing {
                        context_id: context_id.clone(),
                    });
                }
                Ok(ShardResponse::Query(self.query(shard, target, &request)))
            }
            ShardRequest::Fetch(request) => self.fetch(shard, &request).map(ShardResponse::Fetch),
            ShardRequest::ReleaseContext { context_id } => self.release(&context_id),
        }
    }
}

struct InFlightGuard<'a> {
    cluster: &'a InMemoryCluster,
    shard_id: ShardId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.cluster.in_flight);
        in_flight.total.current = in_flight.total.current.saturating_sub(1);
        if let Some(shard) = in_flight.per_shard.get_mut(&self.shard_id) {
            shard.current = shard.current.saturating_sub(1);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Shorthand for a `(index, shard)` id.
pub fn shard(index: &str, shard: u32) -> ShardId {
    ShardId::new(index, shard)
}

pub fn disconnected(node: &str) -> ShardError {
    ShardError::NodeDisconnected {
        node: NodeId::new(node),
    }
}

/// `(shard, doc)` of every hit, in response order.
pub fn hit_keys(response: &SearchResponse) -> Vec<(ShardId, u32)> {
    response
        .hits
        .iter()
        .map(|hit| (hit.shard.shard_id.clone(), hit.doc))
        .collect()
}

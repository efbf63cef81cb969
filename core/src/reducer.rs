use gather_protocol::AggregatedDfs;
use gather_protocol::DfsResult;
use gather_protocol::QueryResult;
use gather_protocol::ScoreDoc;
use gather_protocol::SearchRequest;
use gather_protocol::ShardOrdinal;
use gather_protocol::SortSpec;
use gather_protocol::TotalHits;
use gather_protocol::TotalHitsRelation;
use gather_protocol::TrackTotalHits;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One entry of the merged hit list.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedDoc {
    pub ordinal: ShardOrdinal,
    pub doc: ScoreDoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReducedQueryPhase {
    /// Globally ordered, already cut to `[from, from + size)`.
    pub hits: Vec<RankedDoc>,
    pub total_hits: Option<TotalHits>,
    pub max_score: Option<f32>,
    pub timed_out: bool,
}

impl ReducedQueryPhase {
    pub fn empty() -> Self {
        Self {
            hits: Vec::new(),
            total_hits: None,
            max_score: None,
            timed_out: false,
        }
    }
}

/// Merges per-shard results. Holds only what it reads from the request.
#[derive(Debug, Clone)]
pub struct ResultReducer {
    from: usize,
    size: usize,
    sort: SortSpec,
    track_total_hits: TrackTotalHits,
}

impl ResultReducer {
    pub fn new(request: &SearchRequest) -> Self {
        Self {
            from: request.from,
            size: request.size,
            sort: request.sort_spec(),
            track_total_hits: request.track_total_hits.unwrap_or_default(),
        }
    }

    /// Overrides the request's total-hit tracking with an already resolved
    /// mode.
    pub fn with_track_total_hits(mut self, track_total_hits: TrackTotalHits) -> Self {
        self.track_total_hits = track_total_hits;
        self
    }

    pub fn sort(&self) -> &SortSpec {
        &self.sort
    }

    /// Sums every shard's term statistics into corpus-wide ones.
    pub fn aggregate_dfs<'a, I>(&self, results: I) -> AggregatedDfs
    where
        I: IntoIterator<Item = &'a DfsResult>,
    {
        let mut aggregated = AggregatedDfs::default();
        for result in results {
            aggregated.max_doc = aggregated.max_doc.saturating_add(result.max_doc);
            for (term, stats) in &result.term_stats {
                let entry = aggregated.term_stats.entry(term.clone()).or_default();
                entry.doc_freq = entry.doc_freq.saturating_add(stats.doc_freq);
                entry.total_term_freq = entry.total_term_freq.saturating_add(stats.total_term_freq);
            }
        }
        aggregated
    }

    /// K-way merge of the shards' ranked lists. `counting_relaxed` is set
    /// when some shards were told to stop counting hits.
    pub fn reduce_query<'a, I>(&self, results: I, counting_relaxed: bool) -> ReducedQueryPhase
    where
        I: IntoIterator<Item = (ShardOrdinal, &'a QueryResult)>,
    {
        let window = self.from.saturating_add(self.size);
        let mut total = 0u64;
        let mut any_lower_bound = counting_relaxed;
        let mut max_score: Option<f32> = None;
        let mut timed_out = false;
        let mut lists: Vec<(ShardOrdinal, Vec<&'a ScoreDoc>)> = Vec::new();

        for (ordinal, result) in results {
            match result.total_hits {
                Some(hits) => {
                    total = total.saturating_add(hits.value);
                    any_lower_bound |= hits.relation == TotalHitsRelation::Gte;
                }
                None => any_lower_bound = true,
            }
            if let Some(score) = result.max_score.filter(|score| !score.is_nan()) {
                max_score = Some(max_score.map_or(score, |current| current.max(score)));
            }
            timed_out |= result.timed_out;

            let mut docs: Vec<&ScoreDoc> = result.top_docs.iter().collect();
            docs.sort_by(|a, b| self.sort.compare_docs(a, b).then(a.doc.cmp(&b.doc)));
            docs.truncate(window);
            lists.push((ordinal, docs));
        }

        let mut heap = BinaryHeap::with_capacity(lists.len());
        for (ordinal, docs) in &lists {
            if !docs.is_empty() {
                heap.push(Cursor {
                    sort: &self.sort,
                    ordinal: *ordinal,
                    docs,
                    position: 0,
                });
            }
        }

        let mut hits = Vec::with_capacity(self.size.min(window));
        let mut rank = 0usize;
        while rank < window {
            let Some(mut cursor) = heap.pop() else {
                break;
            };
            if rank >= self.from {
                hits.push(RankedDoc {
                    ordinal: cursor.ordinal,
                    doc: cursor.current().clone(),
                });
            }
            rank += 1;
            cursor.position += 1;
            if cursor.position < cursor.docs.len() {
                heap.push(cursor);
            }
        }

        ReducedQueryPhase {
            hits,
            total_hits: self.total_hits(total, any_lower_bound),
            max_score,
            timed_out,
        }
    }

    fn total_hits(&self, total: u64, lower_bound: bool) -> Option<TotalHits> {
        match self.track_total_hits {
            TrackTotalHits::Disabled => None,
            TrackTotalHits::UpTo(limit) if total > limit || (lower_bound && total >= limit) => {
                Some(TotalHits::at_least(limit))
            }
            TrackTotalHits::UpTo(_) | TrackTotalHits::Accurate => Some(if lower_bound {
                TotalHits::at_least(total)
            } else {
                TotalHits::exact(total)
            }),
        }
    }

    /// Doc ids to fetch from each ordinal, ascending.
    pub fn doc_ids_to_load(&self, hits: &[RankedDoc], shard_count: usize) -> Vec<Vec<u32>> {
        let mut per_shard = vec![Vec::new(); shard_count];
        for hit in hits {
            if let Some(docs) = per_shard.get_mut(hit.ordinal.get()) {
                docs.push(hit.doc.doc);
            }
        }
        for docs in &mut per_shard {
            docs.sort_unstable();
            docs.dedup();
        }
        per_shard
    }
}

/// Full merge order: primary sort, then shard ordinal, then doc id.
pub fn compare_ranked(
    sort: &SortSpec,
    left: (ShardOrdinal, &ScoreDoc),
    right: (ShardOrdinal, &ScoreDoc),
) -> Ordering {
    sort.compare_docs(left.1, right.1)
        .then(left.0.cmp(&right.0))
        .then(left.1.doc.cmp(&right.1.doc))
}

struct Cursor<'a> {
    sort: &'a SortSpec,
    ordinal: ShardOrdinal,
    docs: &'a [&'a ScoreDoc],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn current(&self) -> &'a ScoreDoc {
        self.docs[self.position]
    }
}

impl PartialEq for Cursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cursor<'_> {}

impl PartialOrd for Cursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor<'_> {
    // BinaryHeap is a max-heap; the best document must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        compare_ranked(
            self.sort,
            (self.ordinal, self.current()),
            (other.ordinal, other.current()),
        )
        .reverse()
    }
}

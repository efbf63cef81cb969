use gather_protocol::ScoreDoc;
use gather_protocol::SortSpec;
use gather_protocol::SortValue;
use gather_protocol::TotalHits;
use std::cmp::Ordering;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering as AtomicOrdering;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Numeric,
    Text,
}

fn kind_of(value: &SortValue) -> Option<ValueKind> {
    match value {
        SortValue::Null => None,
        SortValue::Long(_) | SortValue::Double(_) => Some(ValueKind::Numeric),
        SortValue::Text(_) => Some(ValueKind::Text),
    }
}

#[derive(Debug, Default)]
struct BottomState {
    bottom: Option<Vec<SortValue>>,
    disabled: bool,
}

/// Tracks the worst sort key that is still guaranteed to make the global
/// `from + size` window, across every shard result consumed so far.
///
/// The bound only ever tightens: a shard's bottom candidate replaces it only
/// when it sorts strictly before the current bound.
#[derive(Debug)]
pub struct BottomSortValuesCollector {
    top_n: usize,
    sort: SortSpec,
    total_hits: AtomicU64,
    /// Value kinds of the sort key, taken from the first shard that reports
    /// documents.
    shape: OnceLock<Vec<Option<ValueKind>>>,
    state: Mutex<BottomState>,
}

impl BottomSortValuesCollector {
    pub fn new(top_n: usize, sort: SortSpec) -> Self {
        Self {
            top_n,
            sort,
            total_hits: AtomicU64::new(0),
            shape: OnceLock::new(),
            state: Mutex::new(BottomState::default()),
        }
    }

    pub fn consume(&self, top_docs: &[ScoreDoc], total_hits: Option<TotalHits>) {
        if let Some(total) = total_hits {
            self.total_hits
                .fetch_add(total.value, AtomicOrdering::AcqRel);
        }
        let Some(first) = top_docs.first() else {
            return;
        };
        let shape = self
            .shape
            .get_or_init(|| first.sort_values.iter().map(kind_of).collect());
        if !top_docs.iter().all(|doc| matches_shape(shape, &doc.sort_values)) {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.disabled {
                debug!("shard sort values do not share a shape; disabling bottom sort pruning");
            }
            state.disabled = true;
            state.bottom = None;
            return;
        }

        // A shard that returned fewer than `top_n` docs has no bottom
        // candidate: everything it matched may still make the window.
        if self.top_n == 0 || top_docs.len() < self.top_n {
            return;
        }
        let Some(candidate) = top_docs.last() else {
            return;
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.disabled {
            return;
        }
        let tighter = match &state.bottom {
            None => true,
            Some(current) => {
                self.sort.compare_values(&candidate.sort_values, current) == Ordering::Less
            }
        };
        if tighter {
            state.bottom = Some(candidate.sort_values.clone());
        }
    }

    pub fn bottom_sort_values(&self) -> Option<Vec<SortValue>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.disabled {
            None
        } else {
            state.bottom.clone()
        }
    }

    /// Sum of the totals reported by every consumed shard.
    pub fn total_hits(&self) -> u64 {
        self.total_hits.load(AtomicOrdering::Acquire)
    }

    pub fn is_disabled(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disabled
    }
}

fn matches_shape(shape: &[Option<ValueKind>], values: &[SortValue]) -> bool {
    shape.len() == values.len()
        && shape
            .iter()
            .zip(values)
            .all(|(expected, value)| match (expected, kind_of(value)) {
                (Some(expected), Some(actual)) => *expected == actual,
                _ => true,
            })
}

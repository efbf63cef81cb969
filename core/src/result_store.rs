use gather_protocol::DfsResult;
use gather_protocol::FetchResult;
use gather_protocol::PhaseResult;
use gather_protocol::QueryResult;
use gather_protocol::SearchPhaseName;
use gather_protocol::ShardFailureRecord;
use gather_protocol::ShardOrdinal;
use gather_protocol::ShardTarget;
use std::sync::OnceLock;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// The terminal result of one ordinal plus the copy that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotEntry {
    pub target: Option<ShardTarget>,
    pub result: PhaseResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWrite {
    Pending { remaining: usize },
    /// This write filled the last expected slot.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("ordinal {ordinal} is out of range for {len} slots")]
    OutOfRange { ordinal: ShardOrdinal, len: usize },
    #[error("ordinal {ordinal} already holds a terminal result")]
    AlreadyFilled { ordinal: ShardOrdinal },
    #[error("ordinal {ordinal} does not take part in this phase")]
    NotParticipating { ordinal: ShardOrdinal },
}

/// Per-phase, ordinal-indexed slots. Each slot is written at most once and
/// the phase is complete when every participating slot holds a result.
#[derive(Debug)]
pub struct PhaseResultStore {
    phase: SearchPhaseName,
    slots: Box<[OnceLock<SlotEntry>]>,
    participating: Box<[bool]>,
    expected: usize,
    remaining: AtomicUsize,
}

impl PhaseResultStore {
    pub fn new(phase: SearchPhaseName, len: usize) -> Self {
        Self::for_ordinals(phase, len, (0..len).map(ShardOrdinal::new))
    }

    /// A store where only `participants` are expected to report. Later
    /// phases skip ordinals that failed earlier or have nothing to do.
    pub fn for_ordinals<I>(phase: SearchPhaseName, len: usize, participants: I) -> Self
    where
        I: IntoIterator<Item = ShardOrdinal>,
    {
        let mut participating = vec![false; len].into_boxed_slice();
        for ordinal in participants {
            if let Some(flag) = participating.get_mut(ordinal.get()) {
                *flag = true;
            }
        }
        let expected = participating.iter().filter(|flag| **flag).count();
        let slots = (0..len).map(|_| OnceLock::new()).collect();
        Self {
            phase,
            slots,
            participating,
            expected,
            remaining: AtomicUsize::new(expected),
        }
    }

    pub fn phase(&self) -> SearchPhaseName {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub fn is_participating(&self, ordinal: ShardOrdinal) -> bool {
        self.participating
            .get(ordinal.get())
            .copied()
            .unwrap_or(false)
    }

    pub fn set(
        &self,
        ordinal: ShardOrdinal,
        target: Option<ShardTarget>,
        result: PhaseResult,
    ) -> Result<SlotWrite, SlotError> {
        let slot = self.slots.get(ordinal.get()).ok_or(SlotError::OutOfRange {
            ordinal,
            len: self.slots.len(),
        })?;
        if !self.is_participating(ordinal) {
            return Err(SlotError::NotParticipating { ordinal });
        }
        slot.set(SlotEntry { target, result })
            .map_err(|_| SlotError::AlreadyFilled { ordinal })?;
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            Ok(SlotWrite::Complete)
        } else {
            Ok(SlotWrite::Pending {
                remaining: previous - 1,
            })
        }
    }

    pub fn is_filled(&self, ordinal: ShardOrdinal) -> bool {
        self.entry(ordinal).is_some()
    }

    pub fn entry(&self, ordinal: ShardOrdinal) -> Option<&SlotEntry> {
        self.slots.get(ordinal.get()).and_then(OnceLock::get)
    }

    pub fn result(&self, ordinal: ShardOrdinal) -> Option<&PhaseResult> {
        self.entry(ordinal).map(|entry| &entry.result)
    }

    pub fn target(&self, ordinal: ShardOrdinal) -> Option<&ShardTarget> {
        self.entry(ordinal).and_then(|entry| entry.target.as_ref())
    }

    /// Filled slots in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = (ShardOrdinal, &SlotEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.get().map(|entry| (ShardOrdinal::new(index), entry)))
    }

    pub fn successes(&self) -> usize {
        self.iter()
            .filter(|(_, entry)| !entry.result.is_failure())
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ShardFailureRecord> {
        self.iter().filter_map(|(_, entry)| match &entry.result {
            PhaseResult::Failure(record) => Some(record),
            _ => None,
        })
    }

    pub fn dfs_results(&self) -> impl Iterator<Item = (ShardOrdinal, &DfsResult)> {
        self.iter().filter_map(|(ordinal, entry)| match &entry.result {
            PhaseResult::Dfs(result) => Some((ordinal, result)),
            _ => None,
        })
    }

    pub fn query_results(&self) -> impl Iterator<Item = (ShardOrdinal, &QueryResult)> {
        self.iter().filter_map(|(ordinal, entry)| match &entry.result {
            PhaseResult::Query(result) => Some((ordinal, result)),
            _ => None,
        })
    }

    pub fn fetch_results(&self) -> impl Iterator<Item = (ShardOrdinal, &FetchResult)> {
        self.iter().filter_map(|(ordinal, entry)| match &entry.result {
            PhaseResult::Fetch(result) => Some((ordinal, result)),
            _ => None,
        })
    }
}

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use gather_protocol::FailureClass;
use gather_protocol::PhaseResult;
use gather_protocol::SearchPhaseName;
use gather_protocol::ShardError;
use gather_protocol::ShardFailureRecord;
use gather_protocol::ShardId;
use gather_protocol::ShardOrdinal;
use gather_protocol::ShardRequest;
use gather_protocol::ShardResponse;
use gather_protocol::ShardTarget;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::state::ExecutorState;
use super::state::StateMachine;
use crate::error::SearchError;
use crate::failures::ShardFailureSet;
use crate::listener::PhaseContext;
use crate::listener::PhaseListenerBus;
use crate::listener::PhaseSummary;
use crate::result_store::PhaseResultStore;
use crate::result_store::SlotWrite;
use crate::retry::RetryPolicy;
use crate::transport::RpcClient;

/// One ordinal to run in a phase, with the copies it may be sent to.
#[derive(Debug, Clone)]
pub(crate) struct ShardTask {
    ordinal: ShardOrdinal,
    shard_id: ShardId,
    candidates: Vec<ShardTarget>,
    attempt: usize,
}

impl ShardTask {
    pub(crate) fn new(ordinal: ShardOrdinal, shard_id: ShardId, candidates: Vec<ShardTarget>) -> Self {
        Self {
            ordinal,
            shard_id,
            candidates,
            attempt: 0,
        }
    }

    pub(crate) fn ordinal(&self) -> ShardOrdinal {
        self.ordinal
    }

    /// A task that may only go to the copy that served the previous phase.
    pub(crate) fn pinned(ordinal: ShardOrdinal, target: ShardTarget) -> Self {
        Self::new(ordinal, target.shard_id.clone(), vec![target])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PhaseOutcome {
    pub deadline_expired: bool,
    pub took: Duration,
}

/// What became of one finished RPC.
enum Settled {
    Retry(ShardTask),
    Written(SlotWrite),
}

struct Completion {
    task: ShardTask,
    target: ShardTarget,
    result: Result<ShardResponse, ShardError>,
}

/// Runs one phase over a set of ordinals with bounded concurrency.
pub(crate) struct FanOut<'a> {
    pub rpc: &'a dyn RpcClient,
    pub retry: &'a dyn RetryPolicy,
    pub listeners: &'a PhaseListenerBus,
    pub failures: &'a ShardFailureSet,
    pub max_concurrent: usize,
    pub deadline: Option<Instant>,
}

impl FanOut<'_> {
    /// Dispatches every task and returns once each participating slot of
    /// `store` holds a terminal result. Requests are built at dispatch time
    /// so they can pick up state that changed while earlier shards ran.
    pub(crate) async fn run<B, S>(
        &self,
        machine: &mut StateMachine,
        store: &PhaseResultStore,
        tasks: Vec<ShardTask>,
        build: B,
        on_success: S,
    ) -> Result<PhaseOutcome, SearchError>
    where
        B: Fn(ShardOrdinal) -> Result<ShardRequest, ShardError> + Sync,
        S: Fn(ShardOrdinal, &PhaseResult) + Sync,
    {
        let phase = store.phase();
        let started = Instant::now();
        machine.transition(ExecutorState::Dispatching(phase))?;
        self.listeners.phase_start(&PhaseContext {
            phase,
            shard_count: store.expected(),
        });

        // Last copy contacted per ordinal, for deadline bookkeeping.
        let mut last_target: BTreeMap<ShardOrdinal, (ShardId, Option<ShardTarget>)> =
            BTreeMap::new();
        let mut queue = VecDeque::with_capacity(tasks.len());
        for task in tasks {
            let next_copy = task.candidates.get(task.attempt).cloned();
            last_target.insert(task.ordinal, (task.shard_id.clone(), next_copy));
            queue.push_back(task);
        }

        let max_concurrent = self.max_concurrent.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut collecting = false;
        let mut deadline_expired = false;
        let mut phase_complete = store.is_complete();
        let deadline = wait_for_deadline(self.deadline);
        tokio::pin!(deadline);

        loop {
            if phase_complete {
                break;
            }
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                deadline_expired = true;
                break;
            }
            while in_flight.len() < max_concurrent {
                let Some(task) = queue.pop_front() else {
                    break;
                };
                let Some(target) = task.candidates.get(task.attempt).cloned() else {
                    let cause = ShardError::ShardNotAvailable {
                        shard: task.shard_id.clone(),
                        message: "no shard copy to send the request to".to_string(),
                    };
                    let record = ShardFailureRecord::new(
                        task.shard_id,
                        None,
                        phase,
                        FailureClass::NonRetryable,
                        cause,
                    );
                    let write = self.record_failure(store, phase, task.ordinal, record)?;
                    phase_complete |= write == SlotWrite::Complete;
                    continue;
                };
                match build(task.ordinal) {
                    Ok(request) => {
                        last_target
                            .insert(task.ordinal, (task.shard_id.clone(), Some(target.clone())));
                        in_flight.push(self.send(task, target, request));
                    }
                    Err(cause) => {
                        let record = ShardFailureRecord::new(
                            task.shard_id,
                            Some(target),
                            phase,
                            FailureClass::NonRetryable,
                            cause,
                        );
                        let write = self.record_failure(store, phase, task.ordinal, record)?;
                        phase_complete |= write == SlotWrite::Complete;
                    }
                }
            }
            if !collecting && queue.is_empty() {
                machine.transition(ExecutorState::Collecting(phase))?;
                collecting = true;
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = &mut deadline => {
                    deadline_expired = true;
                    break;
                }
                Some(completion) = in_flight.next() => {
                    match self.complete(store, phase, completion, &on_success)? {
                        Settled::Retry(task) => queue.push_front(task),
                        Settled::Written(write) => {
                            phase_complete |= write == SlotWrite::Complete;
                        }
                    }
                }
            }
        }

        // Dropping the pending futures cancels their RPCs.
        drop(in_flight);
        if deadline_expired {
            for (ordinal, (shard_id, target)) in last_target {
                if store.is_participating(ordinal) && !store.is_filled(ordinal) {
                    debug!(%phase, ordinal = ordinal.get(), shard = %shard_id, "shard timed out");
                    let record = ShardFailureRecord::timed_out(shard_id, target, phase);
                    self.record_failure(store, phase, ordinal, record)?;
                }
            }
        }
        if !collecting {
            machine.transition(ExecutorState::Collecting(phase))?;
        }
        if !store.is_complete() {
            return Err(SearchError::internal(format!(
                "{phase} phase finished with {} unfilled slot(s)",
                store.remaining()
            )));
        }

        let took = started.elapsed();
        self.listeners.phase_end(&PhaseSummary {
            phase,
            successful: store.successes(),
            failed: store.failures().count(),
            took,
        });
        Ok(PhaseOutcome {
            deadline_expired,
            took,
        })
    }

    fn send(
        &self,
        task: ShardTask,
        target: ShardTarget,
        request: ShardRequest,
    ) -> impl Future<Output = Completion> + Send + '_ {
        let rpc = self.rpc;
        async move {
            let result = rpc.send(&target, request).await;
            Completion {
                task,
                target,
                result,
            }
        }
    }

    /// Hands the task back when it should be retried on its next copy.
    fn complete<S>(
        &self,
        store: &PhaseResultStore,
        phase: SearchPhaseName,
        completion: Completion,
        on_success: &S,
    ) -> Result<Settled, SearchError>
    where
        S: Fn(ShardOrdinal, &PhaseResult),
    {
        let Completion {
            mut task,
            target,
            result,
        } = completion;
        let error = match result.map(|response| PhaseResult::from_response(phase, response)) {
            Ok(Ok(result)) => {
                on_success(task.ordinal, &result);
                let write = store
                    .set(task.ordinal, Some(target.clone()), result)
                    .map_err(|err| SearchError::internal(err.to_string()))?;
                self.listeners.shard_result(phase, task.ordinal, &target);
                return Ok(Settled::Written(write));
            }
            Ok(Err(_unexpected)) => {
                ShardError::internal(format!("shard answered a {phase} request with another phase"))
            }
            Err(error) => error,
        };

        let classification = self.retry.classify(&error);
        if classification == FailureClass::Retryable && task.attempt + 1 < task.candidates.len() {
            debug!(
                %phase,
                ordinal = task.ordinal.get(),
                shard = %task.shard_id,
                node = %target.node_id,
                error = %error,
                "shard copy failed; retrying on next copy"
            );
            task.attempt += 1;
            return Ok(Settled::Retry(task));
        }

        let record = ShardFailureRecord::new(
            task.shard_id,
            Some(target),
            phase,
            classification,
            error,
        );
        let write = self.record_failure(store, phase, task.ordinal, record)?;
        Ok(Settled::Written(write))
    }

    fn record_failure(
        &self,
        store: &PhaseResultStore,
        phase: SearchPhaseName,
        ordinal: ShardOrdinal,
        record: ShardFailureRecord,
    ) -> Result<SlotWrite, SearchError> {
        debug!(
            %phase,
            ordinal = ordinal.get(),
            shard = %record.shard_id,
            reason = %record.reason,
            "shard failed"
        );
        self.failures.insert(record.clone());
        let target = record.target.clone();
        let write = store
            .set(ordinal, target, PhaseResult::Failure(record.clone()))
            .map_err(|err| SearchError::internal(err.to_string()))?;
        self.listeners.shard_failure(ordinal, &record);
        Ok(write)
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

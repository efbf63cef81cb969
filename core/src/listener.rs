use gather_protocol::SearchPhaseName;
use gather_protocol::ShardFailureRecord;
use gather_protocol::ShardOrdinal;
use gather_protocol::ShardTarget;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::SearchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseContext {
    pub phase: SearchPhaseName,
    /// Ordinals taking part in this phase.
    pub shard_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSummary {
    pub phase: SearchPhaseName,
    pub successful: usize,
    pub failed: usize,
    pub took: Duration,
}

/// Observer of a search's progress. Errors and panics are logged by the bus
/// and never reach the engine.
pub trait PhaseListener: Send + Sync {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn on_phase_start(&self, _context: &PhaseContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_shard_result(
        &self,
        _phase: SearchPhaseName,
        _ordinal: ShardOrdinal,
        _target: &ShardTarget,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_shard_failure(
        &self,
        _ordinal: ShardOrdinal,
        _failure: &ShardFailureRecord,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_phase_end(&self, _summary: &PhaseSummary) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_phase_failure(
        &self,
        _phase: SearchPhaseName,
        _error: &SearchError,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Broadcasts to every registered listener, in registration order.
#[derive(Clone, Default)]
pub struct PhaseListenerBus {
    listeners: Vec<Arc<dyn PhaseListener>>,
}

impl std::fmt::Debug for PhaseListenerBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.listeners.iter().map(|listener| listener.name()).collect();
        f.debug_struct("PhaseListenerBus")
            .field("listeners", &names)
            .finish()
    }
}

impl PhaseListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn PhaseListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn phase_start(&self, context: &PhaseContext) {
        self.deliver("phase_start", |listener| listener.on_phase_start(context));
    }

    pub fn shard_result(&self, phase: SearchPhaseName, ordinal: ShardOrdinal, target: &ShardTarget) {
        self.deliver("shard_result", |listener| {
            listener.on_shard_result(phase, ordinal, target)
        });
    }

    pub fn shard_failure(&self, ordinal: ShardOrdinal, failure: &ShardFailureRecord) {
        self.deliver("shard_failure", |listener| {
            listener.on_shard_failure(ordinal, failure)
        });
    }

    pub fn phase_end(&self, summary: &PhaseSummary) {
        self.deliver("phase_end", |listener| listener.on_phase_end(summary));
    }

    pub fn phase_failure(&self, phase: SearchPhaseName, error: &SearchError) {
        self.deliver("phase_failure", |listener| {
            listener.on_phase_failure(phase, error)
        });
    }

    fn deliver<F>(&self, event: &'static str, notify: F)
    where
        F: Fn(&dyn PhaseListener) -> anyhow::Result<()>,
    {
        for listener in &self.listeners {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| notify(listener.as_ref())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(listener = listener.name(), event, error = %err, "phase listener failed");
                }
                Err(_) => {
                    warn!(listener = listener.name(), event, "phase listener panicked");
                }
            }
        }
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPhaseListener;

impl PhaseListener for TracingPhaseListener {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn on_phase_start(&self, context: &PhaseContext) -> anyhow::Result<()> {
        info!(phase = %context.phase, shards = context.shard_count, "search phase started");
        Ok(())
    }

    fn on_shard_result(
        &self,
        phase: SearchPhaseName,
        ordinal: ShardOrdinal,
        target: &ShardTarget,
    ) -> anyhow::Result<()> {
        debug!(%phase, ordinal = ordinal.get(), %target, "shard result");
        Ok(())
    }

    fn on_shard_failure(
        &self,
        ordinal: ShardOrdinal,
        failure: &ShardFailureRecord,
    ) -> anyhow::Result<()> {
        warn!(
            phase = %failure.phase,
            ordinal = ordinal.get(),
            shard = %failure.shard_id,
            reason = %failure.reason,
            "shard failed"
        );
        Ok(())
    }

    fn on_phase_end(&self, summary: &PhaseSummary) -> anyhow::Result<()> {
        info!(
            phase = %summary.phase,
            successful = summary.successful,
            failed = summary.failed,
            took_ms = summary.took.as_millis() as u64,
            "search phase finished"
        );
        Ok(())
    }

    fn on_phase_failure(&self, phase: SearchPhaseName, error: &SearchError) -> anyhow::Result<()> {
        warn!(%phase, error = %error, "search phase failed");
        Ok(())
    }
}

use gather_protocol::FailureClass;
use gather_protocol::ShardError;

/// Decides whether a shard error is worth retrying on the next copy.
pub trait RetryPolicy: Send + Sync {
    fn classify(&self, error: &ShardError) -> FailureClass;
}

impl<F> RetryPolicy for F
where
    F: Fn(&ShardError) -> FailureClass + Send + Sync,
{
    fn classify(&self, error: &ShardError) -> FailureClass {
        self(error)
    }
}

/// Transport and availability problems are retryable; anything that would
/// fail the same way on another copy is not.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn classify(&self, error: &ShardError) -> FailureClass {
        match error {
            ShardError::ConnectTransport { .. }
            | ShardError::NodeDisconnected { .. }
            | ShardError::ShardNotAvailable { .. }
            | ShardError::Rejected { .. } => FailureClass::Retryable,
            ShardError::MalformedRequest { .. }
            | ShardError::Unsupported { .. }
            | ShardError::SearchContextMissing { .. }
            | ShardError::Internal { .. } => FailureClass::NonRetryable,
            ShardError::TimedOut => FailureClass::TimedOut,
        }
    }
}

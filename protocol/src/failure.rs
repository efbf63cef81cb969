use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::ids::ContextId;
use crate::ids::NodeId;
use crate::ids::ShardId;
use crate::ids::ShardTarget;
use crate::phase::SearchPhaseName;

/// Error returned by a single shard copy, or by the transport while talking
/// to it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardError {
    #[error("failed to connect to node {node}: {message}")]
    ConnectTransport { node: NodeId, message: String },

    #[error("node {node} disconnected")]
    NodeDisconnected { node: NodeId },

    #[error("shard {shard} is not available: {message}")]
    ShardNotAvailable { shard: ShardId, message: String },

    #[error("rejected by node {node}: {message}")]
    Rejected { node: NodeId, message: String },

    #[error("malformed shard request: {message}")]
    MalformedRequest { message: String },

    #[error("unsupported request: {message}")]
    Unsupported { message: String },

    #[error("no search context found for id {context_id}")]
    SearchContextMissing { context_id: ContextId },

    #[error("shard request timed out")]
    TimedOut,

    #[error("{message}")]
    Internal { message: String },
}

impl ShardError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Worth retrying on another copy of the same shard.
    Retryable,
    NonRetryable,
    /// The request deadline expired before the shard answered.
    TimedOut,
}

/// Immutable record of one shard's terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFailureRecord {
    pub shard_id: ShardId,
    /// The copy that produced the failure; `None` when no copy was ever
    /// contacted.
    #[serde(default)]
    pub target: Option<ShardTarget>,
    pub phase: SearchPhaseName,
    pub reason: String,
    pub classification: FailureClass,
    pub cause: ShardError,
}

impl ShardFailureRecord {
    pub fn new(
        shard_id: ShardId,
        target: Option<ShardTarget>,
        phase: SearchPhaseName,
        classification: FailureClass,
        cause: ShardError,
    ) -> Self {
        Self {
            shard_id,
            target,
            phase,
            reason: cause.to_string(),
            classification,
            cause,
        }
    }

    pub fn timed_out(
        shard_id: ShardId,
        target: Option<ShardTarget>,
        phase: SearchPhaseName,
    ) -> Self {
        Self::new(
            shard_id,
            target,
            phase,
            FailureClass::TimedOut,
            ShardError::TimedOut,
        )
    }
}

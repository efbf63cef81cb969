use async_trait::async_trait;
use gather_protocol::SearchRequest;
use gather_protocol::ShardError;
use gather_protocol::ShardGroup;
use gather_protocol::ShardRequest;
use gather_protocol::ShardResponse;
use gather_protocol::ShardTarget;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error("no index matches {indices:?}")]
    NoShardsAvailable { indices: Vec<String> },

    #[error("{0}")]
    Other(String),
}

/// Maps a request onto the logical shards it touches, each with its copies
/// in the order they should be tried.
pub trait ShardLocator: Send + Sync {
    fn resolve(&self, request: &SearchRequest) -> Result<Vec<ShardGroup>, LocatorError>;
}

/// Sends one phase request to one shard copy. Dropping the returned future
/// cancels the call.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn send(
        &self,
        target: &ShardTarget,
        request: ShardRequest,
    ) -> Result<ShardResponse, ShardError>;
}

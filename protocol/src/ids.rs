use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// A logical shard: one partition of an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One physical copy of a shard (primary or replica) living on a node,
/// optionally in a remote cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardTarget {
    pub shard_id: ShardId,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_alias: Option<String>,
}

impl ShardTarget {
    pub fn new(shard_id: ShardId, node_id: impl Into<NodeId>) -> Self {
        Self {
            shard_id,
            node_id: node_id.into(),
            cluster_alias: None,
        }
    }

    pub fn with_cluster_alias(mut self, alias: impl Into<String>) -> Self {
        self.cluster_alias = Some(alias.into());
        self
    }
}

impl fmt::Display for ShardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cluster_alias {
            Some(alias) => write!(f, "{alias}:{}{}", self.node_id, self.shard_id),
            None => write!(f, "{}{}", self.node_id, self.shard_id),
        }
    }
}

/// Stable position of a shard group within one search request. Every
/// per-phase result is stored under this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardOrdinal(usize);

impl ShardOrdinal {
    pub const fn new(ordinal: usize) -> Self {
        Self(ordinal)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for ShardOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a shard-local search context kept alive between phases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId {
    pub node_id: NodeId,
    pub id: u64,
}

impl ContextId {
    pub fn new(node_id: impl Into<NodeId>, id: u64) -> Self {
        Self {
            node_id: node_id.into(),
            id,
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.id)
    }
}

/// A logical shard plus the ordered list of physical copies to try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroup {
    pub shard_id: ShardId,
    pub candidates: Vec<ShardTarget>,
}

impl ShardGroup {
    pub fn new(shard_id: ShardId, candidates: Vec<ShardTarget>) -> Self {
        Self {
            shard_id,
            candidates,
        }
    }

    /// Convenience constructor for groups whose copies all live in the local
    /// cluster.
    pub fn on_nodes<I, N>(shard_id: ShardId, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let candidates = nodes
            .into_iter()
            .map(|node| ShardTarget::new(shard_id.clone(), node))
            .collect();
        Self::new(shard_id, candidates)
    }
}

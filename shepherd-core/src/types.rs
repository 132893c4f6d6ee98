use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Process-unique node identifier. Ordering is lexical, which the
/// dispatcher relies on for deterministic tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Fresh id for this process; ULIDs sort by creation time.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

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
        Self(value.to_string())
    }
}

/// Membership record payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub address: Option<String>,
}

impl NodeInfo {
    pub fn new(node_id: NodeId, address: Option<String>) -> Self {
        Self {
            node_id,
            joined_at: Utc::now(),
            address,
        }
    }
}

/// Lock record payload. Exists only while held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub holder: NodeId,
    pub acquired_at: DateTime<Utc>,
}

/// Upstream queue or stream a consumer pulls from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceDescriptor {
    Sqs { queue_arn: String, concurrency: u32 },
    Kinesis { stream_name: String },
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Sqs {
                queue_arn,
                concurrency,
            } => write!(f, "sqs:{} (x{})", queue_arn, concurrency),
            SourceDescriptor::Kinesis { stream_name } => write!(f, "kinesis:{}", stream_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumer {
    pub id: String,
    pub source: SourceDescriptor,
    #[serde(default)]
    pub assigned_node: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Consumer {
    /// New, unassigned consumer.
    pub fn new(id: impl Into<String>, source: SourceDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source,
            assigned_node: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_assigned_to(&self, node_id: &NodeId) -> bool {
        self.assigned_node.as_ref() == Some(node_id)
    }

    /// Copy of this consumer moved onto `node_id`.
    pub fn reassigned(&self, node_id: &NodeId) -> Self {
        Self {
            assigned_node: Some(node_id.clone()),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Change streams a backend may push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeTopic {
    Members,
    Consumers,
}

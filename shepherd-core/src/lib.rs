//! Shepherd: cluster membership, leader election and consumer placement
//! over a compare-and-set key/value store with TTLs.
//!
//! Every node runs a [`ClusterNode`]. Membership is a renewable lease in
//! the [`LeaseStore`]; the node holding the election lock runs the
//! [`Dispatcher`], which assigns consumers to live nodes, and every node's
//! [`Executor`] runs the consumers assigned to it.

pub mod config;
pub mod dispatcher;
pub mod election;
pub mod error;
pub mod executor;
mod lease;
pub mod node;
pub mod registry;
pub mod store;
pub mod task;
pub mod types;

pub use config::CoordinationConfig;
pub use dispatcher::{Assignment, Dispatcher, RebalanceReport, plan_assignments};
pub use election::{Election, Role};
pub use error::{Result, ShepherdError};
pub use executor::{ConsumerWorker, Executor, ReconcileReport};
pub use node::ClusterNode;
pub use registry::NodeRegistry;
pub use store::{EtcdStore, LeaseStore, MemoryStore, RedisStore, StoreBuilder};
pub use task::{Guard, GuardedTask, Task, TaskSet};
pub use types::{ChangeTopic, Consumer, LockRecord, NodeId, NodeInfo, SourceDescriptor};

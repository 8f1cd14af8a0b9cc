//! Replicated in-memory cache cluster
//!
//! Entries are replicated across a dynamically changing set of nodes,
//! placed with awareness of machine / rack / site failure domains, and can
//! be searched with a distributed scatter-gather query.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod log;
pub mod membership;
pub mod metrics;
pub mod node;
pub mod placement;
pub mod query;
pub mod replication;
pub mod server;
pub mod store;
pub mod topology;
pub mod transport;
pub mod view;

pub use cache::{Cache, CacheStats, StatsCache, StatsSnapshot, WriteOptions};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult, StoreError, TransportError};
pub use events::{CacheEvent, ListenerRegistry, SubscriptionId};
pub use membership::{FailureDetector, MembershipManager, NodeHealth};
pub use node::ClusterNode;
pub use placement::{OwnerList, Placement};
pub use query::{Predicate, QueryCoordinator, QueryDescriptor, QueryResult, QueryStatus};
pub use replication::{ReplicationCoordinator, ReplicationMode, WriteOp, WriteOutcome};
pub use server::AdminServer;
pub use store::{Entry, LocalStore, MemoryStore};
pub use topology::{NodeDescriptor, NodeId, TopologyInfo};
pub use view::ClusterView;

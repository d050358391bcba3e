//! The request-path dataplane: upstream clusters (server health state,
//! load balancing, affinity, failover), the per-worker connection pool,
//! the per-connection request loop, and the thread-per-core worker
//! runtime.

pub mod affinity;
pub mod balance;
pub mod cluster;
pub mod connection;
pub mod dispatch;
pub mod health;
pub mod pool;
pub mod server;
pub mod worker;

pub use cluster::UpstreamCluster;
pub use pool::{ConnPool, PoolKey};
pub use server::{HealthState, UpstreamServer};
pub use worker::{spawn_workers, SharedGateway};

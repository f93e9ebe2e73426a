// # Connection Pool
//
// Pooled, load-balanced, health-checked connections to the external
// key/value+pub/sub store that backs `SessionStore` and `BatchProcessor`'s
// idempotency cache.
//
// ## Features
//
// - Elastic sizing between `min_connections` and `max_connections`
// - FIFO wait queue for acquisition beyond capacity, with `acquire_timeout`
// - Periodic health checks; unhealthy connections are destroyed as long as
//   `min_connections` healthy ones remain
// - Idle reaping down to `min_connections` every `reap_interval`
// - Least-used load balancing across idle, healthy, role-matching connections

mod connection_pool;

pub use crate::config::PoolConfig;
pub use connection_pool::{
    ConnectionFactory, ConnectionPool, ConnectionRole, PoolStats, PoolStatus, PooledConnection, PooledConnectionGuard,
};

//! leasepool — a fixed-size database connection pool built around leases.
//!
//! Connections are opened up front, handed out one lease at a time, and
//! taken back automatically:
//!
//! - `acquire` never waits. When every connection is leased it fails with
//!   [`PoolError::Exhausted`] and the caller decides how to back off.
//! - A background reclaimer closes and replaces connections whose lease
//!   outlived `max_lease`.
//! - Once every connection has sat idle for `max_idle`, the reclaimer shuts
//!   the pool instance down. The next `acquire` builds a fresh one.
//!
//! # Architecture
//!
//! ```text
//! ConnectionPool
//!   ├── PoolState (one tokio Mutex)
//!   │   ├── pending PoolConfig
//!   │   └── Instance (at most one)
//!   │       ├── Vec<Slot>  ← ConnectionBackend from ConnectionFactory
//!   │       └── Reclaimer task (interval tick + watch stop channel)
//!   └── PooledConnection → Slot (lease flag, timestamps, backend)
//! ```

pub mod config;
pub mod error;
pub mod pool;

pub use config::{ConnectTarget, LeasepoolConfig, PoolConfig, TransportConfig};
pub use error::{PoolError, PoolResult};
pub use pool::tcp::TcpConnectionFactory;
pub use pool::{
    BackgroundError, BackgroundStage, ConnectionBackend, ConnectionFactory, ConnectionPool,
    ErrorSink, PoolStats, PooledConnection,
};

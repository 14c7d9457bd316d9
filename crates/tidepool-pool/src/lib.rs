//! Partitioned connection pooling with background replenishment.
//!
//! A [`Pool`] is split into independent [`Partition`]s. Each partition has
//! its own free queue and its own [`Watcher`] thread, which is the only
//! thing that ever opens connections:
//!
//! - borrowers take ready connections from the free queues and never dial;
//! - the watcher grows its partition in steps of `acquire_increment` until
//!   `max_connections`, then parks until a borrower frees room;
//! - failed dials are logged and retried after `acquire_retry_delay_ms`.
//!
//! # Example
//!
//! ```rust,ignore
//! use tidepool_pool::{Credentials, HandleConfig, Pool, PoolConfig};
//!
//! let config = PoolConfig::new(Credentials::new("postgres://db/app").username("app"))
//!     .partition_count(2)
//!     .min_connections(2)
//!     .max_connections(10);
//!
//! let pool = Pool::new(config, |creds: &Credentials, cfg: &HandleConfig| {
//!     MyDriver::connect(&creds.url, &creds.username, cfg.statements_cache_size)
//! })?;
//!
//! let conn = pool.get()?;
//! // ... use the connection, it goes back to the pool on drop
//! ```

pub mod config;
pub mod handle;
pub mod partition;
pub mod pool;
pub mod watcher;

pub use config::{ConfigSource, Credentials, PoolConfig, SharedConfig};
pub use handle::{ConnectionFactory, ConnectionHandle, HandleConfig};
pub use partition::{AlmostFullGuard, Partition, PartitionStats, Wake};
pub use pool::{Pool, PoolBuilder, PoolStats, PooledConnection};
pub use watcher::{NoopObserver, WatchEvent, WatchObserver, WatchState, Watcher, WatcherHandle};

pub use tidepool_core::{ConnectionErrorKind, Error, PoolErrorKind, PreparedStatement, Result};

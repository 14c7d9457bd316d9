//! The pool façade: partitions, their watchers, and borrowing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tidepool_core::{Error, PoolErrorKind, Result};

use crate::config::{ConfigSource, PoolConfig};
use crate::handle::{ConnectionFactory, ConnectionHandle};
use crate::partition::{Partition, PartitionStats};
use crate::watcher::{NoopObserver, WatchObserver, Watcher, WatcherHandle};

/// How long a borrower sleeps between scans of an empty pool.
const BORROW_POLL: Duration = Duration::from_millis(5);

/// Pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of active connections
    pub active_connections: usize,
    /// Number of pending acquire requests
    pub pending_requests: usize,
    /// Per-partition breakdown
    pub partitions: Vec<PartitionStats>,
}

/// Builder for [`Pool`].
pub struct PoolBuilder {
    config: PoolConfig,
    source: Option<Arc<dyn ConfigSource>>,
    observer: Arc<dyn WatchObserver>,
}

impl PoolBuilder {
    /// Start building a pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            source: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Read live settings from `source` instead of the static config.
    ///
    /// `build` takes the initial `acquire_increment` from it, and the
    /// watchers re-read the statement cache size for every new connection
    /// and the increment before every growth batch.
    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Observe every watcher's events.
    pub fn observer(mut self, observer: Arc<dyn WatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate the configuration, pre-fill every partition to its minimum
    /// and start one watcher per partition.
    pub fn build<F: ConnectionFactory>(self, factory: F) -> Result<Pool<F>> {
        let PoolBuilder {
            mut config,
            source,
            observer,
        } = self;
        config.validate()?;

        let source: Arc<dyn ConfigSource> = match source {
            Some(source) => source,
            None => Arc::new(config.clone()),
        };
        config.acquire_increment = source.acquire_increment()?;
        config.validate()?;

        let factory = Arc::new(factory);
        let partitions: Vec<_> = (0..config.partition_count)
            .map(|index| Arc::new(Partition::new(index, &config)))
            .collect();

        let pool = Pool {
            config,
            source,
            factory,
            observer,
            partitions,
            watchers: Mutex::new(Vec::new()),
            next_partition: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        };

        let mut watchers = Vec::with_capacity(pool.partitions.len());
        for partition in &pool.partitions {
            let mut watcher = pool.watcher_for(partition);
            watcher.prefill(pool.config.min_connections)?;
            watchers.push(watcher);
        }

        let mut handles = Vec::with_capacity(watchers.len());
        for watcher in watchers {
            match watcher.spawn() {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        let _ = handle.stop();
                    }
                    return Err(e);
                }
            }
        }
        *pool.lock_watchers() = handles;

        tracing::info!(
            partitions = pool.partitions.len(),
            min = pool.config.min_connections,
            max = pool.config.max_connections,
            acquire_increment = pool.config.acquire_increment,
            "Connection pool started"
        );
        Ok(pool)
    }
}

/// A partitioned connection pool.
///
/// Each partition is kept topped up by its own watcher thread. Borrowers
/// take from the free queues and never create connections themselves.
pub struct Pool<F: ConnectionFactory> {
    config: PoolConfig,
    source: Arc<dyn ConfigSource>,
    factory: Arc<F>,
    observer: Arc<dyn WatchObserver>,
    partitions: Vec<Arc<Partition<F::Connection>>>,
    watchers: Mutex<Vec<WatcherHandle<F::Connection>>>,
    next_partition: AtomicUsize,
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("partitions", &self.partitions)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool with the default builder settings.
    pub fn new(config: PoolConfig, factory: F) -> Result<Self> {
        PoolBuilder::new(config).build(factory)
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn partitions(&self) -> &[Arc<Partition<F::Connection>>] {
        &self.partitions
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let partitions: Vec<_> = self.partitions.iter().map(|p| p.stats()).collect();
        let total_connections = partitions.iter().map(|p| p.created_connections).sum();
        let idle_connections = partitions.iter().map(|p| p.free_connections).sum();
        let active_connections = partitions.iter().map(|p| p.active_connections()).sum();
        PoolStats {
            total_connections,
            idle_connections,
            active_connections,
            pending_requests: self.pending.load(Ordering::Relaxed),
            partitions,
        }
    }

    /// Check if every partition is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.partitions
            .iter()
            .all(|p| p.is_unable_to_create_more())
    }

    /// Borrow a connection, waiting up to the configured acquire timeout.
    pub fn get(&self) -> Result<PooledConnection<F::Connection>> {
        self.get_timeout(self.config.acquire_timeout_duration())
    }

    /// Borrow a connection, waiting up to `timeout`.
    ///
    /// Partitions are tried round-robin starting from a rotating index. When
    /// every free queue is empty the borrower nudges its home partition's
    /// watcher and polls until the deadline. A timeout too large to add to
    /// the clock waits without a deadline.
    pub fn get_timeout(&self, timeout: Duration) -> Result<PooledConnection<F::Connection>> {
        let deadline = Instant::now().checked_add(timeout);
        let count = self.partitions.len();
        let home = self.next_partition.fetch_add(1, Ordering::Relaxed) % count;

        let mut waiting = false;
        let result = loop {
            if self.is_closed() {
                break Err(Error::pool(PoolErrorKind::Closed, "pool is closed"));
            }

            if let Some(conn) = self.try_take(home) {
                break Ok(conn);
            }

            let partition = &self.partitions[home];
            if !partition.is_unable_to_create_more() {
                partition.almost_full_signal();
            }

            let mut poll = BORROW_POLL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    tracing::debug!(
                        partition = home,
                        timeout_ms = timeout.as_millis(),
                        "Timed out waiting for a connection"
                    );
                    break Err(Error::pool(
                        PoolErrorKind::Timeout,
                        format!("timed out after {timeout:?} waiting for a connection"),
                    ));
                }
                poll = poll.min(deadline - now);
            }
            if !waiting {
                waiting = true;
                self.pending.fetch_add(1, Ordering::Relaxed);
            }
            thread::sleep(poll);
        };

        if waiting {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
        result
    }

    /// Borrow without waiting.
    pub fn try_get(&self) -> Result<PooledConnection<F::Connection>> {
        if self.is_closed() {
            return Err(Error::pool(PoolErrorKind::Closed, "pool is closed"));
        }
        let home = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        self.try_take(home)
            .ok_or_else(|| Error::pool(PoolErrorKind::Exhausted, "no free connection"))
    }

    fn try_take(&self, home: usize) -> Option<PooledConnection<F::Connection>> {
        let count = self.partitions.len();
        (0..count).find_map(|offset| {
            let partition = &self.partitions[(home + offset) % count];
            let handle = partition.take_free()?;
            if partition.wants_growth() {
                partition.almost_full_signal();
            }
            Some(PooledConnection::new(Arc::clone(partition), handle))
        })
    }

    /// Join watchers that have exited on their own and start replacements.
    ///
    /// A watcher only exits by itself on a lock-protocol error. Its error is
    /// logged, the partition's lock is cleared, and a fresh watcher takes
    /// over. Returns the number of watchers restarted.
    pub fn restart_failed_watchers(&self) -> Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        let mut watchers = self.lock_watchers();
        let mut restarted = 0;
        for slot in watchers.iter_mut() {
            if !slot.is_finished() || slot.partition().is_interrupted() {
                continue;
            }
            let partition = Arc::clone(slot.partition());
            if let Err(e) = slot.join() {
                tracing::error!(
                    partition = partition.index(),
                    error = %e,
                    "Restarting failed partition watcher"
                );
            }
            partition.clear_lock_poison();
            *slot = self.watcher_for(&partition).spawn()?;
            restarted += 1;
        }
        Ok(restarted)
    }

    /// Stop every watcher and close idle connections.
    ///
    /// Connections still borrowed stay counted until they are returned,
    /// at which point they are closed rather than queued.
    ///
    /// Returns the first watcher error, if any watcher had died abnormally.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for partition in &self.partitions {
            partition.interrupt();
        }

        let watchers = std::mem::take(&mut *self.lock_watchers());
        let mut first_error = None;
        for handle in watchers {
            let index = handle.partition().index();
            if let Err(e) = handle.stop() {
                tracing::warn!(partition = index, error = %e, "Watcher ended with an error");
                first_error.get_or_insert(e);
            }
        }

        let closed: usize = self.partitions.iter().map(|p| p.drain()).sum();

        tracing::info!(closed, "Connection pool shut down");
        first_error.map_or(Ok(()), Err)
    }

    fn watcher_for(&self, partition: &Arc<Partition<F::Connection>>) -> Watcher<F> {
        Watcher::new(
            Arc::clone(partition),
            Arc::clone(&self.factory),
            Arc::clone(&self.source),
        )
        .with_observer(Arc::clone(&self.observer))
        .with_retry_delay(self.config.acquire_retry_delay_duration())
    }

    fn lock_watchers(&self) -> std::sync::MutexGuard<'_, Vec<WatcherHandle<F::Connection>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<F: ConnectionFactory> Drop for Pool<F> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Error while dropping connection pool");
        }
    }
}

/// A connection borrowed from the pool.
///
/// Goes back to its partition's free queue when dropped.
pub struct PooledConnection<C> {
    partition: Arc<Partition<C>>,
    handle: Option<ConnectionHandle<C>>,
}

impl<C> PooledConnection<C> {
    fn new(partition: Arc<Partition<C>>, handle: ConnectionHandle<C>) -> Self {
        Self {
            partition,
            handle: Some(handle),
        }
    }

    /// The underlying handle, including its statement cache.
    pub fn handle(&self) -> &ConnectionHandle<C> {
        self.handle
            .as_ref()
            .expect("PooledConnection handle missing (already released)")
    }

    pub fn handle_mut(&mut self) -> &mut ConnectionHandle<C> {
        self.handle
            .as_mut()
            .expect("PooledConnection handle missing (already released)")
    }

    /// Index of the partition this connection came from.
    pub fn partition(&self) -> usize {
        self.partition.index()
    }

    /// Close the connection instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        if let Some(handle) = self.handle.take() {
            self.partition.retire(handle);
        }
    }

    /// Take the driver connection out of the pool for good.
    pub fn detach(mut self) -> Option<C> {
        let handle = self.handle.take()?;
        self.partition.retire_slot();
        Some(handle.into_inner())
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("partition", &self.partition.index())
            .field("handle", &self.handle)
            .finish()
    }
}

impl<C> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.handle().connection()
    }
}

impl<C> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle_mut().connection_mut()
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.partition.release(handle);
        }
    }
}

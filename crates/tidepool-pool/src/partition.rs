//! Connection partitions.
//!
//! A partition owns a bounded share of the pool's connections. The watcher
//! is the only writer of the created-connection count; borrowers only take
//! from and return to the free queue, and nudge the watcher through
//! [`Partition::almost_full_signal`].
//!
//! # Locking
//!
//! The almost-full lock guards the full/not-full decision and the
//! wait/notify handshake, nothing else. The free queue is a lock-free
//! [`ArrayQueue`] so that connection creation, which happens outside the
//! lock, never blocks borrowers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use tidepool_core::{Error, PoolErrorKind, Result};

use crate::config::{Credentials, PoolConfig};
use crate::handle::ConnectionHandle;

#[derive(Debug, Default)]
struct AlmostFullState {
    /// A consumer reported room since the watcher last woke.
    signalled: bool,
    /// Shutdown was requested. Sticky.
    interrupted: bool,
}

/// Proof that the almost-full lock is held. Dropping it unlocks.
pub struct AlmostFullGuard<'a> {
    state: MutexGuard<'a, AlmostFullState>,
}

impl std::fmt::Debug for AlmostFullGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlmostFullGuard")
            .field("signalled", &self.state.signalled)
            .field("interrupted", &self.state.interrupted)
            .finish()
    }
}

/// Why [`Partition::almost_full_wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// A consumer called [`Partition::almost_full_signal`].
    Signalled,
    /// The condition woke without a signal.
    Spurious,
}

/// Point-in-time view of a partition's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionStats {
    pub index: usize,
    pub created_connections: usize,
    pub free_connections: usize,
    pub min_connections: usize,
    pub max_connections: usize,
    pub unable_to_create_more: bool,
}

impl PartitionStats {
    /// Connections currently lent out.
    pub fn active_connections(&self) -> usize {
        self.created_connections
            .saturating_sub(self.free_connections)
    }
}

/// A bounded set of connections with its own free queue and watcher.
pub struct Partition<C> {
    index: usize,
    credentials: Credentials,
    min_connections: usize,
    max_connections: usize,
    acquire_increment: usize,
    availability_threshold: Option<u8>,
    created: AtomicUsize,
    pending_retirements: AtomicUsize,
    unable_to_create_more: AtomicBool,
    interrupted: AtomicBool,
    free: ArrayQueue<ConnectionHandle<C>>,
    almost_full: Mutex<AlmostFullState>,
    almost_full_cond: Condvar,
}

impl<C> std::fmt::Debug for Partition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("index", &self.index)
            .field("stats", &self.stats())
            .field("interrupted", &self.is_interrupted())
            .finish_non_exhaustive()
    }
}

impl<C> Partition<C> {
    /// Create an empty partition with the bounds from `config`.
    ///
    /// The configuration is expected to have passed
    /// [`PoolConfig::validate`].
    pub fn new(index: usize, config: &PoolConfig) -> Self {
        let max = config.max_connections.max(1);
        Self {
            index,
            credentials: config.credentials.clone(),
            min_connections: config.min_connections.min(max),
            max_connections: max,
            acquire_increment: config.acquire_increment.max(1),
            availability_threshold: config.pool_availability_threshold,
            created: AtomicUsize::new(0),
            pending_retirements: AtomicUsize::new(0),
            unable_to_create_more: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            free: ArrayQueue::new(max),
            almost_full: Mutex::new(AlmostFullState::default()),
            almost_full_cond: Condvar::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn min_connections(&self) -> usize {
        self.min_connections
    }

    pub fn acquire_increment(&self) -> usize {
        self.acquire_increment
    }

    /// Live connections created by the watcher and not yet retired.
    ///
    /// Racy outside the almost-full lock; treat it as a hint.
    pub fn created_connections(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Number of handles waiting in the free queue.
    pub fn free_connections(&self) -> usize {
        self.free.len()
    }

    /// True when the watcher last saw the partition at its maximum.
    pub fn is_unable_to_create_more(&self) -> bool {
        self.unable_to_create_more.load(Ordering::Acquire)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PartitionStats {
        PartitionStats {
            index: self.index,
            created_connections: self.created_connections(),
            free_connections: self.free_connections(),
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            unable_to_create_more: self.is_unable_to_create_more(),
        }
    }

    // --- almost-full lock and condition ---

    /// Acquire the almost-full lock.
    ///
    /// Fails only if a previous holder panicked; that is a lock-protocol
    /// error and is never retried by the watcher.
    pub fn lock_almost_full(&self) -> Result<AlmostFullGuard<'_>> {
        let state = self
            .almost_full
            .lock()
            .map_err(|_| self.lock_error())?;
        Ok(AlmostFullGuard { state })
    }

    /// Block on the almost-full condition.
    ///
    /// The lock is released while parked and re-acquired before returning.
    /// A signal posted before the call is consumed immediately, so a wake-up
    /// is never lost between the caller's check and the wait. Returns
    /// `Error::Cancelled` once the partition has been interrupted.
    pub fn almost_full_wait<'a>(
        &'a self,
        guard: AlmostFullGuard<'a>,
    ) -> Result<(AlmostFullGuard<'a>, Wake)> {
        let mut state = guard.state;
        if state.interrupted {
            return Err(Error::Cancelled);
        }
        if !state.signalled {
            state = self
                .almost_full_cond
                .wait(state)
                .map_err(|_| self.lock_error())?;
        }
        if state.interrupted {
            return Err(Error::Cancelled);
        }

        let wake = if std::mem::take(&mut state.signalled) {
            Wake::Signalled
        } else {
            Wake::Spurious
        };
        Ok((AlmostFullGuard { state }, wake))
    }

    /// Wake the watcher: a consumer freed room or needs more connections.
    pub fn almost_full_signal(&self) {
        let mut state = self
            .almost_full
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.signalled = true;
        self.almost_full_cond.notify_one();
    }

    /// Ask the watcher to stop. Every later wait or pause returns
    /// `Error::Cancelled`.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let mut state = self
            .almost_full
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.interrupted = true;
        self.almost_full_cond.notify_all();
    }

    /// Sleep for `delay` unless interrupted first.
    ///
    /// Signals arriving meanwhile stay pending for the next wait. A delay
    /// too large to add to the clock sleeps until interrupted.
    pub fn pause(&self, delay: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(delay);
        let mut state = self
            .almost_full
            .lock()
            .map_err(|_| self.lock_error())?;
        loop {
            if state.interrupted {
                return Err(Error::Cancelled);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    self.almost_full_cond
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| self.lock_error())?
                        .0
                }
                None => self
                    .almost_full_cond
                    .wait(state)
                    .map_err(|_| self.lock_error())?,
            };
        }
    }

    /// Wake any waiter without posting a signal.
    #[cfg(test)]
    pub(crate) fn spurious_notify(&self) {
        self.almost_full_cond.notify_all();
    }

    /// Clear a poisoned almost-full lock so a replacement watcher can run.
    pub(crate) fn clear_lock_poison(&self) {
        self.almost_full.clear_poison();
    }

    fn lock_error(&self) -> Error {
        Error::pool(
            PoolErrorKind::Lock,
            format!("partition {} almost-full lock is poisoned", self.index),
        )
    }

    // --- watcher-only mutators ---

    /// Fold connections retired by borrowers back into the created count.
    pub(crate) fn fold_retirements(&self, _guard: &AlmostFullGuard<'_>) -> usize {
        let retired = self.pending_retirements.swap(0, Ordering::AcqRel);
        if retired > 0 {
            self.forget_created(retired);
        }
        retired
    }

    pub(crate) fn set_unable_to_create_more(&self, unable: bool) {
        self.unable_to_create_more.store(unable, Ordering::Release);
    }

    /// Count a freshly created handle and make it available.
    pub(crate) fn add_free_connection(&self, handle: ConnectionHandle<C>) -> Result<()> {
        self.created.fetch_add(1, Ordering::AcqRel);
        if self.free.push(handle).is_err() {
            self.created.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::pool(
                PoolErrorKind::Exhausted,
                format!("partition {} free queue is full", self.index),
            ));
        }
        Ok(())
    }

    /// Whether the watcher should hold off growing because enough of the
    /// created connections are sitting idle.
    pub(crate) fn above_availability_threshold(&self) -> bool {
        let Some(threshold) = self.availability_threshold else {
            return false;
        };
        let created = self.created_connections();
        if created == 0 || created < self.min_connections {
            return false;
        }
        self.free_connections() * 100 / created > usize::from(threshold)
    }

    // --- consumer operations ---

    /// Take a ready handle, if any.
    pub fn take_free(&self) -> Option<ConnectionHandle<C>> {
        self.free.pop()
    }

    /// Return a borrowed handle to the free queue.
    ///
    /// Once the partition is interrupted the handle is closed instead and
    /// leaves the created count directly, since no watcher will fold it.
    pub fn release(&self, handle: ConnectionHandle<C>) {
        if self.is_interrupted() {
            drop(handle);
            self.forget_created(1);
            return;
        }
        if let Err(handle) = self.free.push(handle) {
            tracing::warn!(
                partition = self.index,
                "Free queue full on release, retiring connection"
            );
            self.retire(handle);
        }
    }

    /// Destroy a handle and give its slot back to the watcher.
    pub fn retire(&self, handle: ConnectionHandle<C>) {
        drop(handle);
        self.retire_slot();
    }

    /// Give back the slot of a handle that already left the pool.
    pub(crate) fn retire_slot(&self) {
        self.pending_retirements.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(partition = self.index, "Connection retired");
        self.almost_full_signal();
    }

    /// Close every idle handle and drop them, along with pending
    /// retirements, from the created count. Only valid once the watcher has
    /// stopped. Returns the number of idle handles closed.
    pub(crate) fn drain(&self) -> usize {
        let mut drained = 0;
        while let Some(handle) = self.free.pop() {
            drop(handle);
            drained += 1;
        }
        let retired = self.pending_retirements.swap(0, Ordering::AcqRel);
        self.forget_created(drained + retired);
        drained
    }

    fn forget_created(&self, n: usize) {
        let _ = self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                Some(created.saturating_sub(n))
            });
    }

    /// Whether a borrower should nudge the watcher after taking a handle.
    pub(crate) fn wants_growth(&self) -> bool {
        if self.is_unable_to_create_more() {
            return false;
        }
        match self.availability_threshold {
            Some(threshold) => {
                let created = self.created_connections();
                created == 0 || self.free_connections() * 100 / created <= usize::from(threshold)
            }
            None => self.free.is_empty(),
        }
    }
}

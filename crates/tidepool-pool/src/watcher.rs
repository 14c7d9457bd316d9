//! The partition watcher.
//!
//! One watcher runs per partition on its own thread. It is the only code
//! that grows a partition: it creates connections in batches of at most
//! `acquire_increment`, parks on the almost-full condition while the
//! partition is at its maximum, and keeps going after failed dials.
//!
//! Each iteration:
//!
//! 1. `Checking`: take the almost-full lock, fold retirements, compare
//!    created against max.
//! 2. At max: set the unable flag and park (`Waiting`). Any wake-up, real or
//!    spurious, goes back to `Checking`.
//! 3. Room left: clear the flag, drop the lock, re-read `acquire_increment`
//!    from the config source and create `min(acquire_increment, max -
//!    created)` connections (`Growing`). The
//!    first failure ends the batch and the watcher pauses for the retry
//!    delay before checking again.
//!
//! Interruption ends the loop with `Ok(())`. A poisoned almost-full lock
//! ends it with the lock error; see [`Watcher::run`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tidepool_core::{Error, PoolErrorKind, Result};

use crate::config::ConfigSource;
use crate::handle::{ConnectionFactory, ConnectionHandle};
use crate::partition::{AlmostFullGuard, Partition, Wake};

/// Where the watcher is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchState {
    #[default]
    Checking,
    Waiting,
    Growing,
    Terminated,
}

/// Something the watcher did, reported to a [`WatchObserver`].
#[derive(Debug)]
pub enum WatchEvent<'a> {
    /// Start of an iteration.
    Checking { partition: usize },
    /// Returned from the almost-full wait.
    Woke { partition: usize, signalled: bool },
    /// A growth batch is starting.
    Growing { partition: usize, to_create: usize },
    /// A connection was added; `created` is the new total.
    Created { partition: usize, created: usize },
    /// A connection could not be built. The batch is abandoned.
    CreationFailed { partition: usize, error: &'a Error },
    /// The loop has exited.
    Terminated { partition: usize },
}

/// Receives [`WatchEvent`]s.
///
/// Events are delivered without the almost-full lock held, so observers may
/// call [`Partition::interrupt`] or [`Partition::almost_full_signal`].
pub trait WatchObserver: Send + Sync {
    fn on_event(&self, event: &WatchEvent<'_>);
}

impl<F> WatchObserver for F
where
    F: Fn(&WatchEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &WatchEvent<'_>) {
        self(event);
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl WatchObserver for NoopObserver {
    fn on_event(&self, _event: &WatchEvent<'_>) {}
}

/// Background replenisher for one partition.
pub struct Watcher<F: ConnectionFactory> {
    partition: Arc<Partition<F::Connection>>,
    factory: Arc<F>,
    config: Arc<dyn ConfigSource>,
    observer: Arc<dyn WatchObserver>,
    retry_delay: Duration,
    state: WatchState,
    /// Whether the last wake-up came from a real signal. Reset every
    /// iteration.
    signalled: bool,
}

impl<F: ConnectionFactory> std::fmt::Debug for Watcher<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("partition", &self.partition.index())
            .field("state", &self.state)
            .field("signalled", &self.signalled)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Watcher<F> {
    pub fn new(
        partition: Arc<Partition<F::Connection>>,
        factory: Arc<F>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            partition,
            factory,
            config,
            observer: Arc::new(NoopObserver),
            retry_delay: Duration::ZERO,
            state: WatchState::Checking,
            signalled: false,
        }
    }

    /// Set the observer notified of every state change.
    pub fn with_observer(mut self, observer: Arc<dyn WatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Set the pause after a failed creation batch.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn partition(&self) -> &Arc<Partition<F::Connection>> {
        &self.partition
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Whether the most recent wake-up was a genuine signal.
    pub fn signalled(&self) -> bool {
        self.signalled
    }

    /// Run the loop on the calling thread until interrupted.
    ///
    /// Returns `Ok(())` after an interrupt. A lock-protocol error is not
    /// caught: it ends the loop and is returned, and the partition stays
    /// unreplenished until the owner starts a new watcher.
    pub fn run(&mut self) -> Result<()> {
        let index = self.partition.index();
        tracing::debug!(partition = index, "Partition watcher started");

        let result = match self.watch() {
            Err(Error::Cancelled) => Ok(()),
            other => other,
        };

        self.state = WatchState::Terminated;
        self.observer
            .on_event(&WatchEvent::Terminated { partition: index });
        match &result {
            Ok(()) => tracing::debug!(partition = index, "Partition watcher stopped"),
            Err(e) => tracing::error!(
                partition = index,
                error = %e,
                "Partition watcher terminated abnormally"
            ),
        }
        result
    }

    /// Move the watcher onto a dedicated thread.
    pub fn spawn(mut self) -> Result<WatcherHandle<F::Connection>> {
        let partition = Arc::clone(&self.partition);
        let thread = thread::Builder::new()
            .name(format!("tidepool-watch-{}", partition.index()))
            .spawn(move || self.run())?;
        Ok(WatcherHandle {
            partition,
            thread: Some(thread),
        })
    }

    /// Create connections until the partition holds at least `target`.
    ///
    /// Used for the startup fill; unlike the loop, the first failure is
    /// returned to the caller.
    pub fn prefill(&mut self, target: usize) -> Result<()> {
        let target = target.min(self.partition.max_connections());
        let missing = target.saturating_sub(self.partition.created_connections());
        if missing == 0 {
            return Ok(());
        }
        self.fill(missing)
    }

    fn watch(&mut self) -> Result<()> {
        let index = self.partition.index();
        loop {
            if self.partition.is_interrupted() {
                return Err(Error::Cancelled);
            }
            self.signalled = false;
            self.state = WatchState::Checking;
            self.observer
                .on_event(&WatchEvent::Checking { partition: index });

            let Some(to_create) = self.check()? else {
                continue;
            };

            self.state = WatchState::Growing;
            self.observer.on_event(&WatchEvent::Growing {
                partition: index,
                to_create,
            });
            if let Err(e) = self.fill(to_create) {
                tracing::error!(
                    partition = index,
                    error = %e,
                    retry_in_ms = self.retry_delay.as_millis(),
                    "Error in trying to obtain a connection"
                );
                self.observer.on_event(&WatchEvent::CreationFailed {
                    partition: index,
                    error: &e,
                });
                self.partition.pause(self.retry_delay)?;
            }
        }
    }

    /// The locked decision step. Returns the batch size when there is room,
    /// `None` after parking.
    fn check(&mut self) -> Result<Option<usize>> {
        let partition = Arc::clone(&self.partition);
        let guard = partition.lock_almost_full()?;

        let retired = partition.fold_retirements(&guard);
        if retired > 0 {
            tracing::debug!(
                partition = partition.index(),
                retired,
                "Reclaimed retired connection slots"
            );
        }

        let created = partition.created_connections();
        let max = partition.max_connections();

        if created >= max {
            partition.set_unable_to_create_more(true);
            tracing::trace!(
                partition = partition.index(),
                created,
                max,
                "Partition full, waiting for room"
            );
            self.park(&partition, guard)?;
            return Ok(None);
        }

        partition.set_unable_to_create_more(false);
        if partition.above_availability_threshold() {
            tracing::trace!(
                partition = partition.index(),
                created,
                free = partition.free_connections(),
                "Enough idle connections, waiting for demand"
            );
            self.park(&partition, guard)?;
            return Ok(None);
        }
        drop(guard);

        Ok(Some(self.acquire_increment().min(max - created)))
    }

    /// The current growth step from the config source. A failed read falls
    /// back to the step the partition was built with.
    fn acquire_increment(&self) -> usize {
        match self.config.acquire_increment() {
            Ok(step) => step.max(1),
            Err(e) => {
                tracing::warn!(
                    partition = self.partition.index(),
                    error = %e,
                    "Could not read acquire_increment, using the configured default"
                );
                self.partition.acquire_increment()
            }
        }
    }

    fn park(
        &mut self,
        partition: &Partition<F::Connection>,
        guard: AlmostFullGuard<'_>,
    ) -> Result<()> {
        self.state = WatchState::Waiting;
        let (guard, wake) = partition.almost_full_wait(guard)?;
        drop(guard);

        self.signalled = wake == Wake::Signalled;
        if !self.signalled {
            tracing::trace!(partition = partition.index(), "Spurious wake-up");
        }
        self.observer.on_event(&WatchEvent::Woke {
            partition: partition.index(),
            signalled: self.signalled,
        });
        Ok(())
    }

    /// Create up to `to_create` connections, stopping at the first failure.
    #[tracing::instrument(level = "debug", skip(self), fields(partition = self.partition.index()))]
    fn fill(&mut self, to_create: usize) -> Result<()> {
        let index = self.partition.index();
        for _ in 0..to_create {
            if self.partition.is_interrupted() {
                break;
            }
            let handle = ConnectionHandle::open(
                self.factory.as_ref(),
                self.partition.credentials(),
                self.config.as_ref(),
                index,
            )?;
            self.partition.add_free_connection(handle)?;

            let created = self.partition.created_connections();
            tracing::debug!(partition = index, created, "Created connection");
            self.observer.on_event(&WatchEvent::Created {
                partition: index,
                created,
            });
        }
        Ok(())
    }
}

/// A watcher running on its own thread.
#[derive(Debug)]
pub struct WatcherHandle<C> {
    partition: Arc<Partition<C>>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl<C> WatcherHandle<C> {
    pub fn partition(&self) -> &Arc<Partition<C>> {
        &self.partition
    }

    /// Whether the watcher thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Interrupt the partition and wait for the watcher to exit.
    pub fn stop(mut self) -> Result<()> {
        self.partition.interrupt();
        self.join()
    }

    /// Wait for the watcher to exit and return its result.
    pub fn join(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread.join().unwrap_or_else(|_| {
            Err(Error::pool(
                PoolErrorKind::Worker,
                format!("watcher for partition {} panicked", self.partition.index()),
            ))
        })
    }
}

impl<C> Drop for WatcherHandle<C> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.partition.interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, PoolConfig};
    use crate::handle::HandleConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Factory = fn(&Credentials, &HandleConfig) -> Result<u32>;

    fn ok_factory(_: &Credentials, _: &HandleConfig) -> Result<u32> {
        Ok(1)
    }

    fn watcher(config: &PoolConfig) -> Watcher<Factory> {
        let partition = Arc::new(Partition::new(0, config));
        Watcher::new(
            partition,
            Arc::new(ok_factory as Factory),
            Arc::new(config.clone()),
        )
    }

    #[test]
    fn new_watcher_starts_checking_and_unsignalled() {
        let w = watcher(&PoolConfig::default());
        assert_eq!(w.state(), WatchState::Checking);
        assert!(!w.signalled());
    }

    #[test]
    fn prefill_creates_up_to_target() {
        let config = PoolConfig::default()
            .min_connections(3)
            .max_connections(5)
            .acquire_increment(1);
        let mut w = watcher(&config);
        w.prefill(3).unwrap();
        assert_eq!(w.partition().created_connections(), 3);
        assert_eq!(w.partition().free_connections(), 3);

        // Already satisfied.
        w.prefill(2).unwrap();
        assert_eq!(w.partition().created_connections(), 3);

        // Clamped to max.
        w.prefill(50).unwrap();
        assert_eq!(w.partition().created_connections(), 5);
    }

    #[test]
    fn batches_respect_acquire_increment() {
        let config = PoolConfig::default()
            .min_connections(1)
            .max_connections(7)
            .acquire_increment(3);
        let batches = Arc::new(Mutex::new(Vec::new()));

        let mut w = watcher(&config);
        let partition = Arc::clone(w.partition());
        let seen = Arc::clone(&batches);
        w = w.with_observer(Arc::new(move |event: &WatchEvent<'_>| match event {
            WatchEvent::Growing { to_create, .. } => seen.lock().unwrap().push(*to_create),
            WatchEvent::Woke { .. } => partition.interrupt(),
            _ => {}
        }));

        // Fill to max, then the first park ends the run via a pending signal.
        w.partition().almost_full_signal();
        w.run().unwrap();

        assert_eq!(*batches.lock().unwrap(), vec![3, 3, 1]);
        assert_eq!(w.partition().created_connections(), 7);
        assert!(w.partition().is_unable_to_create_more());
        assert!(w.signalled());
        assert_eq!(w.state(), WatchState::Terminated);
    }

    #[test]
    fn spurious_wake_rechecks_without_growing() {
        let config = PoolConfig::default().min_connections(2).max_connections(2);
        let mut w = watcher(&config);
        w.prefill(2).unwrap();

        let wakes = Arc::new(Mutex::new(Vec::new()));
        let checks = Arc::new(AtomicUsize::new(0));
        let growths = Arc::new(AtomicUsize::new(0));
        w = w.with_observer(Arc::new({
            let wakes = Arc::clone(&wakes);
            let checks = Arc::clone(&checks);
            let growths = Arc::clone(&growths);
            move |event: &WatchEvent<'_>| match event {
                WatchEvent::Woke { signalled, .. } => wakes.lock().unwrap().push(*signalled),
                WatchEvent::Checking { .. } => {
                    checks.fetch_add(1, Ordering::SeqCst);
                }
                WatchEvent::Growing { .. } => {
                    growths.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }));

        let partition = Arc::clone(w.partition());
        let poker = {
            let wakes = Arc::clone(&wakes);
            let checks = Arc::clone(&checks);
            thread::spawn(move || {
                while wakes.lock().unwrap().is_empty() {
                    partition.spurious_notify();
                    thread::sleep(Duration::from_millis(2));
                }
                // The re-check after the wake parks again.
                while checks.load(Ordering::SeqCst) < 2 {
                    thread::sleep(Duration::from_millis(2));
                }
                thread::sleep(Duration::from_millis(20));
                partition.interrupt();
            })
        };

        w.run().unwrap();
        poker.join().unwrap();

        let wakes = wakes.lock().unwrap();
        assert!(!wakes.is_empty());
        assert!(wakes.iter().all(|signalled| !signalled));
        assert!(!w.signalled());
        assert_eq!(growths.load(Ordering::SeqCst), 0);
        assert!(checks.load(Ordering::SeqCst) >= 2);
        assert_eq!(w.partition().created_connections(), 2);
        assert!(w.partition().is_unable_to_create_more());
    }

    #[test]
    fn spawned_watcher_fills_and_stops() {
        let config = PoolConfig::default()
            .min_connections(1)
            .max_connections(4)
            .acquire_increment(2);
        let w = watcher(&config);
        let partition = Arc::clone(w.partition());
        let handle = w.spawn().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !partition.is_unable_to_create_more() {
            assert!(std::time::Instant::now() < deadline, "partition never filled");
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(partition.created_connections(), 4);
        assert!(!handle.is_finished());

        handle.stop().unwrap();
        assert!(partition.is_interrupted());
    }
}

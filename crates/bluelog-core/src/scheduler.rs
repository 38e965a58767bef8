//! The control loop that drives the tracker.
//!
//! A single task owns the [`PresenceTracker`]: it applies sightings as they
//! arrive, sweeps once per second, and flushes the registry when it is dirty
//! and the flush interval has passed. On shutdown it flushes one last time.
//! Because nothing else touches the registry, no locking is needed.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::RegistryStore;
use crate::tracker::PresenceTracker;
use crate::types::{Registry, Sighting};

/// Cadence of the staleness sweep and the flush check.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Drives a [`PresenceTracker`] from a stream of sightings.
#[derive(Debug)]
pub struct Scheduler {
    tracker: PresenceTracker,
    store: RegistryStore,
    flush_interval: Duration,
    last_flush: Instant,
}

impl Scheduler {
    /// Create a scheduler. The flush clock starts now.
    #[must_use]
    pub fn new(tracker: PresenceTracker, store: RegistryStore, flush_interval: Duration) -> Self {
        Self {
            tracker,
            store,
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    /// Run until `cancel` fires or the sighting source closes.
    ///
    /// Returns the final registry after the shutdown flush.
    ///
    /// # Errors
    ///
    /// Returns an error as soon as a flush fails. Losing the ability to
    /// persist is treated as fatal.
    pub async fn run(
        mut self,
        mut sightings: mpsc::Receiver<Sighting>,
        cancel: CancellationToken,
    ) -> Result<Registry> {
        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            devices = self.tracker.registry().devices.len(),
            path = %self.store.path().display(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                // Ahead of the channel so a busy source cannot starve sweeps and flushes.
                _ = ticker.tick() => self.tick()?,
                sighting = sightings.recv() => match sighting {
                    Some(sighting) => {
                        self.tracker.upsert(&sighting, Utc::now());
                    }
                    None => {
                        info!("Sighting source closed");
                        break;
                    }
                },
            }
        }

        self.shutdown()
    }

    /// One tick: sweep, then flush if due.
    ///
    /// # Errors
    ///
    /// Returns an error if a due flush fails.
    pub fn tick(&mut self) -> Result<()> {
        self.tracker.sweep(Utc::now());
        if self.flush_due() {
            self.flush()?;
        }
        Ok(())
    }

    /// Whether the registry is dirty and the flush interval has elapsed.
    #[must_use]
    pub fn flush_due(&self) -> bool {
        self.tracker.is_dirty() && self.last_flush.elapsed() >= self.flush_interval
    }

    /// Write the registry now and reset the flush clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the atomic write fails; the tracker stays dirty.
    pub fn flush(&mut self) -> Result<()> {
        self.store.save(self.tracker.registry())?;
        self.tracker.mark_clean();
        self.last_flush = Instant::now();
        debug!(
            devices = self.tracker.registry().devices.len(),
            present = self.tracker.present_count(),
            "Registry flushed"
        );
        Ok(())
    }

    /// The tracker being driven.
    #[must_use]
    pub const fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    /// Mutable access to the tracker, for callers that apply sightings themselves.
    pub fn tracker_mut(&mut self) -> &mut PresenceTracker {
        &mut self.tracker
    }

    /// Final flush if anything changed, then hand back the registry.
    fn shutdown(mut self) -> Result<Registry> {
        if self.tracker.is_dirty() {
            self.flush()?;
        }
        info!(
            devices = self.tracker.registry().devices.len(),
            present = self.tracker.present_count(),
            "Scheduler stopped"
        );
        Ok(self.tracker.into_registry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NoopNotifier;
    use crate::storage::try_load_registry;
    use crate::tracker::TrackerConfig;

    fn scheduler(dir: &tempfile::TempDir, flush_interval: Duration) -> Scheduler {
        let store = RegistryStore::new(dir.path().join("registry.json"));
        let tracker = PresenceTracker::new(
            store.load(),
            TrackerConfig::default(),
            Box::new(NoopNotifier),
        );
        Scheduler::new(tracker, store, flush_interval)
    }

    fn beacon() -> Sighting {
        Sighting {
            address: Some("C3:00:00:00:00:01".into()),
            name: Some("Tag".into()),
            rssi: Some(-70),
            service_uuids: vec!["0000feaa-0000-1000-8000-00805f9b34fb".into()],
            ..Sighting::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(&dir, Duration::from_secs(10));
        let path = dir.path().join("registry.json");

        scheduler.tick().unwrap();
        assert!(!path.exists());
        assert!(scheduler.tracker().is_dirty());

        tokio::time::advance(Duration::from_secs(10)).await;
        scheduler.tick().unwrap();
        assert!(path.exists());
        assert!(!scheduler.tracker().is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_registry_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(&dir, Duration::from_secs(1));
        let path = dir.path().join("registry.json");

        tokio::time::advance(Duration::from_secs(1)).await;
        scheduler.tick().unwrap();
        std::fs::remove_file(&path).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        scheduler.tick().unwrap();
        assert!(!path.exists());

        scheduler.tracker_mut().upsert(&beacon(), Utc::now());
        assert!(scheduler.flush_due());
        scheduler.tick().unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_run_flushes_on_source_close() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(&dir, Duration::from_secs(3600));
        let (tx, rx) = mpsc::channel(8);

        tx.send(beacon()).await.unwrap();
        drop(tx);

        let registry = scheduler.run(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(registry.devices.len(), 1);

        let persisted = try_load_registry(&dir.path().join("registry.json"))
            .unwrap()
            .unwrap();
        assert_eq!(persisted, registry);
        let record = persisted.devices.values().next().unwrap();
        assert_eq!(record.primary_tag, "beacon:eddystone");
        assert!(record.present);
    }

    #[tokio::test]
    async fn test_run_flushes_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(&dir, Duration::from_secs(3600));
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(rx, cancel.clone()));
        tx.send(beacon()).await.unwrap();
        while tx.capacity() < tx.max_capacity() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let registry = handle.await.unwrap().unwrap();
        let persisted = try_load_registry(&dir.path().join("registry.json"))
            .unwrap()
            .unwrap();
        assert_eq!(persisted, registry);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_busy_source_does_not_starve_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let scheduler = scheduler(&dir, Duration::from_secs(1));
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let producer_cancel = cancel.clone();
        let producer = tokio::spawn(async move {
            while !producer_cancel.is_cancelled() {
                if tx.send(beacon()).await.is_err() {
                    break;
                }
            }
        });
        let handle = tokio::spawn(scheduler.run(rx, cancel.clone()));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !path.exists() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let flushed_while_busy = path.exists();
        assert!(!producer.is_finished());

        cancel.cancel();
        handle.await.unwrap().unwrap();
        producer.await.unwrap();
        assert!(flushed_while_busy);
    }

    #[tokio::test]
    async fn test_flush_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("registry.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        let tracker = PresenceTracker::new(
            crate::types::Registry::default(),
            TrackerConfig::default(),
            Box::new(NoopNotifier),
        );
        let mut scheduler = Scheduler::new(tracker, RegistryStore::new(&path), Duration::ZERO);

        let err = scheduler.flush().unwrap_err();
        assert!(err.is_io_error());
        assert!(scheduler.tracker().is_dirty());
    }
}

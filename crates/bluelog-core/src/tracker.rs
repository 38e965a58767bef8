//! Presence tracking over the device registry.
//!
//! The tracker exclusively owns the in-memory [`Registry`]. Each sighting is
//! applied with [`PresenceTracker::upsert`]; a periodic
//! [`PresenceTracker::sweep`] marks devices that have not been seen for the
//! leave timeout as absent and books their dwell time.
//!
//! ```text
//!            upsert (enter_count+1, notify?)
//!   Absent ─────────────────────────────────▶ Present ──┐
//!     ▲                                          │      │ upsert
//!     └────── sweep: unseen ≥ leave timeout ─────┘ ◀────┘ (observation only)
//!             (leave_count+1, dwell += now - last_enter)
//! ```

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, trace};

use crate::classify::classify;
use crate::config::BluelogConfig;
use crate::fingerprint::Fingerprint;
use crate::notifier::{qualifies, EnterPayload, Notify};
use crate::types::{
    epoch_seconds, from_epoch_seconds, DeviceRecord, Registry, Sighting, SightingEvent,
};

/// Tracker settings derived from [`BluelogConfig`].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Unseen time after which a present device is marked as left.
    pub leave_timeout: Duration,

    /// Capacity of each record's recent sighting history.
    pub max_recent_events: usize,

    /// Normalized names that never trigger a notification.
    pub suppressed_names: HashSet<String>,

    /// Adapter recorded in the registry metadata.
    pub adapter: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from(&BluelogConfig::default())
    }
}

impl From<&BluelogConfig> for TrackerConfig {
    fn from(config: &BluelogConfig) -> Self {
        Self {
            leave_timeout: config.leave_timeout(),
            max_recent_events: config.max_recent_events,
            suppressed_names: config.suppressed_names(),
            adapter: config.adapter.clone(),
        }
    }
}

/// What an upsert did to its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Fingerprint of the affected record.
    pub fp: String,
    /// The record did not exist before.
    pub created: bool,
    /// The record transitioned from absent to present.
    pub entered: bool,
    /// An enter notification was handed to the notifier.
    pub notified: bool,
}

/// Owner of the registry and its presence state machine.
pub struct PresenceTracker {
    registry: Registry,
    config: TrackerConfig,
    notifier: Box<dyn Notify>,
    dirty: bool,
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("devices", &self.registry.devices.len())
            .field("config", &self.config)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl PresenceTracker {
    /// Take ownership of a loaded registry.
    ///
    /// Metadata is restamped with the current settings and the registry is
    /// marked dirty so records loaded from an older schema are rewritten
    /// with every field at the next flush.
    pub fn new(mut registry: Registry, config: TrackerConfig, notifier: Box<dyn Notify>) -> Self {
        registry.meta.updated_utc = Some(Utc::now().trunc_subsecs(0));
        registry.meta.adapter = Some(config.adapter.clone());
        registry.meta.leave_timeout_sec = Some(config.leave_timeout.as_secs());

        Self {
            registry,
            config,
            notifier,
            dirty: true,
        }
    }

    /// Apply one sighting observed at `now`.
    pub fn upsert(&mut self, sighting: &Sighting, now: DateTime<Utc>) -> UpsertOutcome {
        let fingerprint = Fingerprint::of(sighting);
        let fp = fingerprint.id.clone();
        let now_secs = now.trunc_subsecs(0);
        let now_ts = epoch_seconds(now);

        let mut created = false;
        let record = self.registry.devices.entry(fp.clone()).or_insert_with(|| {
            created = true;
            new_record(fingerprint, now_secs)
        });
        if created {
            debug!(fp = %fp, primary_tag = %record.primary_tag, "New device");
        }

        record.observe(sighting, now_secs, now_ts, self.config.max_recent_events);
        trace!(fp = %fp, rssi = ?sighting.rssi, address = ?sighting.address, "Sighting");

        self.registry.meta.updated_utc = Some(now_secs);
        self.dirty = true;

        let mut outcome = UpsertOutcome {
            fp,
            created,
            entered: false,
            notified: false,
        };
        if record.present {
            return outcome;
        }

        let reentered = record.enter(now_secs, now_ts);
        outcome.entered = true;
        info!(
            fp = %outcome.fp,
            name = ?sighting.name,
            primary_tag = %record.primary_tag,
            reentered,
            "Device entered"
        );

        if qualifies(
            sighting.name.as_deref(),
            &record.primary_tag,
            &self.config.suppressed_names,
        ) {
            self.notifier.notify(EnterPayload::new(record, sighting));
            outcome.notified = true;
        }
        outcome
    }

    /// Mark every present device unseen for at least the leave timeout as absent.
    ///
    /// Returns the number of devices that left.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let now_secs = now.trunc_subsecs(0);
        let now_ts = epoch_seconds(now);
        let timeout = self.config.leave_timeout.as_secs_f64();

        let mut left = 0;
        for record in self.registry.devices.values_mut() {
            if !record.is_stale(now_ts, timeout) {
                continue;
            }
            record.leave(now_secs, now_ts);
            left += 1;
            info!(
                fp = %record.fp,
                dwell_secs = record.last_dwell_secs(),
                "Device left"
            );
        }

        if left > 0 {
            self.registry.meta.updated_utc = Some(now_secs);
            self.dirty = true;
        }
        left
    }

    /// The registry as it currently stands.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Give up ownership of the registry.
    #[must_use]
    pub fn into_registry(self) -> Registry {
        self.registry
    }

    /// Look up a record by fingerprint.
    #[must_use]
    pub fn device(&self, fp: &str) -> Option<&DeviceRecord> {
        self.registry.devices.get(fp)
    }

    /// Whether there are changes not yet flushed.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record that the current state has been persisted.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Number of devices currently present.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.registry.present_count()
    }
}

fn new_record(fingerprint: Fingerprint, now: DateTime<Utc>) -> DeviceRecord {
    let classification = classify(
        &fingerprint.material.manufacturer_ids,
        &fingerprint.material.service_uuids,
    );
    DeviceRecord {
        fp: fingerprint.id,
        fingerprint: fingerprint.material,
        tags: classification.tags,
        primary_tag: classification.primary,
        first_seen: now,
        last_seen: now,
        ..DeviceRecord::default()
    }
}

impl DeviceRecord {
    /// Update observation fields; presence is left alone.
    fn observe(&mut self, sighting: &Sighting, now: DateTime<Utc>, now_ts: f64, capacity: usize) {
        self.last_seen = now;
        self.last_seen_ts = now_ts;
        self.seen_count += 1;
        self.last_rssi = sighting.rssi;

        if let Some(rssi) = sighting.rssi {
            if self.best_rssi.map_or(true, |best| rssi > best) {
                self.best_rssi = Some(rssi);
            }
        }
        if let Some(address) = sighting.address.as_deref().filter(|a| !a.is_empty()) {
            self.addresses.insert(address);
        }
        if let Some(name) = sighting.name.as_deref().filter(|n| !n.is_empty()) {
            self.names_seen.insert(name);
        }

        self.last_events.push(
            SightingEvent {
                time: now,
                address: sighting.address.clone(),
                rssi: sighting.rssi,
                source: sighting.source.clone(),
            },
            capacity,
        );
    }

    /// Absent → present. Returns whether this was a re-enter.
    fn enter(&mut self, now: DateTime<Utc>, now_ts: f64) -> bool {
        let reentered = self.last_left.is_some() || self.last_left_ts.is_some();
        self.enter_count += 1;
        if reentered {
            self.reenter_count += 1;
        }
        self.present = true;
        self.last_enter = Some(now);
        self.last_enter_ts = Some(now_ts);
        reentered
    }

    fn is_stale(&self, now_ts: f64, timeout_secs: f64) -> bool {
        self.present && self.last_seen_ts > 0.0 && now_ts - self.last_seen_ts >= timeout_secs
    }

    /// Present → absent, booking the time since the last enter.
    fn leave(&mut self, now: DateTime<Utc>, now_ts: f64) {
        self.present = false;
        self.last_left = Some(now);
        self.last_left_ts = Some(now_ts);
        self.leave_count += 1;

        let Some(enter_ts) = self.last_enter_ts.filter(|ts| *ts > 0.0) else {
            return;
        };
        let Some(entered) = from_epoch_seconds(enter_ts) else {
            return;
        };
        let elapsed = (now_ts - enter_ts).max(0.0);
        *self
            .presence_by_day
            .entry(entered.date_naive())
            .or_insert(0.0) += elapsed;
    }

    fn last_dwell_secs(&self) -> f64 {
        match (self.last_enter_ts, self.last_left_ts) {
            (Some(entered), Some(left)) => (left - entered).max(0.0),
            _ => 0.0,
        }
    }
}

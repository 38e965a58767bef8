//! Registry document types.
//!
//! These types are the on-disk schema of the registry file as well as the
//! in-memory state owned by the [`PresenceTracker`](crate::tracker::PresenceTracker).
//! Field names follow the JSON keys of the persisted document, and every
//! field carries a default so documents written before a field existed still
//! load.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::fingerprint::FingerprintMaterial;

/// Primary tag of a device no classification rule matched.
pub const UNCLASSIFIED: &str = "unclassified";

/// A single advertisement observed by the scanner.
///
/// Every field is optional on the wire; missing collections are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sighting {
    /// Advertising address, possibly a rotating random one.
    pub address: Option<String>,

    /// Advertised local name or the name the adapter resolved.
    pub name: Option<String>,

    /// Signal strength in dBm.
    pub rssi: Option<i16>,

    /// Manufacturer company identifier to raw manufacturer data.
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,

    /// Advertised service UUIDs.
    pub service_uuids: Vec<String>,

    /// UUIDs under which service data was advertised.
    pub service_data_keys: Vec<String>,

    /// Which scanner or adapter produced the sighting.
    pub source: Option<String>,
}

impl Sighting {
    /// Manufacturer company identifiers present in this advertisement.
    #[must_use]
    pub fn manufacturer_ids(&self) -> Vec<u16> {
        self.manufacturer_data.keys().copied().collect()
    }
}

/// One entry of a device's recent sighting history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SightingEvent {
    /// When the sighting was applied.
    #[serde(with = "timestamp")]
    pub time: DateTime<Utc>,

    /// Address the device used.
    pub address: Option<String>,

    /// Signal strength in dBm.
    pub rssi: Option<i16>,

    /// Scanner that reported it.
    pub source: Option<String>,
}

/// Bounded, oldest-first history of recent sightings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecentEvents(VecDeque<SightingEvent>);

impl RecentEvents {
    /// Append an event, evicting the oldest ones beyond `capacity`.
    pub fn push(&mut self, event: SightingEvent, capacity: usize) {
        self.0.push_back(event);
        while self.0.len() > capacity {
            self.0.pop_front();
        }
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no event has been retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SightingEvent> {
        self.0.iter()
    }

    /// The most recent event.
    #[must_use]
    pub fn latest(&self) -> Option<&SightingEvent> {
        self.0.back()
    }
}

/// Duplicate-free collection that remembers insertion order for display.
///
/// Deserializing a list with repeated entries keeps the first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SeenSet(IndexSet<String>);

impl SeenSet {
    /// Insert a value, returning `true` if it was not present yet.
    pub fn insert(&mut self, value: &str) -> bool {
        if self.0.contains(value) {
            return false;
        }
        self.0.insert(value.to_string())
    }

    /// Whether the value has been seen.
    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        self.0.contains(value)
    }

    /// Number of distinct values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for SeenSet {
    fn from(values: Vec<String>) -> Self {
        Self(values.into_iter().collect())
    }
}

impl From<SeenSet> for Vec<String> {
    fn from(set: SeenSet) -> Self {
        set.0.into_iter().collect()
    }
}

/// Everything known about one fingerprinted device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRecord {
    /// Fingerprint, also the key of this record in the registry.
    pub fp: String,

    /// Canonical inputs the fingerprint was derived from.
    pub fingerprint: FingerprintMaterial,

    /// Semantic tags from classification.
    pub tags: BTreeSet<String>,

    /// First tag produced by the rule table, or [`UNCLASSIFIED`].
    pub primary_tag: String,

    /// First sighting.
    #[serde(with = "timestamp")]
    pub first_seen: DateTime<Utc>,

    /// Most recent sighting.
    #[serde(with = "timestamp")]
    pub last_seen: DateTime<Utc>,

    /// Most recent sighting as epoch seconds; drives the leave timeout.
    pub last_seen_ts: f64,

    /// Number of sightings applied to this record.
    pub seen_count: u64,

    /// Every address the device has used.
    pub addresses: SeenSet,

    /// Every name the device has advertised.
    pub names_seen: SeenSet,

    /// Strongest signal ever observed.
    pub best_rssi: Option<i16>,

    /// Signal of the most recent sighting.
    pub last_rssi: Option<i16>,

    /// Bounded history of recent sightings.
    pub last_events: RecentEvents,

    /// Whether the device is currently considered in range.
    pub present: bool,

    /// Last transition to absent.
    #[serde(with = "timestamp::option")]
    pub last_left: Option<DateTime<Utc>>,

    /// Last transition to present.
    #[serde(with = "timestamp::option")]
    pub last_enter: Option<DateTime<Utc>>,

    /// Last transition to present as epoch seconds.
    pub last_enter_ts: Option<f64>,

    /// Last transition to absent as epoch seconds.
    pub last_left_ts: Option<f64>,

    /// Transitions to present.
    pub enter_count: u64,

    /// Transitions to absent.
    pub leave_count: u64,

    /// Transitions to present that followed an earlier leave.
    pub reenter_count: u64,

    /// Seconds present, keyed by the UTC day of the enter that started them.
    pub presence_by_day: BTreeMap<NaiveDate, f64>,
}

impl Default for DeviceRecord {
    fn default() -> Self {
        Self {
            fp: String::new(),
            fingerprint: FingerprintMaterial::default(),
            tags: BTreeSet::new(),
            primary_tag: UNCLASSIFIED.to_string(),
            first_seen: DateTime::<Utc>::UNIX_EPOCH,
            last_seen: DateTime::<Utc>::UNIX_EPOCH,
            last_seen_ts: 0.0,
            seen_count: 0,
            addresses: SeenSet::default(),
            names_seen: SeenSet::default(),
            best_rssi: None,
            last_rssi: None,
            last_events: RecentEvents::default(),
            present: false,
            last_left: None,
            last_enter: None,
            last_enter_ts: None,
            last_left_ts: None,
            enter_count: 0,
            leave_count: 0,
            reenter_count: 0,
            presence_by_day: BTreeMap::new(),
        }
    }
}

impl DeviceRecord {
    /// Total seconds present across all days.
    #[must_use]
    pub fn total_dwell_secs(&self) -> f64 {
        self.presence_by_day.values().sum()
    }
}

/// Registry-wide metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryMeta {
    /// When this registry was first created.
    #[serde(with = "timestamp")]
    pub created_utc: DateTime<Utc>,

    /// Last mutation.
    #[serde(with = "timestamp::option")]
    pub updated_utc: Option<DateTime<Utc>>,

    /// Adapter the daemon scanned with.
    pub adapter: Option<String>,

    /// Leave timeout in effect when the registry was last written.
    pub leave_timeout_sec: Option<u64>,
}

impl Default for RegistryMeta {
    fn default() -> Self {
        Self {
            created_utc: now_seconds(),
            updated_utc: None,
            adapter: None,
            leave_timeout_sec: None,
        }
    }
}

/// The persisted document: metadata plus fingerprint → record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registry {
    /// Registry-wide metadata.
    pub meta: RegistryMeta,

    /// Device records keyed by fingerprint.
    pub devices: BTreeMap<String, DeviceRecord>,
}

impl Registry {
    /// A fresh registry with no devices, created at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            meta: RegistryMeta {
                created_utc: now.trunc_subsecs(0),
                ..RegistryMeta::default()
            },
            devices: BTreeMap::new(),
        }
    }

    /// Number of devices currently present.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.devices.values().filter(|record| record.present).count()
    }
}

/// Current time truncated to whole seconds, the precision timestamps are stored at.
#[must_use]
pub fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Epoch seconds with millisecond precision.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

/// Inverse of [`epoch_seconds`], `None` when out of range.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
}

/// Serde helpers for UTC timestamps stored as `YYYY-MM-DDTHH:MM:SSZ`.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize at second precision.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    /// Deserialize any RFC 3339 timestamp into UTC.
    ///
    /// # Errors
    ///
    /// Fails on strings that are not RFC 3339.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|time| time.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    /// The same format for optional timestamps, `null` when absent.
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize `Some` at second precision, `None` as `null`.
        ///
        /// # Errors
        ///
        /// Propagates serializer errors.
        pub fn serialize<S>(time: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match time {
                Some(time) => super::serialize(time, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize `null` or an RFC 3339 timestamp.
        ///
        /// # Errors
        ///
        /// Fails on strings that are not RFC 3339.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|time| time.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}

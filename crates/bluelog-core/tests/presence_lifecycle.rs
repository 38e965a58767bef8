//! End-to-end presence lifecycle: sightings, sweep, flush, reload.

use std::sync::{Arc, Mutex};

use bluelog_core::{
    EnterPayload, Notify, PresenceTracker, RegistryStore, Sighting, TrackerConfig,
};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<EnterPayload>>>);

impl Notify for Captured {
    fn notify(&self, payload: EnterPayload) {
        self.0.lock().unwrap().push(payload);
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 3, 18, 30, 0).unwrap()
}

fn iphone(rssi: i16) -> Sighting {
    let mut sighting = Sighting {
        address: Some("5C:1A:2B:3C:4D:5E".into()),
        rssi: Some(rssi),
        source: Some("hci0".into()),
        ..Sighting::default()
    };
    sighting.manufacturer_data.insert(76, vec![0x10, 0x06, 0x1d, 0x1e]);
    sighting
}

#[test]
fn apple_device_enters_stays_and_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let store = RegistryStore::new(dir.path().join("bluelog.json"));
    let captured = Captured::default();
    let mut tracker = PresenceTracker::new(
        store.load(),
        TrackerConfig::default(),
        Box::new(captured.clone()),
    );

    let first = tracker.upsert(&iphone(-60), start());
    assert!(first.created);
    let record = tracker.device(&first.fp).unwrap();
    assert_eq!(record.primary_tag, "vendor:apple");
    assert!(record.present);
    assert_eq!(record.enter_count, 1);
    assert_eq!(record.reenter_count, 0);

    let second = tracker.upsert(&iphone(-55), start() + Duration::seconds(1));
    assert_eq!(second.fp, first.fp);
    let record = tracker.device(&first.fp).unwrap();
    assert_eq!(record.seen_count, 2);
    assert_eq!(record.best_rssi, Some(-55));
    assert!(record.present);
    assert_eq!(record.enter_count, 1);

    assert_eq!(tracker.sweep(start() + Duration::seconds(131)), 1);
    let record = tracker.device(&first.fp).unwrap();
    assert!(!record.present);
    assert_eq!(record.leave_count, 1);
    let day = NaiveDate::from_ymd_opt(2025, 6, 3).unwrap();
    assert!((record.presence_by_day[&day] - 131.0).abs() < 1e-6);

    let notifications = captured.0.lock().unwrap().clone();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].fp, first.fp);
    assert_eq!(notifications[0].primary_tag, "vendor:apple");

    store.save(tracker.registry()).unwrap();
    let reloaded = store.load();
    assert_eq!(&reloaded, tracker.registry());
}

#[test]
fn restart_resumes_counters_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = RegistryStore::new(dir.path().join("bluelog.json"));

    let mut tracker =
        PresenceTracker::new(store.load(), TrackerConfig::default(), Box::new(Captured::default()));
    let fp = tracker.upsert(&iphone(-70), start()).fp;
    tracker.sweep(start() + Duration::seconds(200));
    store.save(tracker.registry()).unwrap();
    drop(tracker);

    let captured = Captured::default();
    let mut tracker =
        PresenceTracker::new(store.load(), TrackerConfig::default(), Box::new(captured.clone()));
    let outcome = tracker.upsert(&iphone(-65), start() + Duration::hours(2));

    assert!(!outcome.created);
    assert!(outcome.entered);
    let record = tracker.device(&fp).unwrap();
    assert_eq!(record.enter_count, 2);
    assert_eq!(record.reenter_count, 1);
    assert_eq!(record.leave_count, 1);
    assert_eq!(record.seen_count, 2);
    assert_eq!(record.best_rssi, Some(-65));
    assert_eq!(captured.0.lock().unwrap().len(), 1);
}

#[test]
fn legacy_document_is_upgraded_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bluelog.json");
    std::fs::write(
        &path,
        r#"{
  "meta": {"created_utc": "2024-12-24T09:00:00Z"},
  "devices": {
    "ea096de977f0": {
      "fp": "ea096de977f0",
      "fingerprint": {"manufacturer_ids": [76], "service_uuids": [], "service_data_keys": []},
      "tags": ["vendor:apple"],
      "primary_tag": "vendor:apple",
      "first_seen": "2024-12-24T09:00:00Z",
      "last_seen": "2024-12-24T09:10:00Z",
      "seen_count": 12,
      "addresses": ["5C:1A:2B:3C:4D:5E"],
      "names_seen": [],
      "best_rssi": -48,
      "last_rssi": -61,
      "last_events": []
    }
  }
}"#,
    )
    .unwrap();

    let store = RegistryStore::new(&path);
    let mut tracker =
        PresenceTracker::new(store.load(), TrackerConfig::default(), Box::new(Captured::default()));
    assert!(tracker.is_dirty());

    let outcome = tracker.upsert(&iphone(-50), start());
    assert_eq!(outcome.fp, "ea096de977f0");
    assert!(!outcome.created);
    assert!(outcome.entered);

    let record = tracker.device("ea096de977f0").unwrap();
    assert_eq!(record.seen_count, 13);
    assert_eq!(record.best_rssi, Some(-48));
    assert_eq!(record.enter_count, 1);
    assert_eq!(record.reenter_count, 0);

    store.save(tracker.registry()).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"presence_by_day\""));
    assert!(text.contains("\"leave_timeout_sec\": 120"));
}

//! Enter notifications.
//!
//! When a device transitions to present and passes the qualification policy,
//! the tracker hands an [`EnterPayload`] to a [`Notify`] implementation.
//! Delivery is fire-and-forget: [`WebhookNotifier`] queues the payload for a
//! worker task which POSTs it with a bounded timeout and drops any failure.
//! Nothing is retried and the tracker never learns the outcome.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use url::Url;

use crate::config::normalize_name;
use crate::types::{timestamp, DeviceRecord, Sighting, UNCLASSIFIED};

/// Payloads waiting for the worker before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Errors setting up a notifier.
#[derive(Debug, Error)]
pub enum NotifierError {
    /// The webhook URL could not be parsed.
    #[error("Invalid webhook URL '{url}': {source}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Parse failure.
        source: url::ParseError,
    },

    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),
}

/// Kind of presence event being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
    /// The device transitioned to present.
    Enter,
}

/// JSON body sent for a qualifying enter transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnterPayload {
    /// Always [`PresenceEvent::Enter`].
    pub event: PresenceEvent,
    /// Device fingerprint.
    pub fp: String,
    /// Name from the triggering sighting.
    pub name: Option<String>,
    /// Address from the triggering sighting.
    pub address: Option<String>,
    /// Signal of the triggering sighting.
    pub rssi: Option<i16>,
    /// Strongest signal seen so far.
    pub best_rssi: Option<i16>,
    /// Sightings so far, including the triggering one.
    pub seen_count: u64,
    /// Primary classification tag.
    pub primary_tag: String,
    /// All classification tags.
    pub tags: Vec<String>,
    /// Previous leave, if the device has left before.
    #[serde(with = "timestamp::option")]
    pub last_left: Option<DateTime<Utc>>,
    /// This enter.
    #[serde(with = "timestamp::option")]
    pub last_enter: Option<DateTime<Utc>>,
    /// Fingerprint material.
    pub manufacturer_ids: Vec<u16>,
    /// Fingerprint material.
    pub service_uuids: Vec<String>,
    /// Fingerprint material.
    pub service_data_keys: Vec<String>,
}

impl EnterPayload {
    /// Build the payload from the updated record and the sighting that caused the enter.
    #[must_use]
    pub fn new(record: &DeviceRecord, sighting: &Sighting) -> Self {
        Self {
            event: PresenceEvent::Enter,
            fp: record.fp.clone(),
            name: sighting.name.clone(),
            address: sighting.address.clone(),
            rssi: sighting.rssi,
            best_rssi: record.best_rssi,
            seen_count: record.seen_count,
            primary_tag: record.primary_tag.clone(),
            tags: record.tags.iter().cloned().collect(),
            last_left: record.last_left,
            last_enter: record.last_enter,
            manufacturer_ids: record.fingerprint.manufacturer_ids.clone(),
            service_uuids: record.fingerprint.service_uuids.clone(),
            service_data_keys: record.fingerprint.service_data_keys.clone(),
        }
    }
}

/// Whether an enter transition should be notified.
///
/// Suppressed names never qualify. Otherwise the device needs either a
/// non-blank name or a classification. `suppressed` must hold normalized
/// names (see [`normalize_name`]).
#[must_use]
pub fn qualifies(name: Option<&str>, primary_tag: &str, suppressed: &HashSet<String>) -> bool {
    let normalized = normalize_name(name.unwrap_or_default());
    if suppressed.contains(&normalized) {
        return false;
    }
    !normalized.is_empty() || primary_tag != UNCLASSIFIED
}

/// Sink for enter notifications.
///
/// Implementations must return immediately and must not fail; delivery
/// happens elsewhere, if at all.
pub trait Notify: Send + Sync {
    /// Hand off a payload for best-effort delivery.
    fn notify(&self, payload: EnterPayload);
}

/// Discards every notification. Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notify for NoopNotifier {
    fn notify(&self, payload: EnterPayload) {
        trace!(fp = %payload.fp, "Notifications disabled, dropping enter event");
    }
}

/// POSTs payloads as JSON to a webhook from a background worker.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    tx: mpsc::Sender<EnterPayload>,
}

impl WebhookNotifier {
    /// Start the delivery worker on the current Tokio runtime.
    ///
    /// The worker ends once every `WebhookNotifier` clone has been dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn spawn(
        url: &str,
        timeout: Duration,
        queue_capacity: usize,
    ) -> Result<(Self, JoinHandle<()>), NotifierError> {
        let url = Url::parse(url).map_err(|source| NotifierError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));

        let handle = tokio::spawn(run_worker(client, url, rx));
        Ok((Self { tx }, handle))
    }
}

impl Notify for WebhookNotifier {
    fn notify(&self, payload: EnterPayload) {
        if let Err(e) = self.tx.try_send(payload) {
            debug!(error = %e, "Notification queue unavailable, dropping enter event");
        }
    }
}

async fn run_worker(client: reqwest::Client, url: Url, mut rx: mpsc::Receiver<EnterPayload>) {
    while let Some(payload) = rx.recv().await {
        tokio::spawn(post(client.clone(), url.clone(), payload));
    }
    debug!("Notification worker stopped");
}

async fn post(client: reqwest::Client, url: Url, payload: EnterPayload) {
    match client.post(url).json(&payload).send().await {
        Ok(response) => {
            let status = response.status();
            // The body is never used, only drained.
            let _ = response.bytes().await;
            debug!(fp = %payload.fp, %status, "Enter notification delivered");
        }
        Err(e) => debug!(fp = %payload.fp, error = %e, "Enter notification failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn suppressed(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| normalize_name(n)).collect()
    }

    fn payload() -> EnterPayload {
        let fp = fingerprint::compute([76], [""; 0], [""; 0]);
        let record = DeviceRecord {
            fp: fp.id,
            fingerprint: fp.material,
            primary_tag: "vendor:apple".into(),
            seen_count: 1,
            best_rssi: Some(-60),
            ..DeviceRecord::default()
        };
        let sighting = Sighting {
            address: Some("4A:11:22:33:44:55".into()),
            rssi: Some(-60),
            ..Sighting::default()
        };
        EnterPayload::new(&record, &sighting)
    }

    #[test]
    fn test_named_device_qualifies() {
        assert!(qualifies(Some("Pixel 8"), UNCLASSIFIED, &HashSet::new()));
    }

    #[test]
    fn test_classified_device_without_name_qualifies() {
        assert!(qualifies(None, "vendor:apple", &HashSet::new()));
        assert!(qualifies(Some("   "), "beacon:eddystone", &HashSet::new()));
    }

    #[test]
    fn test_anonymous_unclassified_device_does_not_qualify() {
        assert!(!qualifies(None, UNCLASSIFIED, &HashSet::new()));
        assert!(!qualifies(Some("  "), UNCLASSIFIED, &HashSet::new()));
    }

    #[test]
    fn test_suppression_wins_over_tags() {
        let names = suppressed(&["My iPhone"]);
        assert!(!qualifies(Some("  MY IPHONE "), "vendor:apple", &names));
        assert!(qualifies(Some("My iPhone 2"), "vendor:apple", &names));
    }

    #[test]
    fn test_payload_json_shape() {
        let json = serde_json::to_value(payload()).unwrap();
        assert_eq!(json["event"], "enter");
        assert_eq!(json["fp"], "ea096de977f0");
        assert_eq!(json["primary_tag"], "vendor:apple");
        assert_eq!(json["manufacturer_ids"], serde_json::json!([76]));
        assert!(json["name"].is_null());
        assert!(json["last_left"].is_null());
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        assert!(matches!(
            WebhookNotifier::spawn("no scheme", Duration::from_secs(1), 4),
            Err(NotifierError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            while !String::from_utf8_lossy(&received).contains("\"service_data_keys\"") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&received).to_string()
        });

        let (notifier, _worker) = WebhookNotifier::spawn(
            &format!("http://{addr}/api/webhook/ble_new_device"),
            Duration::from_secs(3),
            DEFAULT_QUEUE_CAPACITY,
        )
        .unwrap();
        notifier.notify(payload());

        let request = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(request.starts_with("POST /api/webhook/ble_new_device"));
        assert!(request.to_lowercase().contains("content-type: application/json"));
        assert!(request.contains("\"event\":\"enter\""));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_silent() {
        // Port 9 (discard) is closed on test machines; the failure must stay inside the worker.
        let (notifier, worker) =
            WebhookNotifier::spawn("http://127.0.0.1:9/hook", Duration::from_millis(200), 4)
                .unwrap();
        notifier.notify(payload());
        drop(notifier);

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_noop_notifier_accepts_payloads() {
        NoopNotifier.notify(payload());
    }
}

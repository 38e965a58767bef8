//! Sighting sources feeding the scheduler.
//!
//! A source runs as its own task and only sends owned [`Sighting`] values
//! over the bounded channel. Dropping the sender when the source ends tells
//! the scheduler to shut down.

use std::path::Path;

use bluelog_core::Sighting;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the channel between a source and the scheduler.
pub const CHANNEL_CAPACITY: usize = 256;

/// Errors that stop a source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Reading the replay input failed.
    #[error("Failed to read sightings: {0}")]
    Io(#[from] std::io::Error),

    /// BlueZ rejected a request.
    #[cfg(feature = "bluetooth")]
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),

    /// The binary was built without scanning support.
    #[error("Live scanning is not available in this build, use --replay")]
    Unsupported,
}

/// Parse one replay line.
///
/// Blank lines and lines starting with `#` yield `Ok(None)`.
///
/// # Errors
///
/// Returns the JSON error for a malformed line.
pub fn parse_sighting_line(line: &str) -> Result<Option<Sighting>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Replay sightings from a JSON-lines file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn replay_file(
    path: &Path,
    tx: mpsc::Sender<Sighting>,
    cancel: CancellationToken,
) -> Result<u64, SourceError> {
    let file = tokio::fs::File::open(path).await?;
    info!(path = %path.display(), "Replaying sightings");
    replay(BufReader::new(file), tx, cancel).await
}

/// Replay sightings from standard input.
///
/// # Errors
///
/// Returns an error if standard input cannot be read.
pub async fn replay_stdin(
    tx: mpsc::Sender<Sighting>,
    cancel: CancellationToken,
) -> Result<u64, SourceError> {
    info!("Replaying sightings from stdin");
    replay(BufReader::new(tokio::io::stdin()), tx, cancel).await
}

/// Send every valid line of `reader` as a sighting.
///
/// Malformed lines are logged and skipped. Returns the number of sightings
/// sent; stops early if cancelled or if the receiver is gone.
///
/// # Errors
///
/// Returns an error if reading fails.
pub async fn replay<R>(
    reader: R,
    tx: mpsc::Sender<Sighting>,
    cancel: CancellationToken,
) -> Result<u64, SourceError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0u64;
    let mut sent = 0u64;

    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        line_no += 1;

        let sighting = match parse_sighting_line(&line) {
            Ok(Some(sighting)) => sighting,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed sighting");
                continue;
            }
        };
        if tx.send(sighting).await.is_err() {
            debug!("Scheduler gone, stopping replay");
            break;
        }
        sent += 1;
    }

    info!(lines = line_no, sent, "Replay finished");
    Ok(sent)
}

/// Stream live advertisements from a BlueZ adapter.
///
/// # Errors
///
/// Returns an error if the adapter cannot be powered or discovery cannot
/// start. Failures reading a single device are logged and skipped.
#[cfg(feature = "bluetooth")]
pub async fn scan(
    adapter_name: &str,
    tx: mpsc::Sender<Sighting>,
    cancel: CancellationToken,
) -> Result<(), SourceError> {
    use bluer::{AdapterEvent, DiscoveryFilter, DiscoveryTransport};
    use futures::{pin_mut, StreamExt};

    let session = bluer::Session::new().await?;
    let adapter = session.adapter(adapter_name)?;
    adapter.set_powered(true).await?;
    adapter
        .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..DiscoveryFilter::default()
        })
        .await?;

    let events = adapter.discover_devices_with_changes().await?;
    pin_mut!(events);
    info!(adapter = %adapter_name, "Discovery started");

    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else {
            warn!(adapter = %adapter_name, "Discovery stream ended");
            break;
        };
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };

        let sighting = match read_device(&adapter, address).await {
            Ok(sighting) => sighting,
            Err(e) => {
                debug!(%address, error = %e, "Skipping device");
                continue;
            }
        };
        if tx.send(sighting).await.is_err() {
            break;
        }
    }

    info!(adapter = %adapter_name, "Discovery stopped");
    Ok(())
}

#[cfg(feature = "bluetooth")]
async fn read_device(adapter: &bluer::Adapter, address: bluer::Address) -> bluer::Result<Sighting> {
    let device = adapter.device(address)?;

    let mut service_uuids: Vec<String> = device
        .uuids()
        .await?
        .unwrap_or_default()
        .iter()
        .map(ToString::to_string)
        .collect();
    service_uuids.sort();

    let mut service_data_keys: Vec<String> = device
        .service_data()
        .await?
        .unwrap_or_default()
        .keys()
        .map(ToString::to_string)
        .collect();
    service_data_keys.sort();

    Ok(Sighting {
        address: Some(address.to_string()),
        name: device.name().await?,
        rssi: device.rssi().await?,
        manufacturer_data: device
            .manufacturer_data()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect(),
        service_uuids,
        service_data_keys,
        source: Some(adapter.name().to_string()),
    })
}

/// Stand-in used when the crate is built without the `bluetooth` feature.
///
/// # Errors
///
/// Always returns [`SourceError::Unsupported`].
#[cfg(not(feature = "bluetooth"))]
pub async fn scan(
    _adapter_name: &str,
    _tx: mpsc::Sender<Sighting>,
    _cancel: CancellationToken,
) -> Result<(), SourceError> {
    Err(SourceError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPTURE: &str = r#"
# captured on hci0
{"address":"5C:1A:2B:3C:4D:5E","rssi":-60,"manufacturer_data":{"76":[16,5]}}

{"address":"C3:00:00:00:00:01","name":"Tag","service_uuids":["0000feaa-0000-1000-8000-00805f9b34fb"]}
not json at all
{"rssi":"loud"}
{}
"#;

    #[test]
    fn test_parse_skips_blank_and_comment_lines() {
        assert!(parse_sighting_line("").unwrap().is_none());
        assert!(parse_sighting_line("   ").unwrap().is_none());
        assert!(parse_sighting_line("# note").unwrap().is_none());
    }

    #[test]
    fn test_parse_fills_missing_fields() {
        let sighting = parse_sighting_line(r#"{"name":"Pixel 8","rssi":-71}"#)
            .unwrap()
            .unwrap();
        assert_eq!(sighting.name.as_deref(), Some("Pixel 8"));
        assert_eq!(sighting.rssi, Some(-71));
        assert!(sighting.address.is_none());
        assert!(sighting.manufacturer_data.is_empty());
        assert!(sighting.service_uuids.is_empty());
    }

    #[test]
    fn test_parse_manufacturer_data_keys() {
        let sighting = parse_sighting_line(r#"{"manufacturer_data":{"76":[1],"6":[2,3]}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(sighting.manufacturer_ids(), vec![6, 76]);
    }

    #[test]
    fn test_parse_rejects_malformed_line() {
        assert!(parse_sighting_line("{").is_err());
        assert!(parse_sighting_line(r#"{"rssi":"loud"}"#).is_err());
    }

    #[tokio::test]
    async fn test_replay_sends_valid_lines_and_closes() {
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let sent = replay(CAPTURE.as_bytes(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sent, 3);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.manufacturer_ids(), vec![76]);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.name.as_deref(), Some("Tag"));
        let third = rx.recv().await.unwrap();
        assert_eq!(third, Sighting::default());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_replay_stops_when_cancelled() {
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let sent = replay(CAPTURE.as_bytes(), tx, cancel).await.unwrap();
        assert_eq!(sent, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_replay_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sent = replay(CAPTURE.as_bytes(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_replay_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        std::fs::write(&path, CAPTURE).unwrap();

        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let sent = replay_file(&path, tx, CancellationToken::new()).await.unwrap();
        assert_eq!(sent, 3);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_replay_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let err = replay_file(&dir.path().join("nope.jsonl"), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Io(_)));
    }
}

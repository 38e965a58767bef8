//! # bluelog
//!
//! Logs BLE visitors: fingerprints advertising devices, tracks when they come
//! and go, and persists the registry as a JSON document.
//!
//! ## Running
//!
//! ```bash
//! # Live scanning (Linux, BlueZ)
//! bluelog --config /etc/bluelog/config.toml
//!
//! # Replay a capture without a radio
//! bluelog --replay capture.jsonl
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::Context;
use bluelog_core::notifier::DEFAULT_QUEUE_CAPACITY;
use bluelog_core::{
    BluelogConfig, NoopNotifier, Notify, PresenceTracker, RegistryStore, Scheduler,
    TrackerConfig, WebhookNotifier,
};
use bluelog_daemon::cli::{Cli, SourceKind};
use bluelog_daemon::{logging, signal, source};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = BluelogConfig::load(cli.config.as_deref()).context("Invalid configuration")?;

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    logging::init(cli.production)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting bluelog");

    if let Err(e) = run(&cli, &config).await {
        error!(error = %format!("{e:#}"), "bluelog stopped with an error");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: &Cli, config: &BluelogConfig) -> anyhow::Result<()> {
    let store = RegistryStore::new(&config.registry_path);
    let registry = store.load();
    info!(
        path = %store.path().display(),
        devices = registry.devices.len(),
        "Registry loaded"
    );

    let tracker = PresenceTracker::new(registry, TrackerConfig::from(config), notifier(config));
    let scheduler = Scheduler::new(tracker, store, config.flush_interval());

    let cancel = CancellationToken::new();
    tokio::spawn(signal::cancel_on_signal(cancel.clone()));

    let (tx, rx) = mpsc::channel(source::CHANNEL_CAPACITY);
    let source_cancel = cancel.clone();
    let source_kind = cli.source();
    let adapter = config.adapter.clone();
    let source_task = tokio::spawn(async move {
        let result = match source_kind {
            SourceKind::Scanner => source::scan(&adapter, tx, source_cancel.clone()).await,
            SourceKind::File(path) => source::replay_file(&path, tx, source_cancel.clone())
                .await
                .map(drop),
            SourceKind::Stdin => source::replay_stdin(tx, source_cancel.clone()).await.map(drop),
        };
        if result.is_err() {
            // The scheduler would otherwise wait for a signal that never comes.
            source_cancel.cancel();
        }
        result
    });

    let registry = scheduler.run(rx, cancel.clone()).await?;
    cancel.cancel();
    info!(
        devices = registry.devices.len(),
        present = registry.present_count(),
        "Registry saved"
    );

    source_task
        .await
        .context("Sighting source panicked")?
        .context("Sighting source failed")?;
    Ok(())
}

fn notifier(config: &BluelogConfig) -> Box<dyn Notify> {
    let Some(url) = config.webhook_url.as_deref() else {
        info!("No webhook configured, enter notifications disabled");
        return Box::new(NoopNotifier);
    };

    match WebhookNotifier::spawn(url, config.webhook_timeout(), DEFAULT_QUEUE_CAPACITY) {
        Ok((notifier, _worker)) => {
            info!(url, "Enter notifications enabled");
            Box::new(notifier)
        }
        Err(e) => {
            warn!(error = %e, "Webhook unavailable, enter notifications disabled");
            Box::new(NoopNotifier)
        }
    }
}

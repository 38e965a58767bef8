//! # bluelog-core
//!
//! Core logic for bluelog, a BLE visitor log that keys devices by what they
//! advertise instead of by their (often rotating) address.
//!
//! This crate provides:
//! - Content fingerprints derived from manufacturer ids, service UUIDs and
//!   service-data keys
//! - Vendor and beacon classification
//! - A presence state machine with a staleness timeout and daily dwell time
//! - Fire-and-forget webhook notifications on qualifying enters
//! - Crash-safe persistence of the whole registry as one JSON document
//!
//! ## Architecture
//!
//! - [`fingerprint`] - Canonicalization and hashing of advertisement metadata
//! - [`classify`] - Rule table mapping identifiers to tags
//! - [`storage`] - Load-with-recovery and atomic replace of the registry file
//! - [`tracker`] - Upsert and sweep over the in-memory registry
//! - [`notifier`] - Qualification policy and webhook dispatch
//! - [`scheduler`] - Control loop tying sightings, sweeps and flushes together
//! - [`config`] - Layered configuration loading and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - The registry document and sighting types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod classify;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod notifier;
pub mod scheduler;
pub mod storage;
pub mod tracker;
pub mod types;

// Re-export primary types for convenience
pub use classify::{classify, Classification};
pub use crate::config::{BluelogConfig, ConfigError, ConfigResult};
pub use error::{BluelogError, Result};
pub use fingerprint::{Fingerprint, FingerprintMaterial};
pub use notifier::{EnterPayload, NoopNotifier, Notify, NotifierError, WebhookNotifier};
pub use scheduler::Scheduler;
pub use storage::{RegistryStore, StorageError};
pub use tracker::{PresenceTracker, TrackerConfig, UpsertOutcome};
pub use types::{DeviceRecord, Registry, RegistryMeta, Sighting, UNCLASSIFIED};

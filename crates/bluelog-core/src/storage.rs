//! Persistent storage for the device registry.
//!
//! The whole registry lives in one JSON document that is always replaced
//! atomically: the new content is written to a sibling `.tmp` file, synced to
//! disk and renamed over the target. A reader (or a restarted daemon) sees
//! either the previous document or the new one, never a torn write.
//!
//! Keys are written in sorted order so two flushes of unchanged state are
//! byte-identical.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{now_seconds, DeviceRecord, Registry, RegistryMeta};

/// Errors that can occur while reading or writing the registry.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The registry file exists but could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The registry file is not valid JSON.
    #[error("Failed to parse {}: {source}", path.display())]
    ParseError {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The file holds valid JSON that is not an object.
    #[error("{} does not hold a registry document", path.display())]
    NotADocument {
        /// File that failed.
        path: PathBuf,
    },

    /// The registry could not be serialized.
    #[error("Failed to serialize registry: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// The parent directory could not be created.
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDirError {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Writing, syncing or renaming the document failed.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage backend for the registry document.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    /// Create a store for the document at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the registry document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry, substituting a fresh one when it is unusable.
    ///
    /// Never fails: a missing, empty or corrupt document yields an empty
    /// registry stamped with the current time.
    #[must_use]
    pub fn load(&self) -> Registry {
        load_registry(&self.path)
    }

    /// Load the registry, reporting why it could not be used.
    ///
    /// Returns `Ok(None)` when the document is missing or blank.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or is not a registry document.
    pub fn try_load(&self) -> StorageResult<Option<Registry>> {
        try_load_registry(&self.path)
    }

    /// Atomically replace the document with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any step of the write fails. The previous document
    /// is left untouched in that case.
    pub fn save(&self, registry: &Registry) -> StorageResult<()> {
        atomic_write(&self.path, registry)
    }
}

/// Load the registry at `path`, recovering to an empty one on any problem.
#[must_use]
pub fn load_registry(path: &Path) -> Registry {
    match try_load_registry(path) {
        Ok(Some(registry)) => {
            debug!(
                path = %path.display(),
                devices = registry.devices.len(),
                "Loaded registry"
            );
            registry
        }
        Ok(None) => {
            debug!(path = %path.display(), "No registry yet, starting empty");
            Registry::new(now_seconds())
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Registry unusable, starting empty");
            Registry::new(now_seconds())
        }
    }
}

/// Read and parse the registry at `path`.
///
/// Only unparseable JSON or a top level that is not an object is rejected.
/// Inside a document, malformed fields are reset to their defaults and
/// records that are not objects are skipped, so one damaged entry never
/// costs the rest of the registry.
///
/// # Errors
///
/// Returns an error when the file cannot be read, is not JSON, or is JSON
/// that is not an object.
pub fn try_load_registry(path: &Path) -> StorageResult<Option<Registry>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StorageError::ReadError {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if content.trim().is_empty() {
        return Ok(None);
    }

    let document: Value =
        serde_json::from_str(&content).map_err(|source| StorageError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
    let Value::Object(mut document) = document else {
        return Err(StorageError::NotADocument {
            path: path.to_path_buf(),
        });
    };

    let meta = match document.remove("meta") {
        Some(meta) => decode_repairing::<RegistryMeta>(&meta, "meta").unwrap_or_else(|| {
            warn!(path = %path.display(), "Registry metadata unusable, using defaults");
            RegistryMeta::default()
        }),
        None => RegistryMeta::default(),
    };

    let mut devices = BTreeMap::new();
    match document.remove("devices") {
        Some(Value::Object(entries)) => {
            for (fp, entry) in entries {
                let Some(mut record) = decode_repairing::<DeviceRecord>(&entry, &fp) else {
                    warn!(path = %path.display(), fp = %fp, "Skipping unreadable device record");
                    continue;
                };
                if record.fp.is_empty() {
                    record.fp.clone_from(&fp);
                }
                devices.insert(fp, record);
            }
        }
        Some(Value::Null) | None => {}
        Some(_) => warn!(path = %path.display(), "Registry devices are not an object, ignoring them"),
    }

    Ok(Some(Registry { meta, devices }))
}

/// Decode an object, dropping fields that do not fit the schema.
///
/// Dropped fields fall back to their defaults, so one bad value costs that
/// value and not the record. Returns `None` for anything but an object.
fn decode_repairing<T: DeserializeOwned>(value: &Value, what: &str) -> Option<T> {
    let Value::Object(fields) = value else {
        return None;
    };
    if let Ok(decoded) = T::deserialize(value) {
        return Some(decoded);
    }

    let mut kept = Map::new();
    for (key, field) in fields {
        let single = Value::Object(Map::from_iter([(key.clone(), field.clone())]));
        if T::deserialize(&single).is_ok() {
            kept.insert(key.clone(), field.clone());
        } else {
            warn!(record = %what, field = %key, "Resetting malformed field to its default");
        }
    }
    T::deserialize(&Value::Object(kept)).ok()
}

/// Serialize `registry` deterministically and replace the file at `path`.
///
/// # Errors
///
/// Returns an error if serialization, directory creation, writing, syncing
/// or renaming fails.
pub fn atomic_write(path: &Path, registry: &Registry) -> StorageResult<()> {
    let mut content = serde_json::to_vec_pretty(&sorted(serde_json::to_value(registry)?))?;
    content.push(b'\n');

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let tmp_path = tmp_path(path);
    let write_err = |source| StorageError::WriteError {
        path: tmp_path.clone(),
        source,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(write_err)?;
    file.write_all(&content).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|source| StorageError::WriteError {
        path: path.to_path_buf(),
        source,
    })?;

    sync_parent(path);
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Make the rename itself durable. Best effort; not every platform allows it.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if let Err(e) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(path = %parent.display(), error = %e, "Could not sync registry directory");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Rebuild every object with its keys in sorted order.
fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sorted(value)))
                    .collect::<Map<_, _>>(),
            )
        }
        Value::Array(values) => Value::Array(values.into_iter().map(sorted).collect()),
        other => other,
    }
}

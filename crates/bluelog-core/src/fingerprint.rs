//! Content fingerprints for BLE devices.
//!
//! Devices are keyed by what they advertise rather than by their address,
//! which rotates on most phones. The fingerprint is the first 12 hex
//! characters of the SHA-1 of a canonical string built from the sorted,
//! deduplicated manufacturer ids, service UUIDs and service-data keys:
//!
//! ```text
//! mfg=6,76|svc=0000feaa-...|sdk=0000fe9f-...
//! ```
//!
//! A device advertising none of the three collapses into the fingerprint of
//! the empty signature. All such anonymous devices share one record.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::types::Sighting;

/// Number of hex characters kept from the digest.
pub const FINGERPRINT_LEN: usize = 12;

/// The canonical inputs a fingerprint was derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintMaterial {
    /// Sorted, distinct manufacturer company identifiers.
    pub manufacturer_ids: Vec<u16>,

    /// Sorted, distinct service UUIDs.
    pub service_uuids: Vec<String>,

    /// Sorted, distinct service-data UUIDs.
    pub service_data_keys: Vec<String>,
}

impl FingerprintMaterial {
    /// Canonicalize raw advertisement fields.
    pub fn new<M, S, K>(manufacturer_ids: M, service_uuids: S, service_data_keys: K) -> Self
    where
        M: IntoIterator<Item = u16>,
        S: IntoIterator,
        S::Item: AsRef<str>,
        K: IntoIterator,
        K::Item: AsRef<str>,
    {
        Self {
            manufacturer_ids: manufacturer_ids
                .into_iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            service_uuids: sorted_distinct(service_uuids),
            service_data_keys: sorted_distinct(service_data_keys),
        }
    }

    /// Whether the device advertised nothing to fingerprint on.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.manufacturer_ids.is_empty()
            && self.service_uuids.is_empty()
            && self.service_data_keys.is_empty()
    }

    /// The string that is hashed.
    #[must_use]
    pub fn canonical(&self) -> String {
        let mfg = self
            .manufacturer_ids
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "mfg={mfg}|svc={}|sdk={}",
            self.service_uuids.join(","),
            self.service_data_keys.join(",")
        )
    }
}

fn sorted_distinct<I>(values: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    values
        .into_iter()
        .map(|value| value.as_ref().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// A device fingerprint together with the material it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// The short identifier used as registry key.
    pub id: String,

    /// Canonical inputs, kept on the record for auditing.
    pub material: FingerprintMaterial,
}

impl Fingerprint {
    /// Derive the fingerprint of already canonical material.
    #[must_use]
    pub fn from_material(material: FingerprintMaterial) -> Self {
        let digest = Sha1::digest(material.canonical().as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(FINGERPRINT_LEN);
        Self { id, material }
    }

    /// Fingerprint of a sighting's manufacturer ids, service UUIDs and service-data keys.
    #[must_use]
    pub fn of(sighting: &Sighting) -> Self {
        compute(
            sighting.manufacturer_data.keys().copied(),
            &sighting.service_uuids,
            &sighting.service_data_keys,
        )
    }
}

/// Compute a fingerprint from raw advertisement fields.
///
/// Order and duplicates in the inputs never affect the result.
pub fn compute<M, S, K>(manufacturer_ids: M, service_uuids: S, service_data_keys: K) -> Fingerprint
where
    M: IntoIterator<Item = u16>,
    S: IntoIterator,
    S::Item: AsRef<str>,
    K: IntoIterator,
    K::Item: AsRef<str>,
{
    Fingerprint::from_material(FingerprintMaterial::new(
        manufacturer_ids,
        service_uuids,
        service_data_keys,
    ))
}

//! Checksums and snapshots over component state.
//!
//! A checksum is a BLAKE3 digest of the canonical JSON form of a state map:
//! transient keys (prefixed with `_` or `$`) are dropped at every nesting
//! level and object keys are sorted. With a server secret the digest is keyed,
//! so clients cannot forge a snapshot that verifies.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::protocol::StateMap;
use crate::{RlcError, RlcResult};

/// Key prefixes marking fields that never take part in a checksum
pub const TRANSIENT_PREFIXES: [&str; 2] = ["_", "$"];

const CHECKSUM_KEY_CONTEXT: &str = "rlc 2024 component state checksum";
const FINGERPRINT_LEN: usize = 16;

/// An immutable, timestamped, checksummed copy of a component's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub data: StateMap,
    pub checksum: String,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Whether a key is transient and excluded from checksums
pub fn is_transient_key(key: &str) -> bool {
    TRANSIENT_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
}

/// Canonical form of a state map: transient keys removed, keys sorted
pub fn canonicalize(state: &StateMap) -> JsonValue {
    canonical_object(state, true)
}

/// Serialize a JSON value with object keys sorted at every level
///
/// Unlike [`canonicalize`] nothing is dropped. The output does not depend on
/// the insertion order of the source maps.
pub fn canonical_json(value: &JsonValue) -> String {
    canonical_value(value, false).to_string()
}

fn canonical_object(map: &serde_json::Map<String, JsonValue>, drop_transient: bool) -> JsonValue {
    let sorted: BTreeMap<&String, JsonValue> = map
        .iter()
        .filter(|(key, _)| !(drop_transient && is_transient_key(key)))
        .map(|(key, value)| (key, canonical_value(value, drop_transient)))
        .collect();

    JsonValue::Object(
        sorted
            .into_iter()
            .map(|(key, value)| (key.clone(), value))
            .collect(),
    )
}

fn canonical_value(value: &JsonValue, drop_transient: bool) -> JsonValue {
    match value {
        JsonValue::Object(map) => canonical_object(map, drop_transient),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| canonical_value(item, drop_transient))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn hasher_for(secret: Option<&str>) -> blake3::Hasher {
    match secret {
        Some(secret) => {
            let key = blake3::derive_key(CHECKSUM_KEY_CONTEXT, secret.as_bytes());
            blake3::Hasher::new_keyed(&key)
        }
        None => blake3::Hasher::new(),
    }
}

fn checksum_hash(state: &StateMap, secret: Option<&str>) -> blake3::Hash {
    let canonical = canonicalize(state).to_string();
    let mut hasher = hasher_for(secret);
    hasher.update(canonical.as_bytes());
    hasher.finalize()
}

/// Compute the hex checksum of a state map
pub fn compute_checksum(state: &StateMap, secret: Option<&str>) -> String {
    checksum_hash(state, secret).to_hex().to_string()
}

/// Capture a snapshot of `state` taken at `timestamp_ms`
pub fn create_snapshot(state: &StateMap, secret: Option<&str>, timestamp_ms: i64) -> StateSnapshot {
    StateSnapshot {
        data: state.clone(),
        checksum: compute_checksum(state, secret),
        timestamp: timestamp_ms,
    }
}

/// Check a snapshot's age and checksum
///
/// Both checks are independent and either failing rejects the snapshot. A
/// timestamp in the future counts as age zero.
pub fn verify_snapshot(
    snapshot: &StateSnapshot,
    max_age_ms: i64,
    secret: Option<&str>,
    now_ms: i64,
) -> RlcResult<()> {
    let age_ms = now_ms.saturating_sub(snapshot.timestamp).max(0);
    if age_ms > max_age_ms {
        return Err(RlcError::SnapshotExpired { age_ms, max_age_ms });
    }

    let actual = checksum_hash(&snapshot.data, secret);
    // blake3::Hash equality is constant time
    let matches = blake3::Hash::from_hex(snapshot.checksum.as_bytes())
        .map(|expected| expected == actual)
        .unwrap_or(false);

    if !matches {
        return Err(RlcError::ChecksumMismatch {
            expected: snapshot.checksum.clone(),
            actual: actual.to_hex().to_string(),
        });
    }

    Ok(())
}

/// Short stable digest used as a cache or debug key
///
/// Not a security boundary.
pub fn fingerprint(component_type: &str, component_id: &str, props: &JsonValue) -> String {
    let props = canonical_json(props);
    let mut hasher = blake3::Hasher::new();
    hasher.update(component_type.as_bytes());
    hasher.update(b"\0");
    hasher.update(component_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(props.as_bytes());

    let mut hex = hasher.finalize().to_hex().to_string();
    hex.truncate(FINGERPRINT_LEN);
    hex
}

//! Stable fingerprints for status snapshots and step reports.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Keys whose values change with wall-clock time and never affect a digest.
pub const VOLATILE_KEYS: &[&str] = &["elapsed", "start_time", "end_time", "timestamp", "serial_time"];

/// Prefix marking hashes that must never compare equal to another hash.
pub const FORCED_PREFIX: &str = "forced-";

/// Full hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// First 16 hex chars of the SHA-256 of `input`, used for identities.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Remove volatile keys at every depth.
pub fn strip_volatile(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !VOLATILE_KEYS.contains(&key.as_str()));
            for child in map.values_mut() {
                strip_volatile(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_volatile(item);
            }
        }
        _ => {}
    }
}

/// Digest of `value` with volatile keys excluded.
pub fn digest(value: &Value) -> String {
    let mut stable = value.clone();
    strip_volatile(&mut stable);
    sha256_hex(stable.to_string().as_bytes())
}

pub fn forced_hash(nanos: u128, counter: u64) -> String {
    format!("{FORCED_PREFIX}{nanos}-{counter}")
}

pub fn is_forced(hash: &str) -> bool {
    hash.starts_with(FORCED_PREFIX)
}

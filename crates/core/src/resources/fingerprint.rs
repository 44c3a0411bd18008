//! Structural payload fingerprints used to match confirmations to optimistic writes.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Keys assigned or rewritten by the server; they never take part in a match.
const VOLATILE_KEYS: [&str; 8] = [
    "id",
    "_id",
    "tempId",
    "_tempId",
    "createdAt",
    "updatedAt",
    "created_at",
    "updated_at",
];

/// SHA-256 over a canonical (sorted-key) rendering of the payload without volatile keys.
pub fn payload_fingerprint(data: &Map<String, Value>) -> String {
    let mut canonical = String::new();
    canonical.push('{');
    let mut keys: Vec<&String> = data
        .keys()
        .filter(|k| !VOLATILE_KEYS.contains(&k.as_str()))
        .collect();
    keys.sort();
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            canonical.push(',');
        }
        canonical.push_str(&Value::String((*key).clone()).to_string());
        canonical.push(':');
        write_canonical(&data[key.as_str()], &mut canonical);
    }
    canonical.push('}');

    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

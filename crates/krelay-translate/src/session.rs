//! Session key derivation.
//!
//! The key fingerprints the head of a conversation — the first three
//! inbound messages — so follow-up requests in the same conversation land
//! on the same credential while the growing tail never changes the key.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex length of the derived key.
const KEY_LEN: usize = 16;

/// Serialize a JSON value with object keys sorted at every level, so the
/// fingerprint is independent of producer key order.
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
                write_canonical(&map[*key], out);
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
        other => out.push_str(&other.to_string()),
    }
}

/// Derive the session key from the inbound message list.
pub fn session_key(messages: &[Value]) -> String {
    let head = &messages[..messages.len().min(3)];
    let mut canonical = String::new();
    write_canonical(&Value::Array(head.to_vec()), &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..KEY_LEN].to_string()
}

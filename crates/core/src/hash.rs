//! Canonical content hashing for tasks and services.
//!
//! A hash index is the content address of a canonicalized specification:
//! two specifications that canonicalize identically always produce the same
//! hash index, which is what task deduplication keys on. Task and service
//! preimages are domain-separated so the two hash namespaces cannot collide.

use serde_json::Value;
use sha2::{Digest, Sha256};

const TASK_DOMAIN: &[u8] = b"task\0";
const SERVICE_DOMAIN: &[u8] = b"service\0";

/// Encode a JSON value canonically: object keys recursively sorted,
/// no whitespace. Arrays keep their order (argument order is meaningful).
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
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
        other => out.push_str(&other.to_string()),
    }
}

fn hash_with_domain(domain: &[u8], preimage: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(canonical_json(preimage).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Content address for a task specification.
pub fn task_hash(program: &str, procedure: &str, spec: &Value) -> String {
    let preimage = serde_json::json!({
        "program": program,
        "procedure": procedure,
        "spec": spec,
    });
    hash_with_domain(TASK_DOMAIN, &preimage)
}

/// Content address for a service's initial input, metadata included.
pub fn service_hash(procedure: &str, program: &str, input: &Value) -> String {
    let preimage = serde_json::json!({
        "procedure": procedure,
        "program": program,
        "input": input,
    });
    hash_with_domain(SERVICE_DOMAIN, &preimage)
}

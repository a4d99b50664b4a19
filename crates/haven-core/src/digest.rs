//! Canonical field digests for tamper evidence.
//!
//! Every audit record carries an `integrity_hash`: a SHA-256 digest over a
//! canonical serialization of its fields, computed when the record is
//! written. Verification recomputes the digest from the stored fields and
//! compares it to the stored value, so any later mutation of a content
//! field is detectable.
//!
//! # Canonical form
//!
//! The canonical serialization is JSON with object keys sorted
//! lexicographically at every nesting level and no whitespace between
//! tokens. Two records with the same field values produce the same digest
//! regardless of insertion order.
//!
//! # Digest scope
//!
//! Two groups of fields are excluded from the digest input:
//!
//! - the `integrity_hash` field itself, and
//! - the seal-lifecycle fields (`sealed`, `sealed_at`, `sealed_by`,
//!   `seal_reason`, `unsealed_at`, `unsealed_by`).
//!
//! Seal state is the one mutation the system itself performs on an
//! otherwise append-only record. Excluding it keeps verification stable
//! across legitimate seal/unseal transitions while still catching any
//! mutation of record content; the seal transition itself is separately
//! recorded by a sealed summary entry with its own digest.
//!
//! # Verification semantics
//!
//! Verification never returns an error. A stored digest that is not
//! exactly 64 hex characters fails verification without a hash
//! comparison; otherwise the recomputed digest is compared in constant
//! time.

use std::fmt::Write as _;

use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::store::FieldMap;

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Field holding a record's own digest; always excluded from digest input.
pub const INTEGRITY_FIELD: &str = "integrity_hash";

/// Seal-lifecycle fields excluded from digest input.
///
/// These are the only fields the engine mutates on an existing record;
/// see the module docs for why they are outside the digest scope.
pub const SEAL_LIFECYCLE_FIELDS: &[&str] = &[
    "sealed",
    "sealed_at",
    "sealed_by",
    "seal_reason",
    "unsealed_at",
    "unsealed_by",
];

/// Computes the canonical digest over a record's fields.
///
/// The `integrity_hash` field and the seal-lifecycle fields are skipped;
/// everything else is serialized canonically (keys sorted at every level)
/// and hashed with SHA-256. The result is 64 lowercase hex characters.
#[must_use]
pub fn digest_fields(fields: &FieldMap) -> String {
    let mut canonical = String::new();
    emit_digest_object(fields, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Verifies a record's stored digest against its fields.
///
/// Returns `true` only when the stored `integrity_hash` is a well-formed
/// 64-character hex string and matches the digest recomputed over the
/// remaining fields. A missing, truncated, or non-hex stored digest is
/// `false` without attempting a comparison. This function never errors:
/// a record that cannot be verified is reported as unverified, not as a
/// failure.
#[must_use]
pub fn verify_fields(fields: &FieldMap) -> bool {
    let Some(Value::String(stored)) = fields.get(INTEGRITY_FIELD) else {
        return false;
    };
    if !is_well_formed_digest(stored) {
        return false;
    }

    let recomputed = digest_fields(fields);
    recomputed.as_bytes().ct_eq(stored.as_bytes()).into()
}

/// Checks that a stored digest has the expected shape: exactly 64
/// characters, all ASCII hex digits.
#[must_use]
pub fn is_well_formed_digest(stored: &str) -> bool {
    stored.len() == DIGEST_HEX_LEN && stored.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Emits the top-level field map in canonical form, skipping the digest
/// field and the seal-lifecycle fields.
fn emit_digest_object(fields: &FieldMap, out: &mut String) {
    let mut keys: Vec<&String> = fields
        .keys()
        .filter(|k| k.as_str() != INTEGRITY_FIELD && !SEAL_LIFECYCLE_FIELDS.contains(&k.as_str()))
        .collect();
    keys.sort_unstable();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        emit_string(key, out);
        out.push(':');
        emit_value(&fields[key.as_str()], out);
    }
    out.push('}');
}

/// Emits one JSON value canonically. Nested objects are emitted with
/// sorted keys; nested values are never subject to the top-level field
/// exclusions.
fn emit_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        },
        Value::String(s) => emit_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_value(item, out);
            }
            out.push(']');
        },
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_string(key, out);
                out.push(':');
                emit_value(&map[key.as_str()], out);
            }
            out.push('}');
        },
    }
}

/// Emits a string with JSON escaping (required escapes only).
fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            },
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Encodes bytes as lowercase hex.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

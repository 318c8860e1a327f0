//! Canonical payload encoding and the digest derived from it.
//!
//! The canonical form is compact JSON with object keys sorted byte-wise at
//! every depth, so two submissions that differ only in key order or
//! whitespace encode to identical bytes. Integral numbers below 2^53 are
//! written without a fractional part, which makes `1` and `1.0` equal.

use std::fmt::{self, Write as _};

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// A decoded event payload: a string-keyed mapping of arbitrary JSON values.
pub type Payload = Map<String, Value>;

/// Largest magnitude at which every integer is exactly representable as f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Accepts a decoded JSON value as a payload.
///
/// # Errors
///
/// Returns `StoreError::InvalidPayload` unless `value` is a JSON object.
pub fn payload_from_value(value: Value) -> Result<Payload, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidPayload(format!(
            "payload must be a JSON object, got {}",
            kind(&other)
        ))),
    }
}

/// Decodes raw JSON bytes into a payload.
///
/// # Errors
///
/// Returns `StoreError::InvalidPayload` if the bytes are not valid JSON or
/// do not hold an object.
pub fn decode_payload(raw: &[u8]) -> Result<Payload, StoreError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| StoreError::InvalidPayload(format!("payload is not valid JSON: {e}")))?;
    payload_from_value(value)
}

/// Returns the canonical encoding of `payload` as a string.
pub fn canonical_json(payload: &Payload) -> String {
    CanonicalObject(payload).to_string()
}

/// Returns the canonical encoding of `payload` as bytes.
pub fn canonical_bytes(payload: &Payload) -> Vec<u8> {
    canonical_json(payload).into_bytes()
}

/// Lower-case hex SHA-256 of the canonical encoding.
pub fn payload_hash(payload: &Payload) -> String {
    hash_canonical(&canonical_bytes(payload))
}

/// Hashes bytes that are already in canonical form.
pub(crate) fn hash_canonical(canonical: &[u8]) -> String {
    hex::encode(Sha256::digest(canonical))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

struct CanonicalObject<'a>(&'a Map<String, Value>);

impl fmt::Display for CanonicalObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_object(f, self.0)
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Null => f.write_str("null"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Number(n) => write_number(f, n),
        Value::String(s) => write_string(f, s),
        Value::Array(items) => {
            f.write_char('[')?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_char(',')?;
                }
                write_value(f, item)?;
            }
            f.write_char(']')
        }
        Value::Object(map) => write_object(f, map),
    }
}

fn write_object(f: &mut fmt::Formatter<'_>, map: &Map<String, Value>) -> fmt::Result {
    // Map iteration order depends on serde_json's `preserve_order` feature.
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    f.write_char('{')?;
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            f.write_char(',')?;
        }
        write_string(f, key)?;
        f.write_char(':')?;
        write_value(f, value)?;
    }
    f.write_char('}')
}

fn write_number(f: &mut fmt::Formatter<'_>, n: &Number) -> fmt::Result {
    if let Some(i) = n.as_i64() {
        return write!(f, "{i}");
    }
    if let Some(u) = n.as_u64() {
        return write!(f, "{u}");
    }
    match n.as_f64() {
        Some(x) if x.fract() == 0.0 && x.abs() < MAX_SAFE_INTEGER => write!(f, "{}", x as i64),
        _ => write!(f, "{n}"),
    }
}

fn write_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    let quoted = serde_json::to_string(s).map_err(|_| fmt::Error)?;
    f.write_str(&quoted)
}

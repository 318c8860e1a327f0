//! Event record, input and view types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::Payload;

/// An event submission, before fingerprinting and normalisation.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Origin system. Required, non-empty.
    pub source: String,
    /// Event category. Required, non-empty.
    pub event_type: String,
    /// Event time. Defaults to ingestion time when absent.
    pub timestamp: Option<DateTime<Utc>>,
    /// Arbitrary structured payload. Must be a JSON object.
    pub payload: Value,
}

impl NewEvent {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            source: source.into(),
            event_type: event_type.into(),
            timestamp: None,
            payload,
        }
    }

    /// Sets an explicit event time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A single row of the `events` table.
///
/// `count` is the number of logically identical submissions folded into
/// this record. Records are created by the first submission of a dedup key
/// and only ever have `count` and `updated_at` changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Store-assigned identifier (hyphenated UUID).
    pub id: String,
    pub source: String,
    pub event_type: String,
    /// Event time, UTC, whole seconds.
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    /// Hex SHA-256 of the canonical payload. Internal to the store.
    pub payload_hash: String,
    pub count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The consumer-facing projection of an [`EventRecord`].
///
/// Everything except `payload_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventView {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    pub count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<EventRecord> for EventView {
    fn from(record: EventRecord) -> Self {
        Self {
            id: record.id,
            source: record.source,
            event_type: record.event_type,
            timestamp: record.timestamp,
            payload: record.payload,
            count: record.count,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

//! Event ingestion engine for eventfold.
//!
//! Records discrete application events and folds repeated occurrences of the
//! same logical event into a single record with an occurrence counter.
//!
//! # Dedup key
//!
//! Two submissions are the same logical event when they share
//! `(source, type, payload_hash)`. The payload hash is the SHA-256 of the
//! payload's canonical encoding (see [`fingerprint`]), so key order and
//! whitespace in the submitted JSON do not matter. Event time is not part of
//! the key.
//!
//! # Usage
//!
//! ```rust,ignore
//! use eventfold_store::{EventStore, NewEvent};
//! use serde_json::json;
//!
//! let store = EventStore::new(pool).with_timeout(Duration::from_secs(3));
//! let first = store
//!     .upsert(NewEvent::new("app.web", "user_login", json!({"user_id": 123, "ip": "1.2.3.4"})))
//!     .await?;
//! let second = store
//!     .upsert(NewEvent::new("app.web", "user_login", json!({"ip": "1.2.3.4", "user_id": 123})))
//!     .await?;
//! assert_eq!(second.id, first.id);
//! assert_eq!(second.count, 2);
//! ```

mod error;
mod event;
pub mod fingerprint;
mod store;

pub use error::{StorageError, StoreError};
pub use event::{EventRecord, EventView, NewEvent};
pub use fingerprint::Payload;
pub use store::{
    get_event, query_events, upsert_event, EventFilter, EventStore, DEFAULT_LIST_LIMIT,
    DEFAULT_OPERATION_TIMEOUT, MAX_LIST_LIMIT,
};

#[cfg(test)]
mod tests;

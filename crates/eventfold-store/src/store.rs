//! Persistence operations for folded event records.
//!
//! All writes go through [`upsert_event`], which fingerprints the payload
//! and then inserts-or-increments in a single `INSERT .. ON CONFLICT DO
//! UPDATE .. RETURNING` statement. There is no read followed by a write, so
//! concurrent submissions of the same dedup key cannot lose increments.
//!
//! Reads go through [`query_events`] and [`get_event`]. [`EventStore`] wraps
//! all three with a pooled connection, a blocking worker and a time bound.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use eventfold_db::DbPool;
use rusqlite::{params, Connection, ErrorCode, InterruptHandle, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{StorageError, StoreError};
use crate::event::{EventRecord, NewEvent};
use crate::fingerprint::{self, Payload};

/// Page size used when the caller gives none, or a non-positive one.
pub const DEFAULT_LIST_LIMIT: i64 = 50;

/// Upper bound on the page size.
pub const MAX_LIST_LIMIT: i64 = 200;

/// Time bound applied to store operations unless the owner sets another.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(3);

const SELECT_COLUMNS: &str = "id, source, event_type, occurred_at, payload_json, payload_hash, \
                              count, created_at, updated_at";

const UPSERT_SQL: &str = "INSERT INTO events
        (id, source, event_type, occurred_at, payload_json, payload_hash, count, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
     ON CONFLICT (source, event_type, payload_hash)
     DO UPDATE SET count = count + 1, updated_at = excluded.updated_at
     RETURNING id, source, event_type, occurred_at, payload_json, payload_hash,
               count, created_at, updated_at";

/// Filter criteria for listing events.
///
/// Empty strings behave like `None`. The time range is half-open:
/// `from <= timestamp < to`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Exact match on `source`.
    pub source: Option<String>,
    /// Exact match on the event type.
    pub event_type: Option<String>,
    /// Inclusive lower bound on event time.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on event time.
    pub to: Option<DateTime<Utc>>,
    /// Page size; see [`EventFilter::effective_limit`].
    pub limit: Option<i64>,
    /// Records to skip; negative values count as zero.
    pub offset: Option<i64>,
}

impl EventFilter {
    /// The page size actually applied: 50 when unset or non-positive,
    /// otherwise at most 200.
    pub fn effective_limit(&self) -> i64 {
        match self.limit {
            Some(limit) if limit > 0 => limit.min(MAX_LIST_LIMIT),
            _ => DEFAULT_LIST_LIMIT,
        }
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// A validated, fingerprinted submission ready to be written.
#[derive(Debug)]
struct PreparedEvent {
    source: String,
    event_type: String,
    occurred_at: i64,
    payload_json: String,
    payload_hash: String,
    now: String,
}

impl PreparedEvent {
    fn new(event: NewEvent, now: DateTime<Utc>) -> Result<Self, StoreError> {
        if event.source.trim().is_empty() {
            return Err(StoreError::InvalidArgument("source is required".to_string()));
        }
        if event.event_type.trim().is_empty() {
            return Err(StoreError::InvalidArgument("type is required".to_string()));
        }

        let payload = fingerprint::payload_from_value(event.payload)?;
        let payload_json = fingerprint::canonical_json(&payload);
        let payload_hash = fingerprint::hash_canonical(payload_json.as_bytes());

        // `timestamp()` floors to whole seconds, which drops sub-second jitter.
        let occurred_at = event.timestamp.unwrap_or(now).timestamp();

        Ok(Self {
            source: event.source,
            event_type: event.event_type,
            occurred_at,
            payload_json,
            payload_hash,
            now: format_instant(now),
        })
    }

    fn execute(&self, conn: &Connection) -> Result<EventRecord, StoreError> {
        match self.try_upsert(conn) {
            Err(StoreError::Storage(StorageError::Database(e))) if is_constraint_violation(&e) => {
                tracing::warn!(
                    source = %self.source,
                    event_type = %self.event_type,
                    "event upsert hit a uniqueness constraint, retrying once: {}",
                    e
                );
                self.try_upsert(conn).map_err(|err| match err {
                    StoreError::Storage(StorageError::Database(e)) if is_constraint_violation(&e) => {
                        StoreError::Storage(StorageError::ConstraintViolation(e))
                    }
                    other => other,
                })
            }
            other => other,
        }
    }

    fn try_upsert(&self, conn: &Connection) -> Result<EventRecord, StoreError> {
        // A fresh id per attempt; it is only kept when the row is inserted.
        let id = Uuid::new_v4().hyphenated().to_string();
        let raw = conn.query_row(
            UPSERT_SQL,
            params![
                id,
                self.source,
                self.event_type,
                self.occurred_at,
                self.payload_json,
                self.payload_hash,
                self.now,
            ],
            RawRow::from_row,
        )?;
        raw.into_record()
    }
}

/// Inserts a new record for the submission's dedup key, or increments the
/// existing one, and returns the post-update view.
///
/// The dedup key is `(source, event_type, payload_hash)`. Event time is not
/// part of it: a repeat with a different timestamp is folded into the first
/// record and only the first timestamp is retained.
///
/// # Errors
///
/// `InvalidArgument` or `InvalidPayload` before touching the database;
/// `Storage` for any SQL failure, including a uniqueness violation that
/// survives one retry.
pub fn upsert_event(conn: &Connection, event: NewEvent) -> Result<EventRecord, StoreError> {
    PreparedEvent::new(event, Utc::now())?.execute(conn)
}

/// Lists events matching `filter`, most recent event time first.
///
/// Ties on event time come back in insertion order.
///
/// # Errors
///
/// Returns `StoreError::Storage` on SQL failure.
pub fn query_events(conn: &Connection, filter: &EventFilter) -> Result<Vec<EventRecord>, StoreError> {
    // Clauses and bind parameters are collected separately so nothing is
    // interpolated into the SQL.
    let mut clauses: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(source) = non_empty(&filter.source) {
        param_values.push(Box::new(source.to_string()));
        clauses.push(format!("source = ?{}", param_values.len()));
    }

    if let Some(event_type) = non_empty(&filter.event_type) {
        param_values.push(Box::new(event_type.to_string()));
        clauses.push(format!("event_type = ?{}", param_values.len()));
    }

    if let Some(from) = filter.from {
        param_values.push(Box::new(ceil_seconds(from)));
        clauses.push(format!("occurred_at >= ?{}", param_values.len()));
    }

    if let Some(to) = filter.to {
        param_values.push(Box::new(ceil_seconds(to)));
        clauses.push(format!("occurred_at < ?{}", param_values.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    param_values.push(Box::new(filter.effective_limit()));
    let limit_idx = param_values.len();
    param_values.push(Box::new(filter.effective_offset()));
    let offset_idx = param_values.len();

    let sql = format!(
        "SELECT {SELECT_COLUMNS}
         FROM events
         {where_clause}
         ORDER BY occurred_at DESC, rowid ASC
         LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
    );

    let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values.iter().map(|p| &**p).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), RawRow::from_row)?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?.into_record()?);
    }

    Ok(events)
}

/// Fetches a single record by identifier.
///
/// # Errors
///
/// `NotFound` when `id` is not a UUID or no record carries it;
/// `Storage` on SQL failure.
pub fn get_event(conn: &Connection, id: &str) -> Result<EventRecord, StoreError> {
    let id = Uuid::parse_str(id).map_err(|_| StoreError::NotFound)?;

    let raw = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM events WHERE id = ?1"),
            [id.hyphenated().to_string()],
            RawRow::from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)?;

    raw.into_record()
}

/// The event store engine.
///
/// Stateless apart from the shared pool; clone freely and share between
/// request workers. Every operation runs on the blocking pool and is bounded
/// by [`EventStore::timeout`]. When the bound elapses the caller gets
/// `StorageError::Timeout` and the in-flight statement is interrupted.
#[derive(Clone)]
pub struct EventStore {
    pool: DbPool,
    timeout: Duration,
}

impl EventStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Replaces the per-operation time bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// See [`upsert_event`]. Validation and fingerprinting happen before a
    /// connection is checked out.
    pub async fn upsert(&self, event: NewEvent) -> Result<EventRecord, StoreError> {
        let prepared = PreparedEvent::new(event, Utc::now())?;
        let record = self.run("upsert", move |conn| prepared.execute(conn)).await?;

        tracing::debug!(
            id = %record.id,
            source = %record.source,
            event_type = %record.event_type,
            count = record.count,
            "event upserted"
        );

        Ok(record)
    }

    /// See [`query_events`].
    pub async fn list(&self, filter: EventFilter) -> Result<Vec<EventRecord>, StoreError> {
        self.run("list", move |conn| query_events(conn, &filter)).await
    }

    /// See [`get_event`]. Malformed identifiers never reach the database.
    pub async fn get_by_id(&self, id: &str) -> Result<EventRecord, StoreError> {
        if Uuid::parse_str(id).is_err() {
            return Err(StoreError::NotFound);
        }
        let id = id.to_string();
        self.run("get_by_id", move |conn| get_event(conn, &id)).await
    }

    async fn run<T, F>(&self, operation: &'static str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        let timeout = self.timeout;
        let cancel = Arc::new(Cancellation::default());
        let worker_cancel = Arc::clone(&cancel);

        let task = tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let conn = pool.get_timeout(timeout)?;
            if !worker_cancel.arm(conn.get_interrupt_handle()) {
                return Err(StorageError::Timeout(timeout).into());
            }
            let result = op(&conn);
            // Disarm before the connection goes back to the pool.
            worker_cancel.disarm();
            result
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StorageError::Task(join_error.to_string()).into()),
            Err(_elapsed) => {
                cancel.fire();
                tracing::warn!(
                    operation,
                    ?timeout,
                    "store operation timed out, interrupting"
                );
                Err(StorageError::Timeout(timeout).into())
            }
        }
    }
}

/// Hands the interrupt handle of the connection running an operation to
/// the task waiting on it.
#[derive(Default)]
struct Cancellation {
    state: Mutex<CancelState>,
}

#[derive(Default)]
struct CancelState {
    fired: bool,
    handle: Option<InterruptHandle>,
}

impl Cancellation {
    /// Returns false if the operation was cancelled before it started.
    fn arm(&self, handle: InterruptHandle) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fired {
            return false;
        }
        state.handle = Some(handle);
        true
    }

    fn disarm(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle = None;
    }

    fn fire(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.fired = true;
        if let Some(handle) = state.handle.take() {
            handle.interrupt();
        }
    }
}

/// Column values as stored, before decoding.
struct RawRow {
    id: String,
    source: String,
    event_type: String,
    occurred_at: i64,
    payload_json: String,
    payload_hash: String,
    count: i64,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            event_type: row.get(2)?,
            occurred_at: row.get(3)?,
            payload_json: row.get(4)?,
            payload_hash: row.get(5)?,
            count: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<EventRecord, StoreError> {
        let payload: Payload = serde_json::from_str(&self.payload_json).map_err(|e| {
            StorageError::Corrupt(format!("payload of event {}: {}", self.id, e))
        })?;
        let timestamp = DateTime::from_timestamp(self.occurred_at, 0).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "event time {} of event {} is out of range",
                self.occurred_at, self.id
            ))
        })?;
        let count = u64::try_from(self.count).map_err(|_| {
            StorageError::Corrupt(format!("count {} of event {}", self.count, self.id))
        })?;

        Ok(EventRecord {
            created_at: parse_instant(&self.created_at, &self.id)?,
            updated_at: parse_instant(&self.updated_at, &self.id)?,
            id: self.id,
            source: self.source,
            event_type: self.event_type,
            timestamp,
            payload,
            payload_hash: self.payload_hash,
            count,
        })
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Stored event times are whole seconds, so rounding a bound up keeps both
/// `>= from` and `< to` exact.
fn ceil_seconds(instant: DateTime<Utc>) -> i64 {
    let secs = instant.timestamp();
    if instant.timestamp_subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_instant(value: &str, id: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("instant {value:?} of event {id}: {e}")))
}

//! Unit tests for the event store engine.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use eventfold_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use rusqlite::Connection;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::error::{StorageError, StoreError};
use crate::event::{EventView, NewEvent};
use crate::fingerprint;
use crate::store::{get_event, query_events, upsert_event, EventFilter, EventStore};

/// A migrated database in a temporary file, shared by every pooled
/// connection. In-memory databases are per connection and would not be.
struct TestDb {
    _dir: TempDir,
    pool: DbPool,
}

impl TestDb {
    fn conn(&self) -> r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager> {
        self.pool.get().expect("should check out a connection")
    }

    fn store(&self) -> EventStore {
        EventStore::new(self.pool.clone())
    }
}

fn test_db() -> TestDb {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("events.db");
    let pool = create_pool(
        path.to_str().expect("temp path should be UTF-8"),
        DbRuntimeSettings::default(),
    )
    .expect("should create pool");
    run_migrations(&pool.get().expect("should check out a connection"))
        .expect("migrations should succeed");
    TestDb { _dir: dir, pool }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid test timestamp")
}

fn row_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
        .expect("should count events")
}

/// Inserts `n` distinct events, one second apart, starting at `start`.
fn seed(conn: &Connection, n: i64, start: i64) {
    for i in 0..n {
        upsert_event(
            conn,
            NewEvent::new("seed", "tick", json!({ "i": i })).at(at(start + i)),
        )
        .expect("seed upsert should succeed");
    }
}

// ── upsert ───────────────────────────────────────────────────────────

#[test]
fn first_upsert_creates_record_with_count_one() {
    let db = test_db();
    let conn = db.conn();

    let before = Utc::now();
    let event = upsert_event(
        &conn,
        NewEvent::new("app.web", "user_login", json!({"user_id": 123})),
    )
    .expect("upsert should succeed");

    assert_eq!(event.count, 1);
    assert_eq!(event.source, "app.web");
    assert_eq!(event.event_type, "user_login");
    assert_eq!(event.payload, *json!({"user_id": 123}).as_object().unwrap());
    assert_eq!(event.created_at, event.updated_at);
    assert_eq!(event.id.len(), 36, "id should be a hyphenated uuid");

    // Defaulted event time is ingestion time, truncated to the second.
    assert!(event.timestamp.timestamp() >= before.timestamp());
    assert!(event.timestamp <= Utc::now());
    assert_eq!(event.timestamp.timestamp_subsec_nanos(), 0);
    assert_eq!(row_count(&conn), 1);
}

#[test]
fn repeated_upserts_fold_into_one_record() {
    let db = test_db();
    let conn = db.conn();
    let payload = json!({"path": "/checkout", "status": 500});

    let mut ids = BTreeSet::new();
    let mut last = None;
    for n in 1..=5 {
        let event = upsert_event(&conn, NewEvent::new("s", "t", payload.clone()))
            .expect("upsert should succeed");
        assert_eq!(event.count, n);
        ids.insert(event.id.clone());
        last = Some(event);
    }

    let last = last.unwrap();
    assert_eq!(ids.len(), 1, "every upsert should return the same record");
    assert!(last.updated_at >= last.created_at);
    assert_eq!(row_count(&conn), 1);
}

#[test]
fn key_order_permutations_are_the_same_event() {
    let db = test_db();
    let conn = db.conn();

    let first = upsert_event(
        &conn,
        NewEvent::new("app.web", "user_login", json!({"user_id": 123, "ip": "1.2.3.4"})),
    )
    .expect("first upsert should succeed");

    let reordered: Value = serde_json::from_str(r#"{"ip":"1.2.3.4","user_id":123}"#).unwrap();
    let second = upsert_event(&conn, NewEvent::new("app.web", "user_login", reordered))
        .expect("second upsert should succeed");

    assert_eq!(first.count, 1);
    assert_eq!(second.count, 2);
    assert_eq!(second.id, first.id);
    assert_eq!(second.created_at, first.created_at);
}

#[test]
fn distinct_keys_stay_distinct() {
    let db = test_db();
    let conn = db.conn();
    let payload = json!({"k": "v"});

    let base = upsert_event(&conn, NewEvent::new("a", "t", payload.clone())).unwrap();
    let other_source = upsert_event(&conn, NewEvent::new("b", "t", payload.clone())).unwrap();
    let other_type = upsert_event(&conn, NewEvent::new("a", "u", payload)).unwrap();
    let other_payload = upsert_event(&conn, NewEvent::new("a", "t", json!({"k": "w"}))).unwrap();

    let ids: BTreeSet<_> = [&base, &other_source, &other_type, &other_payload]
        .iter()
        .map(|e| e.id.clone())
        .collect();
    assert_eq!(ids.len(), 4);
    for event in [&base, &other_source, &other_type, &other_payload] {
        assert_eq!(event.count, 1);
    }
    assert_eq!(row_count(&conn), 4);
}

#[test]
fn event_time_is_truncated_to_seconds() {
    let db = test_db();
    let conn = db.conn();

    let jittered = DateTime::parse_from_rfc3339("2024-03-01T12:00:00.750+02:00")
        .unwrap()
        .with_timezone(&Utc);
    let event = upsert_event(&conn, NewEvent::new("s", "t", json!({})).at(jittered)).unwrap();

    assert_eq!(
        event.timestamp,
        DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z").unwrap()
    );
}

#[test]
fn repeat_with_different_event_time_keeps_first_time() {
    let db = test_db();
    let conn = db.conn();

    let first = upsert_event(&conn, NewEvent::new("s", "t", json!({"a": 1})).at(at(1_000))).unwrap();
    let second =
        upsert_event(&conn, NewEvent::new("s", "t", json!({"a": 1})).at(at(2_000))).unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.count, 2);
    assert_eq!(second.timestamp, at(1_000));
}

#[test]
fn stored_payload_is_canonical_and_hash_matches_fingerprint() {
    let db = test_db();
    let conn = db.conn();

    let event = upsert_event(&conn, NewEvent::new("s", "t", json!({"b": 2, "a": [1.0, "x"]}))).unwrap();

    let (payload_json, payload_hash): (String, String) = conn
        .query_row(
            "SELECT payload_json, payload_hash FROM events WHERE id = ?1",
            [&event.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();

    assert_eq!(payload_json, r#"{"a":[1,"x"],"b":2}"#);
    assert_eq!(payload_hash, fingerprint::payload_hash(&event.payload));
    assert_eq!(event.payload_hash, payload_hash);
}

#[test]
fn non_object_payload_is_rejected_before_storage() {
    let db = test_db();
    let conn = db.conn();

    for payload in [json!([1, 2]), json!("text"), json!(7), Value::Null] {
        let err = upsert_event(&conn, NewEvent::new("s", "t", payload))
            .expect_err("non-object payload should fail");
        assert!(matches!(err, StoreError::InvalidPayload(_)), "{err:?}");
    }
    assert_eq!(row_count(&conn), 0);
}

#[test]
fn empty_source_or_type_is_invalid_argument() {
    let db = test_db();
    let conn = db.conn();

    let err = upsert_event(&conn, NewEvent::new("", "t", json!({}))).unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));

    let err = upsert_event(&conn, NewEvent::new("s", "  ", json!({}))).unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));

    assert_eq!(row_count(&conn), 0);
}

#[test]
fn constraint_violation_is_retried_once_then_reported() {
    let db = test_db();
    let conn = db.conn();

    // A second unique index outside the upsert's conflict target.
    conn.execute_batch("CREATE UNIQUE INDEX probe_unique_time ON events (occurred_at)")
        .unwrap();

    upsert_event(&conn, NewEvent::new("s", "t", json!({"n": 1})).at(at(50))).unwrap();
    let err = upsert_event(&conn, NewEvent::new("s", "t", json!({"n": 2})).at(at(50)))
        .expect_err("colliding insert should fail");

    match err {
        StoreError::Storage(ref storage @ StorageError::ConstraintViolation(_)) => {
            assert_eq!(storage.public_message(), "storage conflict, retry the request");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(row_count(&conn), 1);
}

// ── list ─────────────────────────────────────────────────────────────

#[test]
fn list_defaults_to_fifty() {
    let db = test_db();
    let conn = db.conn();
    seed(&conn, 60, 0);

    let events = query_events(&conn, &EventFilter::default()).unwrap();
    assert_eq!(events.len(), 50);

    let events = query_events(
        &conn,
        &EventFilter {
            limit: Some(0),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(events.len(), 50, "non-positive limit falls back to the default");
}

#[test]
fn list_limit_is_clamped_to_two_hundred() {
    let db = test_db();
    let conn = db.conn();
    seed(&conn, 210, 0);

    let events = query_events(
        &conn,
        &EventFilter {
            limit: Some(10_000),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(events.len(), 200);
}

#[test]
fn negative_offset_behaves_like_zero() {
    let db = test_db();
    let conn = db.conn();
    seed(&conn, 5, 0);

    let negative = query_events(
        &conn,
        &EventFilter {
            offset: Some(-5),
            ..Default::default()
        },
    )
    .unwrap();
    let zero = query_events(&conn, &EventFilter::default()).unwrap();

    assert_eq!(negative, zero);
    assert_eq!(negative.len(), 5);
}

#[test]
fn list_orders_by_event_time_descending_then_insertion() {
    let db = test_db();
    let conn = db.conn();

    let old = upsert_event(&conn, NewEvent::new("s", "t", json!({"n": "old"})).at(at(100))).unwrap();
    let tie_a = upsert_event(&conn, NewEvent::new("s", "t", json!({"n": "a"})).at(at(200))).unwrap();
    let tie_b = upsert_event(&conn, NewEvent::new("s", "t", json!({"n": "b"})).at(at(200))).unwrap();
    let new = upsert_event(&conn, NewEvent::new("s", "t", json!({"n": "new"})).at(at(300))).unwrap();

    let ids: Vec<String> = query_events(&conn, &EventFilter::default())
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();

    assert_eq!(ids, vec![new.id, tie_a.id, tie_b.id, old.id]);
}

#[test]
fn list_paginates_with_offset() {
    let db = test_db();
    let conn = db.conn();
    seed(&conn, 10, 0);

    let page = query_events(
        &conn,
        &EventFilter {
            limit: Some(3),
            offset: Some(4),
            ..Default::default()
        },
    )
    .unwrap();

    let times: Vec<i64> = page.iter().map(|e| e.timestamp.timestamp()).collect();
    assert_eq!(times, vec![5, 4, 3]);
}

#[test]
fn list_filters_by_source_and_type() {
    let db = test_db();
    let conn = db.conn();

    upsert_event(&conn, NewEvent::new("web", "login", json!({"u": 1}))).unwrap();
    upsert_event(&conn, NewEvent::new("web", "logout", json!({"u": 1}))).unwrap();
    upsert_event(&conn, NewEvent::new("mobile", "login", json!({"u": 1}))).unwrap();

    let by_source = query_events(
        &conn,
        &EventFilter {
            source: Some("web".into()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(by_source.len(), 2);
    assert!(by_source.iter().all(|e| e.source == "web"));

    let both = query_events(
        &conn,
        &EventFilter {
            source: Some("web".into()),
            event_type: Some("login".into()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(both.len(), 1);
    assert_eq!(both[0].event_type, "login");

    let empty_filters = query_events(
        &conn,
        &EventFilter {
            source: Some(String::new()),
            event_type: Some(String::new()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(empty_filters.len(), 3, "empty filters impose no constraint");
}

#[test]
fn list_time_range_is_half_open() {
    let db = test_db();
    let conn = db.conn();
    seed(&conn, 10, 1_000);

    let events = query_events(
        &conn,
        &EventFilter {
            from: Some(at(1_002)),
            to: Some(at(1_005)),
            ..Default::default()
        },
    )
    .unwrap();

    let times: Vec<i64> = events.iter().map(|e| e.timestamp.timestamp()).collect();
    assert_eq!(times, vec![1_004, 1_003, 1_002]);
}

#[test]
fn list_time_bounds_with_fractions_round_up() {
    let db = test_db();
    let conn = db.conn();
    seed(&conn, 5, 1_000);

    let half = chrono::Duration::milliseconds(500);
    let events = query_events(
        &conn,
        &EventFilter {
            from: Some(at(1_001) + half),
            to: Some(at(1_003) + half),
            ..Default::default()
        },
    )
    .unwrap();

    // 1001 < 1001.5, excluded; 1003 < 1003.5, included.
    let times: Vec<i64> = events.iter().map(|e| e.timestamp.timestamp()).collect();
    assert_eq!(times, vec![1_003, 1_002]);
}

#[test]
fn list_with_no_matches_is_empty() {
    let db = test_db();
    let conn = db.conn();
    seed(&conn, 3, 0);

    let events = query_events(
        &conn,
        &EventFilter {
            source: Some("nobody".into()),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(events.is_empty());
}

// ── get_by_id ────────────────────────────────────────────────────────

#[test]
fn get_event_round_trips_upserted_record() {
    let db = test_db();
    let conn = db.conn();

    let created = upsert_event(&conn, NewEvent::new("source.a", "type.a", json!({"a": 1}))).unwrap();
    let fetched = get_event(&conn, &created.id).unwrap();

    assert_eq!(fetched, created);
}

#[test]
fn get_event_accepts_other_uuid_spellings() {
    let db = test_db();
    let conn = db.conn();

    let created = upsert_event(&conn, NewEvent::new("s", "t", json!({}))).unwrap();
    let simple = created.id.replace('-', "").to_uppercase();

    assert_eq!(get_event(&conn, &simple).unwrap().id, created.id);
}

#[test]
fn get_event_malformed_or_absent_is_not_found() {
    let db = test_db();
    let conn = db.conn();

    for id in ["not-an-id", "", "12345", "6507f1f77bcf86cd79943901"] {
        let err = get_event(&conn, id).expect_err("malformed id should fail");
        assert!(matches!(err, StoreError::NotFound), "{id}: {err:?}");
    }

    let err = get_event(&conn, "1b4e28ba-2fa1-11d2-883f-0016d3cca427").unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
}

// ── EventStore ───────────────────────────────────────────────────────

#[tokio::test]
async fn store_upsert_then_get_by_id() {
    let db = test_db();
    let store = db.store();

    let first = store
        .upsert(NewEvent::new(
            "app.web",
            "user_login",
            json!({"user_id": 123, "ip": "1.2.3.4"}),
        ))
        .await
        .unwrap();
    let second = store
        .upsert(NewEvent::new(
            "app.web",
            "user_login",
            json!({"ip": "1.2.3.4", "user_id": 123}),
        ))
        .await
        .unwrap();

    assert_eq!(second.count, 2);
    assert_eq!(second.id, first.id);

    let fetched = store.get_by_id(&first.id).await.unwrap();
    assert_eq!(fetched.count, 2);

    let listed = store.list(EventFilter::default()).await.unwrap();
    assert_eq!(listed, vec![fetched]);
}

#[tokio::test]
async fn store_get_by_id_rejects_malformed_ids_as_not_found() {
    let db = test_db();
    let store = db.store();

    let err = store.get_by_id("zzz").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound));

    let err = store
        .get_by_id("00000000-0000-4000-8000-000000000000")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_upserts_converge() {
    const CALLERS: u64 = 16;

    let db = test_db();
    let store = db.store();

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .upsert(NewEvent::new("s", "t", json!({"same": true})))
                    .await
            })
        })
        .collect();

    let mut ids = BTreeSet::new();
    let mut counts = BTreeSet::new();
    for handle in handles {
        let event = handle.await.expect("task should not panic").expect("upsert should succeed");
        ids.insert(event.id);
        counts.insert(event.count);
    }

    assert_eq!(ids.len(), 1, "exactly one record for the dedup key");
    // Every caller saw its own post-update count.
    assert_eq!(counts, (1..=CALLERS).collect::<BTreeSet<_>>());

    let events = store.list(EventFilter::default()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].count, CALLERS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_distinct_upserts_stay_distinct() {
    let db = test_db();
    let store = db.store();

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .upsert(NewEvent::new("s", "t", json!({ "caller": i % 3 })))
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let events = store.list(EventFilter::default()).await.unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.count == 4));
}

#[tokio::test]
async fn store_operation_times_out_when_database_is_locked() {
    let db = test_db();
    let store = db.store().with_timeout(Duration::from_millis(200));

    // Hold the write lock from another connection.
    let blocker = db.conn();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    let started = Instant::now();
    let err = store
        .upsert(NewEvent::new("s", "t", json!({"blocked": true})))
        .await
        .expect_err("upsert should time out");

    assert!(err.is_timeout(), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    match &err {
        StoreError::Storage(storage) => {
            assert_eq!(storage.public_message(), "storage operation timed out")
        }
        other => panic!("unexpected error: {other:?}"),
    }

    blocker.execute_batch("ROLLBACK").unwrap();

    // The store stays usable after a failed call.
    let event = store
        .with_timeout(Duration::from_secs(5))
        .upsert(NewEvent::new("s", "t", json!({"after": true})))
        .await
        .unwrap();
    assert!(event.count >= 1);
}

#[tokio::test]
async fn store_rejects_invalid_input_without_touching_storage() {
    let db = test_db();
    let store = db.store();

    let err = store
        .upsert(NewEvent::new("s", "t", json!(["not", "an", "object"])))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidPayload(_)));

    let err = store.upsert(NewEvent::new("s", "", json!({}))).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));

    assert_eq!(row_count(&db.conn()), 0);
}

#[test]
fn view_omits_payload_hash() {
    let db = test_db();
    let conn = db.conn();

    let record = upsert_event(&conn, NewEvent::new("s", "t", json!({"a": 1})).at(at(0))).unwrap();
    let view = EventView::from(record.clone());
    let json = serde_json::to_value(&view).unwrap();

    assert!(json.get("payload_hash").is_none());
    assert_eq!(json["id"], record.id);
    assert_eq!(json["type"], "t");
    assert_eq!(json["count"], 1);
    assert_eq!(json["timestamp"], "1970-01-01T00:00:00Z");
    assert_eq!(json["payload"], json!({"a": 1}));
}

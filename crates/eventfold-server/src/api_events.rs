//! Event API handlers.
//!
//! Provides:
//! - `GET /events`: filtered, paginated listing, most recent first
//! - `GET /events/{id}`: single event lookup
//! - `POST /events`: record an event, folding repeats into one record

use crate::api::ApiError;
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    Json,
};
use chrono::{DateTime, Utc};
use eventfold_store::{EventFilter, EventView, NewEvent};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Query parameters for `GET /events`.
///
/// Every field is taken as a raw string so that malformed values can be
/// ignored rather than rejected: a bad `from`/`to` means "no bound" and a
/// bad `limit`/`offset` means "use the default". When a key repeats, the
/// first occurrence wins and the rest are ignored.
#[derive(Debug, Default)]
pub struct ListEventsQuery {
    pub source: Option<String>,
    pub event_type: Option<String>,
    /// RFC 3339 instant, inclusive.
    pub from: Option<String>,
    /// RFC 3339 instant, exclusive.
    pub to: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl ListEventsQuery {
    /// Collects the known parameters from decoded query pairs. Unknown keys
    /// are dropped.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut query = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "source" => &mut query.source,
                "type" => &mut query.event_type,
                "from" => &mut query.from,
                "to" => &mut query.to,
                "limit" => &mut query.limit,
                "offset" => &mut query.offset,
                _ => continue,
            };
            slot.get_or_insert(value);
        }
        query
    }

    pub fn into_filter(self) -> EventFilter {
        EventFilter {
            source: self.source,
            event_type: self.event_type,
            from: parse_instant(self.from.as_deref()),
            to: parse_instant(self.to.as_deref()),
            limit: parse_integer(self.limit.as_deref()),
            offset: parse_integer(self.offset.as_deref()),
        }
    }
}

fn parse_instant(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value.filter(|v| !v.is_empty())?;
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

fn parse_integer(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.trim().parse().ok())
}

/// Request body for `POST /events`.
#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    #[serde(default)]
    pub source: String,
    #[serde(default, rename = "type")]
    pub event_type: String,
    /// Event time; ingestion time when omitted.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Must be a JSON object. `null` counts as absent.
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Handler for `GET /events`.
pub async fn list_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<EventView>>, ApiError> {
    let filter = ListEventsQuery::from_pairs(pairs).into_filter();
    let events = state.store.list(filter).await?;
    Ok(Json(events.into_iter().map(EventView::from).collect()))
}

/// Handler for `GET /events/{id}`.
pub async fn get_event_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<EventView>, ApiError> {
    let event = state.store.get_by_id(&id).await?;
    Ok(Json(event.into()))
}

/// Handler for `POST /events`.
///
/// Responds with the post-update view, so a repeat submission reports the
/// folded `count`.
pub async fn create_event_handler(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<CreateEventRequest>, JsonRejection>,
) -> Result<Json<EventView>, ApiError> {
    let Json(request) = body.map_err(|rejection| {
        tracing::debug!(%rejection, "rejected event body");
        ApiError::BadRequest("invalid JSON format".to_string())
    })?;

    let payload = match request.payload {
        Some(payload) if !request.source.is_empty() && !request.event_type.is_empty() => payload,
        _ => {
            return Err(ApiError::BadRequest(
                "source, type and payload are required".to_string(),
            ))
        }
    };

    let event = NewEvent {
        source: request.source,
        event_type: request.event_type,
        timestamp: request.timestamp,
        payload,
    };

    let record = state.store.upsert(event).await?;
    Ok(Json(record.into()))
}

//! Bulk ingest: `POST /api/log`.
//!
//! The handler owns the raw body bytes so that signature verification runs
//! over exactly what the client signed, before any JSON parsing. The body
//! size cap is enforced by the HTTP layer (`DefaultBodyLimit`) before this
//! handler is reached.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::{
    auth,
    error::AppError,
    event::{self, IngestBody, NewLogRow},
    server::AppState,
    store::Store,
};

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub received: usize,
    pub processed: u64,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

const INSERT_LOGS: &str = "INSERT INTO logs \
    (project_id, ts, level, message, source, env, ctx_json, user_id, request_id, tags, \
     fingerprint, day_id, created_at) ";

pub async fn ingest(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let project = auth::authenticate_api(&state.registry, &state.config, &headers, &body).await?;

    let address_gauge = state
        .limiter
        .check_address(addr.ip(), state.config.rate_limit_per_ip)
        .await?;
    let tenant_gauge = state.limiter.check_tenant(&project).await?;

    let events = serde_json::from_slice::<IngestBody>(&body)
        .map_err(|e| AppError::InvalidEventData(format!("invalid event batch: {}", e)))?
        .into_events();

    let request_id = uuid::Uuid::new_v4().to_string();

    if events.len() > state.config.max_events_per_post {
        return Err(AppError::TooManyEvents {
            got: events.len(),
            max: state.config.max_events_per_post,
        });
    }

    // An empty batch is a no-op, not an error.
    if events.is_empty() {
        let response = IngestResponse {
            received: 0,
            processed: 0,
            request_id,
        };
        return Ok(with_rate_headers(response, &[address_gauge, tenant_gauge]));
    }

    for (index, event) in events.iter().enumerate() {
        event::validate_event(event)
            .map_err(|reason| AppError::InvalidEventData(format!("event {}: {}", index, reason)))?;
    }

    let now_ms = event::now_millis();
    let rows: Vec<NewLogRow> = events
        .iter()
        .map(|e| event::derive_row(e, project.id, &project.slug, now_ms))
        .collect();

    let inserted = state
        .store
        .bulk_insert(INSERT_LOGS, &rows, |mut b, row| {
            b.push_bind(row.project_id)
                .push_bind(row.ts)
                .push_bind(row.level.as_str())
                .push_bind(row.message.as_str())
                .push_bind(row.source.as_str())
                .push_bind(row.env.as_str())
                .push_bind(row.ctx_json.as_deref())
                .push_bind(row.user_id.as_deref())
                .push_bind(row.request_id.as_deref())
                .push_bind(row.tags.as_deref())
                .push_bind(row.fingerprint.as_str())
                .push_bind(row.day_id)
                .push_bind(row.created_at);
        })
        .await?;

    tracing::info!(
        project = %project.slug,
        received = events.len(),
        processed = inserted.affected,
        request_id = %request_id,
        "batch ingested"
    );

    // Post-insert bookkeeping must never fail the request.
    if let Err(e) = state
        .limiter
        .record_activity(project.id, inserted.affected as i64)
        .await
    {
        tracing::error!(error = %e, "activity counter update failed");
    }
    if let Err(e) = track_fingerprints(&state.store, project.id, &rows, now_ms).await {
        tracing::error!(error = %e, "fingerprint tracker update failed");
    }

    state.maintenance.maybe_trigger();

    let response = IngestResponse {
        received: events.len(),
        processed: inserted.affected,
        request_id,
    };
    Ok(with_rate_headers(response, &[address_gauge, tenant_gauge]))
}

fn with_rate_headers(
    body: IngestResponse,
    gauges: &[crate::rate_limit::TierGauge],
) -> Response {
    let mut response = (StatusCode::OK, Json(body)).into_response();
    for gauge in gauges {
        gauge.apply(response.headers_mut());
    }
    response
}

/// Roll each distinct fingerprint of the batch into its tracker: bump the
/// rolling count within the current minute, reset it on a new minute.
async fn track_fingerprints(
    store: &Store,
    project_id: i64,
    rows: &[NewLogRow],
    now_ms: i64,
) -> Result<(), AppError> {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for row in rows {
        *counts.entry(row.fingerprint.as_str()).or_default() += 1;
    }

    let minute = now_ms / 60_000;
    for (fingerprint, count) in counts {
        store
            .exec(
                sqlx::query(
                    "INSERT INTO fingerprint_trackers \
                     (project_id, fingerprint, last_seen, minute_utc, minute_count) \
                     VALUES (?, ?, ?, ?, ?) \
                     ON CONFLICT (project_id, fingerprint) DO UPDATE SET \
                     minute_count = CASE \
                         WHEN fingerprint_trackers.minute_utc = excluded.minute_utc \
                         THEN fingerprint_trackers.minute_count + excluded.minute_count \
                         ELSE excluded.minute_count END, \
                     minute_utc = excluded.minute_utc, \
                     last_seen = excluded.last_seen",
                )
                .bind(project_id)
                .bind(fingerprint)
                .bind(now_ms)
                .bind(minute)
                .bind(count),
            )
            .await?;
    }

    Ok(())
}

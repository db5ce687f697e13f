//! Tenant-scoped log reads: filter, paginate, newest first.

use serde::Serialize;
use sqlx::Row;

use crate::{
    error::AppError,
    event::millis_to_rfc3339,
    store::Store,
};

pub const DEFAULT_QUERY_LIMIT: i64 = 100;
pub const MAX_QUERY_LIMIT: i64 = 1000;

/// Filter for tenant-scoped log queries. `since` is unix milliseconds.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<String>,
    pub since: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// A stored log row as returned to clients. Timestamps are RFC-3339 strings;
/// `ctx` is parsed back out of its stored JSON text.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub ts: String,
    pub level: String,
    pub message: String,
    pub source: String,
    pub env: String,
    pub ctx: Option<serde_json::Value>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub tags: Option<String>,
    pub fingerprint: String,
    pub day_id: i64,
    pub created_at: String,
}

/// Run a filtered, paginated query for one tenant, ordered `created_at DESC`.
/// All user input is parameter-bound; the limit is clamped to
/// [`MAX_QUERY_LIMIT`].
pub async fn query_logs(
    store: &Store,
    project_id: i64,
    filter: &LogFilter,
) -> Result<Vec<LogRecord>, AppError> {
    let limit = filter
        .limit
        .unwrap_or(DEFAULT_QUERY_LIMIT)
        .clamp(1, MAX_QUERY_LIMIT);
    let offset = filter.offset.unwrap_or(0).max(0);

    let mut sql = String::from(
        "SELECT id, ts, level, message, source, env, ctx_json, user_id, request_id, tags, \
         fingerprint, day_id, created_at \
         FROM logs WHERE project_id = ?",
    );
    if filter.level.is_some() {
        sql.push_str(" AND level = ?");
    }
    if filter.since.is_some() {
        sql.push_str(" AND created_at >= ?");
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query(&sql).bind(project_id);
    if let Some(level) = &filter.level {
        query = query.bind(level);
    }
    if let Some(since) = filter.since {
        query = query.bind(since);
    }
    query = query.bind(limit).bind(offset);

    let rows = store.query(query).await?;

    Ok(rows
        .into_iter()
        .map(|row| LogRecord {
            id: row.get("id"),
            ts: millis_to_rfc3339(row.get("ts")),
            level: row.get("level"),
            message: row.get("message"),
            source: row.get("source"),
            env: row.get("env"),
            ctx: row
                .get::<Option<String>, _>("ctx_json")
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            user_id: row.get("user_id"),
            request_id: row.get("request_id"),
            tags: row.get("tags"),
            fingerprint: row.get("fingerprint"),
            day_id: row.get("day_id"),
            created_at: millis_to_rfc3339(row.get("created_at")),
        })
        .collect())
}

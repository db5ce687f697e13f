//! Tenant-scoped log retrieval: `GET /api/log`.
//!
//! The signed material for a GET is the raw query string exactly as sent
//! (empty when absent), so the handler takes both the raw and the parsed
//! form of the query.

use axum::{
    extract::{ConnectInfo, Query, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::{
    auth,
    error::AppError,
    event,
    query::{self, LogFilter, LogRecord},
    server::AppState,
};

#[derive(Debug, Deserialize)]
pub struct LogQueryParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub level: Option<String>,
    pub since: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub total: usize,
    pub logs: Vec<LogRecord>,
}

pub async fn query_logs(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<LogQueryParams>,
) -> Result<Response, AppError> {
    let signed_material = raw_query.unwrap_or_default();
    let project = auth::authenticate_api(
        &state.registry,
        &state.config,
        &headers,
        signed_material.as_bytes(),
    )
    .await?;

    let address_gauge = state
        .limiter
        .check_address(addr.ip(), state.config.rate_limit_per_ip)
        .await?;
    let tenant_gauge = state.limiter.check_tenant(&project).await?;

    let filter = build_filter(&params)?;
    let logs = query::query_logs(&state.store, project.id, &filter).await?;

    let body = LogsResponse {
        total: logs.len(),
        logs,
    };

    let mut response = (StatusCode::OK, Json(body)).into_response();
    address_gauge.apply(response.headers_mut());
    tenant_gauge.apply(response.headers_mut());
    Ok(response)
}

fn build_filter(params: &LogQueryParams) -> Result<LogFilter, AppError> {
    if let Some(level) = params.level.as_deref() {
        if !event::is_valid_level(level) {
            return Err(AppError::InvalidEventData(format!(
                "unknown level '{}'",
                level
            )));
        }
    }

    let since = match params.since.as_deref() {
        None => None,
        Some(raw) => Some(event::parse_rfc3339_millis(raw).ok_or_else(|| {
            AppError::InvalidEventData(format!("'since' is not a valid RFC-3339 timestamp: {}", raw))
        })?),
    };

    Ok(LogFilter {
        level: params.level.clone(),
        since,
        limit: params.limit,
        offset: params.offset,
    })
}

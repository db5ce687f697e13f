//! Minimal operator surface for managing tenants. Admin-token
//! authenticated; subject to the address rate tier only, since no tenant is
//! resolved on these routes.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::{
    auth,
    error::AppError,
    registry::NewProject,
    server::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub slug: Option<String>,
    pub name: Option<String>,
    pub retention_days: Option<i64>,
    pub minute_cap: Option<i64>,
}

/// Creation response; the only place the plaintext key ever appears.
#[derive(Debug, Serialize)]
pub struct CreateProjectResponse {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub api_key: String,
    pub retention_days: i64,
    pub minute_cap: i64,
}

#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub retention_days: i64,
    pub minute_cap: i64,
}

#[derive(Debug, Serialize)]
pub struct DeleteProjectResponse {
    pub deleted: bool,
}

async fn authorize(
    state: &AppState,
    addr: SocketAddr,
    headers: &HeaderMap,
) -> Result<(), AppError> {
    state
        .limiter
        .check_address_generic(addr.ip(), state.config.rate_limit_per_ip)
        .await?;
    auth::authorize_admin(&state.config, headers)
}

pub async fn create_project(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CreateProjectResponse>, AppError> {
    authorize(&state, addr, &headers).await?;

    let request: CreateProjectRequest =
        serde_json::from_slice(&body).map_err(|_| AppError::ProjectRequired)?;

    let slug = request.slug.filter(|s| !s.is_empty());
    let name = request.name.filter(|n| !n.is_empty());
    let (Some(slug), Some(name)) = (slug, name) else {
        return Err(AppError::ProjectRequired);
    };

    let retention_days = request
        .retention_days
        .unwrap_or(state.config.default_retention_days)
        .max(1);
    let minute_cap = request
        .minute_cap
        .unwrap_or(state.config.rate_limit_per_minute)
        .max(1);

    let created = state
        .registry
        .create(NewProject {
            slug,
            name,
            retention_days,
            minute_cap,
        })
        .await?;

    tracing::info!(
        project = %created.project.slug,
        id = created.project.id,
        "project created"
    );

    Ok(Json(CreateProjectResponse {
        id: created.project.id,
        slug: created.project.slug,
        name: created.project.name,
        api_key: created.api_key,
        retention_days: created.project.retention_days,
        minute_cap: created.project.minute_cap,
    }))
}

pub async fn list_projects(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProjectSummary>>, AppError> {
    authorize(&state, addr, &headers).await?;

    let projects = state.registry.list().await?;
    Ok(Json(
        projects
            .into_iter()
            .map(|p| ProjectSummary {
                id: p.id,
                slug: p.slug,
                name: p.name,
                retention_days: p.retention_days,
                minute_cap: p.minute_cap,
            })
            .collect(),
    ))
}

pub async fn delete_project(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<DeleteProjectResponse>, AppError> {
    authorize(&state, addr, &headers).await?;

    let deleted = state.registry.delete(id).await?;
    if deleted {
        tracing::info!(id, "project deleted");
    }

    Ok(Json(DeleteProjectResponse { deleted }))
}

//! Tenant registry: lookup by API-key hash plus the admin-facing project
//! operations. Plaintext keys exist only in the creation response; the store
//! keeps their SHA-256.

use rand::RngCore;
use serde::Serialize;
use sqlx::Row;
use std::time::Duration;

use crate::{
    auth,
    error::AppError,
    event::now_millis,
    store::Store,
};

/// A tenant of the ingest API.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: i64,
    pub slug: String,
    pub name: String,
    #[serde(skip)]
    pub api_key_hash: String,
    pub retention_days: i64,
    pub minute_cap: i64,
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub slug: String,
    pub name: String,
    pub retention_days: i64,
    pub minute_cap: i64,
}

/// Creation result; `api_key` is returned exactly once and not recoverable.
#[derive(Debug, Clone)]
pub struct CreatedProject {
    pub project: Project,
    pub api_key: String,
}

#[derive(Clone)]
pub struct Registry {
    store: Store,
    lookup_timeout: Duration,
}

const SELECT_PROJECT: &str =
    "SELECT id, slug, name, api_key_hash, retention_days, minute_cap FROM projects";

impl Registry {
    pub fn new(store: Store, lookup_timeout: Duration) -> Self {
        Self {
            store,
            lookup_timeout,
        }
    }

    /// Resolve a tenant from an API-key hash.
    ///
    /// Bounded by the lookup timeout; a slow or failing store surfaces as
    /// the auth-unavailable error, distinct from "not found".
    pub async fn find_by_key_hash(&self, key_hash: &str) -> Result<Option<Project>, AppError> {
        let sql = format!("{} WHERE api_key_hash = ?", SELECT_PROJECT);
        let query = sqlx::query(&sql).bind(key_hash);

        match tokio::time::timeout(self.lookup_timeout, self.store.query_one(query)).await {
            Err(_) => Err(AppError::AuthUnavailable(
                "tenant lookup timed out".to_string(),
            )),
            Ok(Err(e)) => Err(AppError::AuthUnavailable(e.to_string())),
            Ok(Ok(row)) => Ok(row.map(project_from_row)),
        }
    }

    /// Create a tenant. Generates a 64-hex-char plaintext key and stores
    /// only its SHA-256.
    pub async fn create(&self, new: NewProject) -> Result<CreatedProject, AppError> {
        let api_key = generate_api_key();
        let api_key_hash = auth::sha256_hex(api_key.as_bytes());
        let now = now_millis();

        let result = self
            .store
            .insert(
                sqlx::query(
                    "INSERT INTO projects \
                     (slug, name, api_key_hash, retention_days, minute_cap, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&new.slug)
                .bind(&new.name)
                .bind(&api_key_hash)
                .bind(new.retention_days)
                .bind(new.minute_cap)
                .bind(now)
                .bind(now),
            )
            .await?;

        Ok(CreatedProject {
            project: Project {
                id: result.last_insert_rowid(),
                slug: new.slug,
                name: new.name,
                api_key_hash,
                retention_days: new.retention_days,
                minute_cap: new.minute_cap,
            },
            api_key,
        })
    }

    pub async fn list(&self) -> Result<Vec<Project>, AppError> {
        let sql = format!("{} ORDER BY id", SELECT_PROJECT);
        let rows = self.store.query(sqlx::query(&sql)).await?;
        Ok(rows.into_iter().map(project_from_row).collect())
    }

    /// Delete a tenant and everything that hangs off it. Logs and trackers
    /// cascade through foreign keys; minute counters are keyed by stringified
    /// id and cleared in the same transaction. Returns whether a row existed.
    pub async fn delete(&self, id: i64) -> Result<bool, AppError> {
        self.store
            .with_tx(move |conn| {
                Box::pin(async move {
                    sqlx::query(
                        "DELETE FROM project_minute_counters \
                         WHERE kind IN ('tenant', 'activity') AND key = ?",
                    )
                    .bind(id.to_string())
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| AppError::QueryFailed(e.to_string()))?;

                    let result = sqlx::query("DELETE FROM projects WHERE id = ?")
                        .bind(id)
                        .execute(&mut *conn)
                        .await
                        .map_err(|e| AppError::QueryFailed(e.to_string()))?;

                    Ok(result.rows_affected() > 0)
                })
            })
            .await
    }
}

fn project_from_row(row: sqlx::sqlite::SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        slug: row.get("slug"),
        name: row.get("name"),
        api_key_hash: row.get("api_key_hash"),
        retention_days: row.get("retention_days"),
        minute_cap: row.get("minute_cap"),
    }
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

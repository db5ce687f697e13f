//! On-path maintenance: housekeeping triggered by serving requests instead
//! of an external cron.
//!
//! Two gates serialise the work. A process-local clock (claimed with a
//! compare-and-swap *before* the task is spawned) keeps one process from
//! triggering more than once per interval; a store-wide singleton flag keeps
//! multiple instances from running concurrently and doubles as a lease: a
//! flag stuck longer than the stale interval is reclaimed by the next
//! trigger. Every step is a `DELETE ... WHERE < cutoff`, so partial progress
//! and repeats are safe.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::{
    error::AppError,
    event::{day_id_days_ago, now_millis},
    rate_limit::{ACTIVITY_KEEP_MINUTES, KIND_ACTIVITY, KIND_ADDRESS, KIND_TENANT, RATE_WINDOW_KEEP_MINUTES},
    store::Store,
};

/// Minimum interval between triggers within one process.
pub const TRIGGER_INTERVAL_SECS: i64 = 5 * 60;
/// An `in_progress` flag older than this is treated as a crashed pass.
pub const STALE_LOCK_SECS: i64 = 10 * 60;
/// Fingerprint trackers idle longer than this are dropped.
const TRACKER_IDLE_MS: i64 = 24 * 60 * 60 * 1000;

pub struct Maintenance {
    store: Store,
    default_retention_days: i64,
    /// Unix seconds of the last in-process trigger.
    last_triggered: AtomicI64,
}

impl Maintenance {
    pub fn new(store: Store, default_retention_days: i64) -> Self {
        // Start the clock at boot: the first pass becomes due one interval
        // after startup rather than on the very first request.
        Self {
            store,
            default_retention_days,
            last_triggered: AtomicI64::new(chrono::Utc::now().timestamp()),
        }
    }

    /// Called at the end of a successful ingest. Returns immediately; the
    /// maintenance pass, if due, runs on its own task and never delays the
    /// response.
    pub fn maybe_trigger(self: &Arc<Self>) {
        let now = chrono::Utc::now().timestamp();
        let last = self.last_triggered.load(Ordering::Acquire);

        if now - last < TRIGGER_INTERVAL_SECS {
            return;
        }

        // Claim the clock before spawning; a lost race means another request
        // in this process already took the trigger.
        if self
            .last_triggered
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run().await;
        });
    }

    /// Execute one maintenance pass. Each step tolerates failure; errors are
    /// logged and never reach any request.
    pub async fn run(&self) {
        if !self.claim().await {
            tracing::debug!("maintenance already in progress elsewhere, skipping");
            return;
        }

        self.expire_rate_counters().await;
        self.expire_activity_counters().await;
        self.purge_expired_logs().await;
        self.expire_trackers().await;

        self.release().await;
    }

    /// Claim the store-wide flag. The stale branch reclaims a flag left set
    /// by a crashed pass.
    async fn claim(&self) -> bool {
        let now = now_millis();
        let stale_before = now - STALE_LOCK_SECS * 1000;

        let result = self
            .store
            .exec(
                sqlx::query(
                    "UPDATE maintenance_state SET in_progress = 1, last_maintenance = ? \
                     WHERE id = 1 AND (in_progress = 0 \
                     OR last_maintenance IS NULL OR last_maintenance < ?)",
                )
                .bind(now)
                .bind(stale_before),
            )
            .await;

        match result {
            Ok(r) => r.rows_affected() == 1,
            Err(e) => {
                tracing::error!(error = %e, "maintenance claim failed");
                false
            }
        }
    }

    async fn release(&self) {
        let result = self
            .store
            .exec(
                sqlx::query(
                    "UPDATE maintenance_state SET in_progress = 0, last_maintenance = ? \
                     WHERE id = 1",
                )
                .bind(now_millis()),
            )
            .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "maintenance release failed");
        }
    }

    async fn expire_rate_counters(&self) {
        let cutoff = chrono::Utc::now().timestamp() / 60 - RATE_WINDOW_KEEP_MINUTES;
        let result = self
            .store
            .exec(
                sqlx::query(
                    "DELETE FROM project_minute_counters \
                     WHERE kind IN (?, ?) AND minute_utc < ?",
                )
                .bind(KIND_TENANT)
                .bind(KIND_ADDRESS)
                .bind(cutoff),
            )
            .await;

        log_step("rate counter expiry", result);
    }

    async fn expire_activity_counters(&self) {
        let cutoff = chrono::Utc::now().timestamp() / 60 - ACTIVITY_KEEP_MINUTES;
        let result = self
            .store
            .exec(
                sqlx::query(
                    "DELETE FROM project_minute_counters WHERE kind = ? AND minute_utc < ?",
                )
                .bind(KIND_ACTIVITY)
                .bind(cutoff),
            )
            .await;

        log_step("activity counter expiry", result);
    }

    /// Drop log rows past each tenant's retention horizon. Buckets make this
    /// a handful of range deletes; the per-tenant loop runs in one
    /// transaction so a failing project leaves no half-applied purge.
    async fn purge_expired_logs(&self) {
        let default_retention = self.default_retention_days;

        let result = self
            .store
            .with_tx(move |conn| {
                Box::pin(async move {
                    let projects: Vec<(i64, i64)> =
                        sqlx::query_as("SELECT id, retention_days FROM projects")
                            .fetch_all(&mut *conn)
                            .await
                            .map_err(|e| AppError::QueryFailed(e.to_string()))?;

                    let mut purged = 0u64;
                    for (project_id, retention_days) in projects {
                        let retention = if retention_days >= 1 {
                            retention_days
                        } else {
                            default_retention
                        };
                        let Some(cutoff_day) = day_id_days_ago(retention) else {
                            continue;
                        };

                        let deleted = sqlx::query(
                            "DELETE FROM logs WHERE project_id = ? AND day_id < ?",
                        )
                        .bind(project_id)
                        .bind(cutoff_day)
                        .execute(&mut *conn)
                        .await
                        .map_err(|e| AppError::QueryFailed(e.to_string()))?;

                        purged += deleted.rows_affected();
                    }

                    Ok(purged)
                })
            })
            .await;

        match result {
            Ok(purged) => tracing::info!(purged, "retention purge complete"),
            Err(e) => tracing::error!(error = %e, "retention purge failed"),
        }
    }

    async fn expire_trackers(&self) {
        let cutoff = now_millis() - TRACKER_IDLE_MS;
        let result = self
            .store
            .exec(sqlx::query("DELETE FROM fingerprint_trackers WHERE last_seen < ?").bind(cutoff))
            .await;

        log_step("fingerprint tracker expiry", result);
    }

    #[cfg(test)]
    fn set_last_triggered(&self, unix_secs: i64) {
        self.last_triggered.store(unix_secs, Ordering::Release);
    }
}

fn log_step(step: &str, result: Result<sqlx::sqlite::SqliteQueryResult, AppError>) {
    match result {
        Ok(r) => tracing::debug!(step, deleted = r.rows_affected(), "maintenance step complete"),
        Err(e) => tracing::error!(step, error = %e, "maintenance step failed"),
    }
}

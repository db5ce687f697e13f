//! Two-tier per-minute rate limiting over the shared store.
//!
//! Counters live in `project_minute_counters`, keyed `(kind, key, minute)`.
//! Each hit is a single atomic upsert-increment that reads the new count
//! back in the same statement, so concurrent requests observe consistent,
//! monotone counts without any process-local lock. Expired buckets are
//! removed by the maintenance task.

use axum::http::{HeaderMap, HeaderValue};
use sqlx::Row;
use std::net::IpAddr;

use crate::{error::AppError, registry::Project, store::Store};

/// Counter kinds sharing the table: the two rate tiers plus the per-tenant
/// ingest-volume series kept for the dashboard.
pub const KIND_TENANT: &str = "tenant";
pub const KIND_ADDRESS: &str = "address";
pub const KIND_ACTIVITY: &str = "activity";

/// Rate-tier buckets older than this many minutes are purge-eligible.
pub const RATE_WINDOW_KEEP_MINUTES: i64 = 2;
/// Activity buckets are kept for two hours.
pub const ACTIVITY_KEEP_MINUTES: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Address,
    Tenant,
}

impl Tier {
    fn kind(self) -> &'static str {
        match self {
            Self::Address => KIND_ADDRESS,
            Self::Tenant => KIND_TENANT,
        }
    }

    fn limit_header(self) -> &'static str {
        match self {
            Self::Address => "x-ratelimit-limit-address",
            Self::Tenant => "x-ratelimit-limit-tenant",
        }
    }

    fn remaining_header(self) -> &'static str {
        match self {
            Self::Address => "x-ratelimit-remaining-address",
            Self::Tenant => "x-ratelimit-remaining-tenant",
        }
    }

    fn reset_header(self) -> &'static str {
        match self {
            Self::Address => "x-ratelimit-reset-address",
            Self::Tenant => "x-ratelimit-reset-tenant",
        }
    }
}

/// Observed counter state for one tier within the current minute; the source
/// of the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy)]
pub struct TierGauge {
    pub tier: Tier,
    pub cap: i64,
    pub count: i64,
    pub minute: i64,
}

impl TierGauge {
    pub fn remaining(&self) -> i64 {
        (self.cap - self.count).max(0)
    }

    /// Unix second at which the current minute bucket rolls over.
    pub fn reset_epoch(&self) -> i64 {
        (self.minute + 1) * 60
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(self.tier.limit_header(), HeaderValue::from(self.cap));
        headers.insert(
            self.tier.remaining_header(),
            HeaderValue::from(self.remaining()),
        );
        headers.insert(self.tier.reset_header(), HeaderValue::from(self.reset_epoch()));
    }
}

pub fn current_minute() -> i64 {
    chrono::Utc::now().timestamp() / 60
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Store,
}

impl RateLimiter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Address tier: keyed by source IP. Exceeding the cap on an API route
    /// is `IP_RATE_LIMIT_EXCEEDED`; admin routes (no tenant resolved) use
    /// the generic code.
    pub async fn check_address(&self, ip: IpAddr, cap: i64) -> Result<TierGauge, AppError> {
        let gauge = self.hit(Tier::Address, &ip.to_string(), cap).await?;
        if gauge.count > cap {
            tracing::warn!(ip = %ip, count = gauge.count, cap, "address rate limit exceeded");
            return Err(AppError::IpRateLimited);
        }
        Ok(gauge)
    }

    pub async fn check_address_generic(&self, ip: IpAddr, cap: i64) -> Result<TierGauge, AppError> {
        match self.check_address(ip, cap).await {
            Err(AppError::IpRateLimited) => Err(AppError::RateLimited),
            other => other,
        }
    }

    /// Tenant tier: keyed by project id, capped by the tenant's own
    /// per-minute cap.
    pub async fn check_tenant(&self, project: &Project) -> Result<TierGauge, AppError> {
        let gauge = self
            .hit(Tier::Tenant, &project.id.to_string(), project.minute_cap)
            .await?;
        if gauge.count > project.minute_cap {
            tracing::warn!(
                project = %project.slug,
                count = gauge.count,
                cap = project.minute_cap,
                "tenant rate limit exceeded"
            );
            return Err(AppError::ProjectRateLimited);
        }
        Ok(gauge)
    }

    /// Record ingest volume for a tenant's activity series. Not a limit;
    /// failures are logged and swallowed by the caller.
    pub async fn record_activity(&self, project_id: i64, events: i64) -> Result<(), AppError> {
        let minute = current_minute();
        self.store
            .exec(
                sqlx::query(
                    "INSERT INTO project_minute_counters (kind, key, minute_utc, count) \
                     VALUES (?, ?, ?, ?) \
                     ON CONFLICT (kind, key, minute_utc) DO UPDATE SET count = count + excluded.count",
                )
                .bind(KIND_ACTIVITY)
                .bind(project_id.to_string())
                .bind(minute)
                .bind(events),
            )
            .await?;
        Ok(())
    }

    /// Atomic increment-and-read for one `(kind, key, minute)` bucket.
    async fn hit(&self, tier: Tier, key: &str, cap: i64) -> Result<TierGauge, AppError> {
        let minute = current_minute();

        let row = self
            .store
            .query_one(
                sqlx::query(
                    "INSERT INTO project_minute_counters (kind, key, minute_utc, count) \
                     VALUES (?, ?, ?, 1) \
                     ON CONFLICT (kind, key, minute_utc) DO UPDATE SET count = count + 1 \
                     RETURNING count",
                )
                .bind(tier.kind())
                .bind(key)
                .bind(minute),
            )
            .await?
            .ok_or_else(|| AppError::QueryFailed("counter upsert returned no row".to_string()))?;

        Ok(TierGauge {
            tier,
            cap,
            count: row.get("count"),
            minute,
        })
    }
}

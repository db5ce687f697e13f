//! Wire model for submitted log events, per-event validation, and the
//! derivation of stored rows (timestamps, day buckets, fingerprints).

use chrono::{DateTime, Datelike, Days, Local, NaiveDate, Utc};
use serde::Deserialize;
use sha1::{Digest, Sha1};

pub const MAX_MESSAGE_CHARS: usize = 1024;
pub const MAX_SOURCE_CHARS: usize = 64;
pub const MAX_ENV_CHARS: usize = 32;
pub const MAX_ID_CHARS: usize = 64;
pub const MAX_TAGS_CHARS: usize = 128;

pub const DEFAULT_ENV: &str = "production";

const LEVELS: [&str; 5] = ["debug", "info", "warn", "error", "fatal"];

/// A single submitted event. All fields optional on the wire so that
/// validation can report the first offending event by index instead of
/// failing the whole-body parse.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogEvent {
    pub ts: Option<String>,
    pub level: Option<String>,
    pub message: Option<String>,
    pub source: Option<String>,
    pub env: Option<String>,
    pub ctx: Option<serde_json::Value>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub tags: Option<String>,
}

/// Ingest request body. Clients send `{"events": [...]}`; a bare array is
/// also accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestBody {
    Wrapped { events: Vec<LogEvent> },
    Bare(Vec<LogEvent>),
}

impl IngestBody {
    pub fn into_events(self) -> Vec<LogEvent> {
        match self {
            Self::Wrapped { events } => events,
            Self::Bare(events) => events,
        }
    }
}

/// A fully derived row, ready for the bulk insert.
#[derive(Debug, Clone)]
pub struct NewLogRow {
    pub project_id: i64,
    pub ts: i64,
    pub level: String,
    pub message: String,
    pub source: String,
    pub env: String,
    pub ctx_json: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub tags: Option<String>,
    pub fingerprint: String,
    pub day_id: i64,
    pub created_at: i64,
}

pub fn is_valid_level(level: &str) -> bool {
    LEVELS.contains(&level)
}

/// Validate one event against the schema. Returns the reason for the first
/// violation found, without an event index; the caller adds it.
pub fn validate_event(event: &LogEvent) -> Result<(), String> {
    match event.level.as_deref() {
        None => return Err("missing required field 'level'".to_string()),
        Some(level) if !is_valid_level(level) => {
            return Err(format!("unknown level '{}'", level));
        }
        Some(_) => {}
    }

    match event.message.as_deref() {
        None | Some("") => return Err("missing required field 'message'".to_string()),
        Some(_) => {}
    }

    if let Some(ts) = event.ts.as_deref() {
        if parse_rfc3339_millis(ts).is_none() {
            return Err(format!("'ts' is not a valid RFC-3339 timestamp: {}", ts));
        }
    }

    if let Some(ctx) = &event.ctx {
        if !ctx.is_object() {
            return Err("'ctx' must be a JSON object".to_string());
        }
    }

    if event.user_id.as_deref().is_some_and(|v| v.chars().count() > MAX_ID_CHARS) {
        return Err(format!("'user_id' exceeds {} characters", MAX_ID_CHARS));
    }

    if event
        .request_id
        .as_deref()
        .is_some_and(|v| v.chars().count() > MAX_ID_CHARS)
    {
        return Err(format!("'request_id' exceeds {} characters", MAX_ID_CHARS));
    }

    if event.tags.as_deref().is_some_and(|v| v.chars().count() > MAX_TAGS_CHARS) {
        return Err(format!("'tags' exceeds {} characters", MAX_TAGS_CHARS));
    }

    Ok(())
}

/// Derive the stored row for a validated event.
///
/// `day_id` follows the server wall clock, not the client `ts`: a backfilled
/// timestamp must not make a fresh row immediately purge-eligible.
pub fn derive_row(event: &LogEvent, project_id: i64, tenant_slug: &str, now_ms: i64) -> NewLogRow {
    let message = event.message.as_deref().unwrap_or_default();
    let fingerprint = fingerprint(message, event.source.as_deref(), event.ctx.as_ref());

    let ts = event
        .ts
        .as_deref()
        .and_then(parse_rfc3339_millis)
        .unwrap_or(now_ms);

    let source = truncate_chars(event.source.as_deref().unwrap_or(tenant_slug), MAX_SOURCE_CHARS);
    let env = truncate_chars(event.env.as_deref().unwrap_or(DEFAULT_ENV), MAX_ENV_CHARS);

    NewLogRow {
        project_id,
        ts,
        level: event.level.clone().unwrap_or_default(),
        message: truncate_chars(message, MAX_MESSAGE_CHARS),
        source,
        env,
        ctx_json: event.ctx.as_ref().map(|c| c.to_string()),
        user_id: event.user_id.clone(),
        request_id: event.request_id.clone(),
        tags: event.tags.clone(),
        fingerprint,
        day_id: current_day_id(),
        created_at: now_ms,
    }
}

/// 16-hex-char prefix of SHA-1 over `message|source|ctx.stack`, computed over
/// the submitted fields; absent parts contribute empty strings. A clustering
/// hint, never an identity.
pub fn fingerprint(message: &str, source: Option<&str>, ctx: Option<&serde_json::Value>) -> String {
    let stack = ctx
        .and_then(|c| c.get("stack"))
        .and_then(|s| s.as_str())
        .unwrap_or_default();

    let mut hasher = Sha1::new();
    hasher.update(message.as_bytes());
    hasher.update(b"|");
    hasher.update(source.unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(stack.as_bytes());

    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn parse_rfc3339_millis(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

pub fn millis_to_rfc3339(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Integer YYYYMMDD bucket for a calendar date.
pub fn day_id_of(date: NaiveDate) -> i64 {
    date.year() as i64 * 10_000 + date.month() as i64 * 100 + date.day() as i64
}

/// Today's bucket in the server's wall-clock timezone.
pub fn current_day_id() -> i64 {
    day_id_of(Local::now().date_naive())
}

/// Bucket of the day `days` before today; `None` on calendar underflow.
pub fn day_id_days_ago(days: i64) -> Option<i64> {
    let days = u64::try_from(days).ok()?;
    Local::now()
        .date_naive()
        .checked_sub_days(Days::new(days))
        .map(day_id_of)
}

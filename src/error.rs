use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Seconds clients should wait after a rate-limit rejection.
pub const RETRY_AFTER_SECS: u64 = 60;

/// Application error taxonomy.
///
/// Every variant carries a stable machine code (`code()`) that clients key
/// on; the HTTP status follows the kind: 401 auth, 400 validation, 429 rate
/// limit, 500 infrastructure.
#[derive(Debug)]
pub enum AppError {
    // Authentication failures (401)
    ProjectKeyMissing,
    SignatureMissing,
    AdminTokenMissing,
    ProjectNotFound,
    SignatureInvalid,
    AdminTokenInvalid,
    /// The registry lookup itself failed or timed out.
    AuthUnavailable(String),

    // Validation failures (400)
    ProjectRequired,
    TooManyEvents { got: usize, max: usize },
    InvalidEventData(String),

    // Rate-limit failures (429)
    IpRateLimited,
    ProjectRateLimited,
    RateLimited,

    // Infrastructure failures (500)
    Internal(String),
    QueryFailed(String),
    InsertFailed(String),
    BulkInsertFailed(String),
    /// The store is unreachable (pool exhausted, connection lost, closed).
    StoreUnavailable(String),
}

impl AppError {
    /// Stable machine code returned in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProjectKeyMissing => "PROJECT_KEY_MISSING",
            Self::SignatureMissing => "SIGNATURE_MISSING",
            Self::AdminTokenMissing => "ADMIN_TOKEN_MISSING",
            Self::ProjectNotFound => "PROJECT_NOT_FOUND",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::AdminTokenInvalid => "ADMIN_TOKEN_INVALID",
            Self::AuthUnavailable(_) => "DATABASE_ERROR",
            Self::ProjectRequired => "PROJECT_REQUIRED",
            Self::TooManyEvents { .. } => "TOO_MANY_EVENTS",
            Self::InvalidEventData(_) => "INVALID_EVENT_DATA",
            Self::IpRateLimited => "IP_RATE_LIMIT_EXCEEDED",
            Self::ProjectRateLimited => "PROJECT_RATE_LIMIT_EXCEEDED",
            Self::RateLimited => "RATE_LIMIT_EXCEEDED",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::QueryFailed(_) => "DB_QUERY_FAILED",
            Self::InsertFailed(_) => "DB_INSERT_FAILED",
            Self::BulkInsertFailed(_) => "DB_BULK_INSERT_FAILED",
            Self::StoreUnavailable(_) => "DB_NOT_INITIALIZED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ProjectKeyMissing
            | Self::SignatureMissing
            | Self::AdminTokenMissing
            | Self::ProjectNotFound
            | Self::SignatureInvalid
            | Self::AdminTokenInvalid
            | Self::AuthUnavailable(_) => StatusCode::UNAUTHORIZED,
            Self::ProjectRequired | Self::TooManyEvents { .. } | Self::InvalidEventData(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::IpRateLimited | Self::ProjectRateLimited | Self::RateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::Internal(_)
            | Self::QueryFailed(_)
            | Self::InsertFailed(_)
            | Self::BulkInsertFailed(_)
            | Self::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Auth messages are uniform and never reveal
    /// which factor failed beyond the code; 5xx messages suppress internal
    /// detail entirely.
    fn public_message(&self) -> String {
        match self {
            Self::ProjectKeyMissing => "missing X-Project-Key header".to_string(),
            Self::SignatureMissing => "missing X-Signature header".to_string(),
            Self::AdminTokenMissing => "missing X-Admin-Token header".to_string(),
            Self::ProjectNotFound => "authentication failed".to_string(),
            Self::SignatureInvalid => "authentication failed".to_string(),
            Self::AdminTokenInvalid => "authentication failed".to_string(),
            Self::AuthUnavailable(_) => "authentication service unavailable".to_string(),
            Self::ProjectRequired => "project slug and name are required".to_string(),
            Self::TooManyEvents { got, max } => {
                format!("batch of {} events exceeds the limit of {}", got, max)
            }
            Self::InvalidEventData(msg) => msg.clone(),
            Self::IpRateLimited | Self::ProjectRateLimited | Self::RateLimited => {
                "rate limit exceeded, retry later".to_string()
            }
            Self::Internal(_)
            | Self::QueryFailed(_)
            | Self::InsertFailed(_)
            | Self::BulkInsertFailed(_)
            | Self::StoreUnavailable(_) => "internal server error".to_string(),
        }
    }

    /// Server-side detail, logged but never returned to clients.
    fn internal_detail(&self) -> Option<&str> {
        match self {
            Self::AuthUnavailable(msg)
            | Self::Internal(msg)
            | Self::QueryFailed(msg)
            | Self::InsertFailed(msg)
            | Self::BulkInsertFailed(msg)
            | Self::StoreUnavailable(msg) => Some(msg),
            _ => None,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.internal_detail() {
            Some(detail) => write!(f, "{}: {}", self.code(), detail),
            None => write!(f, "{}: {}", self.code(), self.public_message()),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = if status.is_server_error() {
            let error_id = uuid::Uuid::new_v4().to_string();
            tracing::error!(
                error_id = %error_id,
                code = self.code(),
                detail = self.internal_detail().unwrap_or_default(),
                "request failed"
            );
            json!({
                "error": self.public_message(),
                "code": self.code(),
                "errorId": error_id,
            })
        } else {
            json!({
                "error": self.public_message(),
                "code": self.code(),
            })
        };

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }

        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEventData(format!("invalid JSON body: {}", err))
    }
}

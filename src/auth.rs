//! Request authentication.
//!
//! API mode verifies a project key plus an HMAC-SHA-256 signature computed
//! over the raw request bytes, exactly as the client transmitted them; admin
//! mode verifies a shared token. Both comparisons are constant-time. The
//! checks are called from the top of each handler rather than from
//! middleware: the handler owns the body bytes before any JSON parsing, and
//! a deserialise-then-reserialise path would change whitespace and key order
//! and break verification.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{config::Config, error::AppError, registry::{Project, Registry}};

pub const PROJECT_KEY_HEADER: &str = "x-project-key";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

type HmacSha256 = Hmac<Sha256>;

/// Authenticate an API request: resolve the tenant from `X-Project-Key` and
/// verify `X-Signature` against `signed_material` (the raw body for mutating
/// methods, the raw query string for GET).
pub async fn authenticate_api(
    registry: &Registry,
    config: &Config,
    headers: &HeaderMap,
    signed_material: &[u8],
) -> Result<Project, AppError> {
    let project_key = header_value(headers, PROJECT_KEY_HEADER)
        .ok_or(AppError::ProjectKeyMissing)?;
    let signature = header_value(headers, SIGNATURE_HEADER)
        .ok_or(AppError::SignatureMissing)?;

    let key_hash = sha256_hex(project_key.as_bytes());
    let project = registry
        .find_by_key_hash(&key_hash)
        .await?
        .ok_or(AppError::ProjectNotFound)?;

    let expected = hmac_sha256_hex(config.hmac_secret.as_bytes(), signed_material);
    let provided = signature.to_ascii_lowercase();

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return Err(AppError::SignatureInvalid);
    }

    Ok(project)
}

/// Authorize a privileged request via `X-Admin-Token`.
pub fn authorize_admin(config: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    let token = header_value(headers, ADMIN_TOKEN_HEADER)
        .ok_or(AppError::AdminTokenMissing)?;

    if !constant_time_eq(config.admin_token.as_bytes(), token.as_bytes()) {
        return Err(AppError::AdminTokenInvalid);
    }

    Ok(())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Lowercase-hex HMAC-SHA-256 of `material` under `secret`.
pub fn hmac_sha256_hex(secret: &[u8], material: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret)
        .expect("HMAC accepts keys of any length");
    mac.update(material);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time byte comparison; a length mismatch is an immediate (and
/// safe) rejection since digest lengths are public.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// =============================================================================
// Bearer Token Authentication
// =============================================================================
//
// Every trading endpoint takes `AuthBearer`. The token is compared against
// `TRAILGUARD_ADMIN_TOKEN` in constant time; a missing or wrong token ends
// the request with 403 before the handler runs. With the variable unset no
// authenticated request is accepted.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

pub const ADMIN_TOKEN_VAR: &str = "TRAILGUARD_ADMIN_TOKEN";

/// Byte comparison whose running time does not depend on where the first
/// mismatch is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    NotConfigured,
    MissingToken,
    InvalidToken,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let message = match self {
            Self::NotConfigured => "server authentication not configured",
            Self::MissingToken => "missing or malformed bearer token",
            Self::InvalidToken => "invalid bearer token",
        };
        let body = serde_json::json!({ "error": message });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

/// Validate an `Authorization` header value against the expected token.
fn check_bearer(header: Option<&str>, expected: &str) -> Result<String, AuthRejection> {
    if expected.is_empty() {
        return Err(AuthRejection::NotConfigured);
    }
    let token = header
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthRejection::MissingToken)?;
    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        return Err(AuthRejection::InvalidToken);
    }
    Ok(token.to_string())
}

/// Proof that the request carried the admin token.
pub struct AuthBearer(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Read per request so a rotated token applies without a restart.
        let expected = std::env::var(ADMIN_TOKEN_VAR).unwrap_or_default();
        let header = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

        check_bearer(header, &expected).map(AuthBearer).map_err(|rejection| {
            warn!(path = %parts.uri.path(), ?rejection, "rejected API request");
            rejection
        })
    }
}

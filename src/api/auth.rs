// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// The expected token is read from the `VELA_API_TOKEN` environment variable.
// A paper-trading engine is often run locally without credentials, so an
// unset variable means open access; once the variable is set, every
// non-public endpoint requires the matching Bearer token.  Comparison is
// constant time.
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Compare two byte slices in constant time.  The comparison examines every
/// byte even after a mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Axum extractor validating `Authorization: Bearer <token>` against
/// `VELA_API_TOKEN`.  Yields the raw token (empty when auth is disabled).
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("VELA_API_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            return Ok(AuthBearer(String::new()));
        }

        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "Missing or invalid authorization token",
                });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid API token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid authorization token",
            });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

/// Query-parameter variant for WebSocket upgrades, where headers are awkward
/// for browser clients.
pub fn validate_token(token: &str) -> bool {
    let expected = std::env::var("VELA_API_TOKEN").unwrap_or_default();
    if expected.is_empty() {
        return true;
    }
    constant_time_eq(token.as_bytes(), expected.as_bytes())
}

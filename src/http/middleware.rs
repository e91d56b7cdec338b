//! Authentication middleware: player bearer tokens and the tick credential

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::app::AppState;
use crate::world::AccountId;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the shared operational credential of the tick trigger
pub const TICK_TOKEN_HEADER: &str = "X-Tick-Token";

/// Claims of a player bearer token (HS256)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Account id
    pub sub: AccountId,
    /// Audience
    #[serde(default)]
    pub aud: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: u64,
    #[serde(default)]
    pub role: Option<String>,
}

/// Verify a JWT token and extract claims
pub fn verify_jwt(token: &str, secret: &str, now_secs: u64) -> Result<JwtClaims, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::InvalidToken);
    }

    let header_b64 = parts[0];
    let payload_b64 = parts[1];
    let signature_b64 = parts[2];

    // Verify signature (HMAC-SHA256)
    let message = format!("{}.{}", header_b64, payload_b64);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidToken)?;
    mac.update(message.as_bytes());

    let provided_signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    mac.verify_slice(&provided_signature)
        .map_err(|_| AuthError::InvalidToken)?;

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    let claims: JwtClaims =
        serde_json::from_slice(&payload_json).map_err(|_| AuthError::InvalidToken)?;

    if claims.exp < now_secs {
        return Err(AuthError::TokenExpired);
    }

    Ok(claims)
}

/// Extract JWT from Authorization header
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header.strip_prefix("Bearer ")
}

/// Authentication error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingHeader,

    #[error("Invalid authorization header format")]
    InvalidFormat,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::InvalidFormat => StatusCode::BAD_REQUEST,
            _ => StatusCode::UNAUTHORIZED,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "code": "UNAUTHORIZED",
        });
        (status, Json(body)).into_response()
    }
}

/// Authenticated player, inserted into request extensions
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub account_id: AccountId,
    pub claims: JwtClaims,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Middleware to require a player bearer token
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or(AuthError::MissingHeader)?;

    let token = extract_bearer_token(auth_header).ok_or(AuthError::InvalidFormat)?;
    let claims = verify_jwt(token, &state.config.jwt_secret, unix_now())?;

    let auth_user = AuthenticatedUser {
        account_id: claims.sub,
        claims,
    };

    // Insert into request extensions for handlers to access
    request.extensions_mut().insert(auth_user);

    Ok(next.run(request).await)
}

/// Middleware guarding operational endpoints with the shared tick token
pub async fn require_tick_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let provided = request
        .headers()
        .get(TICK_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(AuthError::MissingHeader)?;

    if !constant_time_eq(provided.as_bytes(), state.config.tick_token.as_bytes()) {
        warn!("Rejected tick trigger with a bad credential");
        return Err(AuthError::InvalidToken);
    }

    Ok(next.run(request).await)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const SECRET: &str = "test-secret";

    fn sign(claims: &serde_json::Value, secret: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", header, payload).as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}.{}", header, payload, signature)
    }

    #[test]
    fn valid_token_yields_the_account() {
        let account = Uuid::new_v4();
        let token = sign(&serde_json::json!({ "sub": account, "exp": 2_000 }), SECRET);
        let claims = verify_jwt(&token, SECRET, 1_000).unwrap();
        assert_eq!(claims.sub, account);
    }

    #[test]
    fn rejects_bad_signature_and_expiry() {
        let claims = serde_json::json!({ "sub": Uuid::new_v4(), "exp": 2_000 });

        let forged = sign(&claims, "other-secret");
        assert!(matches!(verify_jwt(&forged, SECRET, 1_000), Err(AuthError::InvalidToken)));

        let token = sign(&claims, SECRET);
        assert!(matches!(verify_jwt(&token, SECRET, 3_000), Err(AuthError::TokenExpired)));
        assert!(matches!(verify_jwt("a.b", SECRET, 0), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn token_comparison() {
        assert!(constant_time_eq(b"tick", b"tick"));
        assert!(!constant_time_eq(b"tick", b"tock"));
        assert!(!constant_time_eq(b"tick", b"ticks"));
    }
}

//! Bearer-token authentication. Token issuance (login) is owned by an
//! external service; this module verifies HS256 JWTs against the shared
//! secret and resolves the caller's user id.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use mentora_schema::AppError;

use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// Mint a token; used by tests and operational tooling.
pub fn issue_token(secret: &str, user_id: i64, expiry_minutes: i64) -> String {
    let header = B64URL.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = Claims {
        sub: user_id.to_string(),
        exp: Utc::now().timestamp() + expiry_minutes * 60,
    };
    let payload = B64URL.encode(serde_json::to_vec(&claims).expect("claims serialize"));
    let signing_input = format!("{header}.{payload}");
    let signature = B64URL.encode(sign(secret, signing_input.as_bytes()));
    format!("{signing_input}.{signature}")
}

fn sign(secret: &str, input: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(input);
    mac.finalize().into_bytes().to_vec()
}

/// Verify a bearer token and return the subject user id.
pub fn verify_token(secret: &str, token: &str) -> Result<i64, AppError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AppError::Unauthenticated("malformed token".into()));
    };

    let signing_input = format!("{header}.{payload}");
    let expected = sign(secret, signing_input.as_bytes());
    let provided = B64URL
        .decode(signature)
        .map_err(|_| AppError::Unauthenticated("malformed token signature".into()))?;
    if expected.ct_eq(&provided).unwrap_u8() != 1 {
        return Err(AppError::Unauthenticated("invalid token signature".into()));
    }

    let claims: Claims = serde_json::from_slice(
        &B64URL
            .decode(payload)
            .map_err(|_| AppError::Unauthenticated("malformed token payload".into()))?,
    )
    .map_err(|_| AppError::Unauthenticated("malformed token claims".into()))?;

    if claims.exp < Utc::now().timestamp() {
        return Err(AppError::Unauthenticated("token expired".into()));
    }

    claims
        .sub
        .parse::<i64>()
        .map_err(|_| AppError::Unauthenticated("malformed token subject".into()))
}

/// Authenticated caller extracted from the `Authorization` header.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub i64);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = crate::error::ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthenticated("missing authorization header".into()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Unauthenticated("expected bearer token".into()))?;

        let user_id = verify_token(&state.config.auth.jwt_secret, token)?;
        Ok(AuthUser(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_verify_roundtrip() {
        let token = issue_token("secret", 42, 60);
        assert_eq!(verify_token("secret", &token).unwrap(), 42);
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_token("secret", 42, 60);
        let err = verify_token("other", &token).unwrap_err();
        assert_eq!(err.kind(), "unauthenticated");
    }

    #[test]
    fn expired_token_rejected() {
        let token = issue_token("secret", 42, -5);
        let err = verify_token("secret", &token).unwrap_err();
        assert!(err.detail().contains("expired"));
    }

    #[test]
    fn tampered_payload_rejected() {
        let token = issue_token("secret", 42, 60);
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = B64URL.encode(br#"{"sub":"1","exp":9999999999}"#);
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert!(verify_token("secret", &forged_token).is_err());
    }

    #[test]
    fn garbage_tokens_rejected() {
        assert!(verify_token("secret", "not-a-token").is_err());
        assert!(verify_token("secret", "a.b").is_err());
        assert!(verify_token("secret", "a.b.c.d").is_err());
    }
}

//! Bearer-token authentication.
//!
//! Tokens are issued externally; this server only verifies them and tags
//! the request with the caller's identity. Room-level privilege (the
//! storyteller) is decided against room state, not the token.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::common::UserId;

/// JWT claims - data stored in the token
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    /// Unique token identifier.
    pub jti: String,
}

/// Creates and verifies JWT tokens.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl JwtService {
    pub fn new(secret: &str, issuer: String) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
        }
    }

    /// Mint a token for a user. Production tokens come from the external
    /// auth service; this mirrors its claims for tests and dev tooling.
    pub fn create_token(&self, user_id: &UserId) -> Result<String> {
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::hours(24);

        let claims = Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
            jti: uuid::Uuid::new_v4().to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(Into::into)
    }

    /// Verify and decode a token, checking signature, expiry and issuer.
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(Into::into)
    }
}

/// Authenticated caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
}

/// Extract the Bearer token from the Authorization header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("authorization")?.to_str().ok()?;
    auth.strip_prefix("Bearer ").map(|t| t.to_string())
}

/// Reject unauthenticated requests with 401 and tag the rest.
pub async fn auth_middleware(
    jwt: Arc<JwtService>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token =
        extract_bearer_token(request.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = jwt
        .verify_token(&token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    request.extensions_mut().insert(AuthUser {
        user_id: UserId::from(claims.sub.as_str()),
    });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify_round_trip() {
        let service = JwtService::new("test_secret_key", "grimoire-test".to_string());
        let token = service.create_token(&UserId::from("alice")).unwrap();
        let claims = service.verify_token(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.iss, "grimoire-test");
    }

    #[test]
    fn wrong_issuer_rejected() {
        let minter = JwtService::new("secret", "other-service".to_string());
        let verifier = JwtService::new("secret", "grimoire-test".to_string());
        let token = minter.create_token(&UserId::from("alice")).unwrap();
        assert!(verifier.verify_token(&token).is_err());
    }

    #[test]
    fn wrong_secret_rejected() {
        let minter = JwtService::new("secret-a", "grimoire-test".to_string());
        let verifier = JwtService::new("secret-b", "grimoire-test".to_string());
        let token = minter.create_token(&UserId::from("alice")).unwrap();
        assert!(verifier.verify_token(&token).is_err());
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc.def.ghi"));

        let mut bad = HeaderMap::new();
        bad.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert!(extract_bearer_token(&bad).is_none());
    }
}

// src/auth.rs

use crate::{
    error::{AppError, AuthError},
    models::flexible_id,
    state::AppState,
};
use axum::{
    extract::{FromRequestParts, Query},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Authenticated identity attached to a request or connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Turns a credential into an identity. Token issuance lives elsewhere.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, credential: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(deserialize_with = "flexible_id")]
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    pub exp: u64,
}

/// HS256 JWT resolver sharing its secret with the login service.
pub struct JwtResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityResolver for JwtResolver {
    fn resolve(&self, credential: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(credential, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let claims = data.claims;
        let username = claims
            .username
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("User{}", claims.user_id));
        Ok(Identity {
            user_id: claims.user_id,
            username,
        })
    }
}

/// Signs a token for `identity` valid for `ttl`. Used by tooling and tests.
pub fn issue_token(secret: &str, identity: &Identity, ttl: Duration) -> Result<String, AuthError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    let claims = Claims {
        user_id: identity.user_id.clone(),
        username: Some(identity.username.clone()),
        exp: (now + ttl).as_secs(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Extractor for the caller's identity.
/// Reads `Authorization: Bearer <token>`, or `?token=` for browser WebSocket clients.
#[derive(Clone, Debug)]
pub struct AuthUser(pub Identity);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let credential = bearer_token(&parts.headers)
            .or_else(|| {
                Query::<TokenQuery>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|Query(query)| query.token)
                    .filter(|token| !token.is_empty())
            })
            .ok_or(AuthError::MissingCredential)?;

        let identity = state.identity.resolve(&credential).inspect_err(|e| {
            tracing::warn!(error = %e, "Rejected credential");
        })?;
        Ok(AuthUser(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret";

    fn alice() -> Identity {
        Identity {
            user_id: "1".to_string(),
            username: "alice".to_string(),
        }
    }

    #[test]
    fn issued_tokens_resolve_to_the_same_identity() {
        let token = issue_token(SECRET, &alice(), Duration::from_secs(60)).unwrap();
        let identity = JwtResolver::new(SECRET).resolve(&token).unwrap();
        assert_eq!(identity, alice());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_token(SECRET, &alice(), Duration::from_secs(60)).unwrap();
        let err = JwtResolver::new("other").resolve(&token).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn numeric_user_id_and_missing_username_are_accepted() {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 60;
        let token = encode(
            &Header::new(Algorithm::HS256),
            &serde_json::json!({ "user_id": 42, "exp": exp }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let identity = JwtResolver::new(SECRET).resolve(&token).unwrap();
        assert_eq!(identity.user_id, "42");
        assert_eq!(identity.username, "User42");
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}

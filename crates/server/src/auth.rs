use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};

/// HS256 access tokens standing in for the managed backend's sessions.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
    role: String,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_seconds,
        }
    }

    pub fn mint(&self, user_id: &UserId) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.0.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.ttl_seconds)).timestamp(),
            role: "authenticated".to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }

    pub fn verify(&self, token: &str) -> Result<UserId, ApiError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| ApiError::new(ErrorCode::Unauthorized, format!("invalid access token: {e}")))?;
        let user_id = UserId::new(data.claims.sub);
        if user_id.is_blank() {
            return Err(ApiError::new(ErrorCode::Unauthorized, "token has no subject"));
        }
        Ok(user_id)
    }
}

/// Pulls the token out of an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;

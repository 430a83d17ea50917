use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub kind: TokenKind,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> UserId {
        UserId::new(self.sub.clone())
    }
}

impl TokenConfig {
    pub fn ttl_seconds(&self, kind: TokenKind) -> i64 {
        match kind {
            TokenKind::Access => self.access_ttl_seconds,
            TokenKind::Refresh => self.refresh_ttl_seconds,
        }
    }
}

pub fn mint_token(
    cfg: &TokenConfig,
    user_id: &UserId,
    kind: TokenKind,
) -> Result<(String, Claims), jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds(kind));
    let claims = Claims {
        sub: user_id.to_string(),
        kind,
        jti: Uuid::new_v4().to_string(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )?;
    Ok((token, claims))
}

/// Rejects expired tokens with no leeway and tokens of the other kind.
pub fn verify_token(cfg: &TokenConfig, token: &str, kind: TokenKind) -> Option<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &validation,
    )
    .ok()?
    .claims;
    (claims.kind == kind).then_some(claims)
}

#[cfg(test)]
#[path = "tests/tokens_tests.rs"]
mod tests;

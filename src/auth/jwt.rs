//! HS256 access/refresh tokens minted by the local backend.

use anyhow::Context;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::config::JwtConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Payload shared by both kinds. `kind` keeps a refresh token from passing
/// as an access token and the other way round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub kind: TokenKind,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl From<&JwtConfig> for JwtKeys {
    fn from(cfg: &JwtConfig) -> Self {
        let mut validation = Validation::default();
        validation.set_audience(&[&cfg.audience]);
        validation.set_issuer(&[&cfg.issuer]);
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            validation,
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            access_ttl: Duration::minutes(cfg.ttl_minutes.max(0)),
            refresh_ttl: Duration::minutes(cfg.refresh_ttl_minutes.max(0)),
        }
    }
}

/// A freshly signed access/refresh pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry, unix seconds.
    pub expires_at: i64,
}

impl JwtKeys {
    fn sign(
        &self,
        user_id: Uuid,
        email: &str,
        kind: TokenKind,
        now: OffsetDateTime,
    ) -> anyhow::Result<(String, i64)> {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: user_id,
            email: email.to_owned(),
            kind,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .with_context(|| format!("sign {kind:?} token"))?;
        Ok((token, claims.exp))
    }

    pub fn sign_pair(&self, user_id: Uuid, email: &str) -> anyhow::Result<TokenPair> {
        let now = OffsetDateTime::now_utc();
        let (access_token, expires_at) = self.sign(user_id, email, TokenKind::Access, now)?;
        let (refresh_token, _) = self.sign(user_id, email, TokenKind::Refresh, now)?;
        debug!(%user_id, expires_at, "token pair signed");
        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_at,
        })
    }

    /// Checks signature, issuer, audience and expiry, then that the token is of `kind`.
    pub fn verify(&self, token: &str, kind: TokenKind) -> anyhow::Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)?.claims;
        anyhow::ensure!(
            claims.kind == kind,
            "expected {kind:?} token, got {:?}",
            claims.kind
        );
        Ok(claims)
    }
}

#[cfg(test)]
mod jwt_tests {
    use super::*;

    fn keys(issuer: &str, secret: &str) -> JwtKeys {
        JwtKeys::from(&JwtConfig {
            secret: secret.into(),
            issuer: issuer.into(),
            audience: "authenticated".into(),
            ttl_minutes: 5,
            refresh_ttl_minutes: 60,
        })
    }

    #[test]
    fn access_token_carries_user_and_expiry() {
        let keys = keys("nutrisignal-local", "s3cret");
        let user_id = Uuid::new_v4();
        let pair = keys.sign_pair(user_id, "ada@example.com").unwrap();

        let claims = keys.verify(&pair.access_token, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "ada@example.com");
        assert_eq!(claims.exp, pair.expires_at);
        assert_eq!(claims.exp - claims.iat, 5 * 60);

        let refresh = keys.verify(&pair.refresh_token, TokenKind::Refresh).unwrap();
        assert_eq!(refresh.exp - refresh.iat, 60 * 60);
    }

    #[test]
    fn token_kinds_do_not_substitute() {
        let keys = keys("nutrisignal-local", "s3cret");
        let pair = keys.sign_pair(Uuid::new_v4(), "a@b.co").unwrap();

        let err = keys.verify(&pair.refresh_token, TokenKind::Access).unwrap_err();
        assert!(err.to_string().contains("expected Access token"));
        assert!(keys.verify(&pair.access_token, TokenKind::Refresh).is_err());
    }

    #[test]
    fn foreign_issuer_or_secret_is_rejected() {
        let ours = keys("nutrisignal-local", "s3cret");
        let pair = ours.sign_pair(Uuid::new_v4(), "a@b.co").unwrap();

        assert!(keys("someone-else", "s3cret")
            .verify(&pair.access_token, TokenKind::Access)
            .is_err());
        assert!(keys("nutrisignal-local", "other")
            .verify(&pair.access_token, TokenKind::Access)
            .is_err());
    }
}

//! Access-token verification for the auth gateway.
//!
//! Two modes: RS256 against the JWKS fetched from the SSO (cached, refreshed
//! on unknown `kid` at most once per TTL), or HS256 with the configured
//! `JWT_SIGNING_KEY` for single-box deployments. Either way the only output
//! is the `uid` claim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::AuthError;
use crate::sso::SsoClient;

const USER_ID_CLAIM: &str = "uid";

pub struct TokenVerifier {
    mode: Mode,
}

enum Mode {
    Hs256(DecodingKey),
    Jwks {
        sso: Arc<dyn SsoClient>,
        cache: RwLock<JwksCache>,
        refresh_ttl: Duration,
    },
}

struct JwksCache {
    jwks: Option<JwkSet>,
    fetched_at: Option<Instant>,
}

impl JwksCache {
    fn key_for_kid(&self, kid: &str) -> Option<&jsonwebtoken::jwk::Jwk> {
        self.jwks.as_ref()?.find(kid)
    }
}

impl TokenVerifier {
    pub fn hs256(signing_key: &str) -> Self {
        Self {
            mode: Mode::Hs256(DecodingKey::from_secret(signing_key.as_bytes())),
        }
    }

    pub fn jwks(sso: Arc<dyn SsoClient>) -> Self {
        Self {
            mode: Mode::Jwks {
                sso,
                cache: RwLock::new(JwksCache {
                    jwks: None,
                    fetched_at: None,
                }),
                refresh_ttl: Duration::from_secs(300),
            },
        }
    }

    /// Verify signature and expiry, returning the owning user id.
    pub async fn verify(&self, token: &str) -> Result<String, AuthError> {
        match &self.mode {
            Mode::Hs256(key) => {
                let validation = Validation::new(Algorithm::HS256);
                let decoded = decode::<Value>(token, key, &validation)
                    .map_err(|_| AuthError::InvalidToken)?;
                claim_string(&decoded.claims, USER_ID_CLAIM)
            }
            Mode::Jwks { .. } => {
                let header = decode_header(token).map_err(|_| AuthError::InvalidToken)?;
                if header.alg != Algorithm::RS256 {
                    return Err(AuthError::InvalidToken);
                }
                let kid = header.kid.ok_or(AuthError::InvalidToken)?;
                let key = self.decoding_key_for_kid(&kid).await?;

                let validation = Validation::new(Algorithm::RS256);
                let decoded = decode::<Value>(token, &key, &validation)
                    .map_err(|_| AuthError::InvalidToken)?;
                claim_string(&decoded.claims, USER_ID_CLAIM)
            }
        }
    }

    async fn decoding_key_for_kid(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        let Mode::Jwks {
            sso,
            cache,
            refresh_ttl,
        } = &self.mode
        else {
            return Err(AuthError::InvalidToken);
        };

        {
            let cache = cache.read().await;
            if let Some(jwk) = cache.key_for_kid(kid) {
                return DecodingKey::from_jwk(jwk).map_err(|_| AuthError::InvalidToken);
            }
        }

        {
            let mut cache = cache.write().await;
            let refresh_needed = cache
                .fetched_at
                .map(|t| t.elapsed() > *refresh_ttl)
                .unwrap_or(true);
            if refresh_needed {
                let jwks = sso
                    .get_jwks()
                    .await
                    .map_err(|e| AuthError::JwksUnavailable(e.to_string()))?;
                cache.jwks = Some(jwks);
                cache.fetched_at = Some(Instant::now());
            }
            if let Some(jwk) = cache.key_for_kid(kid) {
                return DecodingKey::from_jwk(jwk).map_err(|_| AuthError::InvalidToken);
            }
        }

        Err(AuthError::InvalidToken)
    }
}

fn claim_string(claims: &Value, claim: &str) -> Result<String, AuthError> {
    claims
        .get(claim)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(AuthError::InvalidToken)
}

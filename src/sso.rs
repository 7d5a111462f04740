//! Client for the external single-sign-on service.
//!
//! The SSO owns passwords and issues tokens; this backend only forwards
//! credential operations and verifies the tokens it gets back. Transport is
//! JSON-over-HTTP RPC with a per-call timeout and bounded retries on
//! transport failure (never on a definitive SSO answer).

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::SsoClientConfig;
use crate::error::SsoError;

/// Token pair issued by the SSO. Cookie metadata (domain, path, TTL) is
/// configuration on our side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
}

/// Register/Login result: the SSO-assigned user id anchors ownership of
/// every row this backend writes.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    #[serde(flatten)]
    pub token: TokenData,
}

#[async_trait]
pub trait SsoClient: Send + Sync {
    async fn register(
        &self,
        email: &str,
        password: &str,
        app_id: i32,
    ) -> Result<AuthenticatedUser, SsoError>;

    async fn login(
        &self,
        email: &str,
        password: &str,
        app_id: i32,
    ) -> Result<AuthenticatedUser, SsoError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenData, SsoError>;

    async fn logout(&self, refresh_token: &str) -> Result<(), SsoError>;

    async fn verify_email(&self, token: &str) -> Result<(), SsoError>;

    async fn reset_password(&self, email: &str) -> Result<(), SsoError>;

    async fn change_password(
        &self,
        email: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), SsoError>;

    async fn get_jwks(&self) -> Result<JwkSet, SsoError>;
}

pub struct HttpSsoClient {
    http: reqwest::Client,
    base_url: String,
    retries_count: u32,
}

impl HttpSsoClient {
    pub fn new(config: &SsoClientConfig) -> Result<Self, SsoError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SsoError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.address.trim_end_matches('/').to_string(),
            retries_count: config.retries_count,
        })
    }

    /// POST with retries on transport failure. A response from the SSO,
    /// success or not, is definitive and never retried.
    async fn call<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, SsoError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..self.retries_count.max(1) {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(100 * u64::from(attempt)))
                    .await;
            }
            match self.http.post(&url).json(body).send().await {
                Ok(response) => return decode_response(response).await,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, path, "sso call failed");
                    last_err = Some(SsoError::Transport(e.to_string()));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| SsoError::Transport("no attempts made".to_string())))
    }
}

async fn decode_response<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, SsoError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<R>()
            .await
            .map_err(|e| SsoError::Malformed(e.to_string()));
    }
    match status.as_u16() {
        401 | 403 => Err(SsoError::InvalidCredentials),
        409 => Err(SsoError::UserAlreadyExists),
        400 | 422 => Err(SsoError::InvalidToken),
        _ => Err(SsoError::Transport(format!("sso returned {status}"))),
    }
}

#[derive(Serialize)]
struct CredentialsBody<'a> {
    email: &'a str,
    password: &'a str,
    app_id: i32,
}

#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct TokenBody<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct EmailBody<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct ChangePasswordBody<'a> {
    email: &'a str,
    current_password: &'a str,
    new_password: &'a str,
}

#[derive(Deserialize)]
struct Empty {}

#[async_trait]
impl SsoClient for HttpSsoClient {
    async fn register(
        &self,
        email: &str,
        password: &str,
        app_id: i32,
    ) -> Result<AuthenticatedUser, SsoError> {
        self.call(
            "/register",
            &CredentialsBody {
                email,
                password,
                app_id,
            },
        )
        .await
    }

    async fn login(
        &self,
        email: &str,
        password: &str,
        app_id: i32,
    ) -> Result<AuthenticatedUser, SsoError> {
        self.call(
            "/login",
            &CredentialsBody {
                email,
                password,
                app_id,
            },
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenData, SsoError> {
        self.call("/refresh", &RefreshBody { refresh_token }).await
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), SsoError> {
        self.call::<_, Empty>("/logout", &RefreshBody { refresh_token })
            .await
            .map(|_| ())
    }

    async fn verify_email(&self, token: &str) -> Result<(), SsoError> {
        self.call::<_, Empty>("/verify-email", &TokenBody { token })
            .await
            .map(|_| ())
    }

    async fn reset_password(&self, email: &str) -> Result<(), SsoError> {
        self.call::<_, Empty>("/password/reset", &EmailBody { email })
            .await
            .map(|_| ())
    }

    async fn change_password(
        &self,
        email: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), SsoError> {
        self.call::<_, Empty>(
            "/password/change",
            &ChangePasswordBody {
                email,
                current_password,
                new_password,
            },
        )
        .await
        .map(|_| ())
    }

    async fn get_jwks(&self) -> Result<JwkSet, SsoError> {
        let url = format!("{}/jwks", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SsoError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SsoError::Transport(format!(
                "jwks endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<JwkSet>()
            .await
            .map_err(|e| SsoError::Malformed(e.to_string()))
    }
}

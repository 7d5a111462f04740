//! Application configuration.
//!
//! Values come from a `CONFIG_PATH` env file (plain `KEY=VALUE` lines) merged
//! under the process environment; env vars win. Everything is validated up
//! front so a misconfigured process refuses to start instead of failing on
//! the first request.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Deployment environment, used to pick the log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Local,
    Dev,
    Prod,
}

impl AppEnv {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" => Ok(Self::Dev),
            "prod" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidValue {
                key: "APP_ENV",
                message: format!("unsupported environment '{other}'"),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dev => "dev",
            Self::Prod => "prod",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub address: SocketAddr,
    /// Read and write timeout for a single request/response exchange.
    pub timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: SecretString,
    pub ssl_mode: String,
    /// Full connection URL; overrides the discrete fields when set.
    pub conn_url: Option<String>,
    pub conn_pool_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// HS256 shared secret. Empty means RS256 against the SSO JWKS.
    pub signing_key: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub refresh_token_cookie_domain: String,
    pub refresh_token_cookie_path: String,
}

#[derive(Debug, Clone)]
pub struct SsoClientConfig {
    pub address: String,
    pub timeout: Duration,
    pub retries_count: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub env: AppEnv,
    pub http: HttpServerConfig,
    pub db: DatabaseConfig,
    pub jwt: JwtConfig,
    pub sso: SsoClientConfig,
}

impl Config {
    /// Load from the `CONFIG_PATH` file (if any) merged under process env.
    pub fn load() -> Result<Self, ConfigError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                merged.extend(parse_env_file(config_path)?);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let env = match kv.get("APP_ENV").map(String::as_str) {
            Some(raw) if !raw.trim().is_empty() => AppEnv::parse(raw.trim())?,
            _ => AppEnv::Local,
        };

        let http = HttpServerConfig {
            address: parse_socket_addr(
                kv.get("HTTP_SERVER_ADDRESS"),
                "127.0.0.1:8080",
                "HTTP_SERVER_ADDRESS",
            )?,
            timeout: parse_duration(
                kv.get("HTTP_SERVER_TIMEOUT"),
                Duration::from_secs(10),
                "HTTP_SERVER_TIMEOUT",
            )?,
            idle_timeout: parse_duration(
                kv.get("HTTP_SERVER_IDLE_TIMEOUT"),
                Duration::from_secs(60),
                "HTTP_SERVER_IDLE_TIMEOUT",
            )?,
        };

        let conn_url = kv
            .get("DB_CONN_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let db = DatabaseConfig {
            host: string_or(kv, "DB_HOST", "localhost"),
            port: parse_u16(kv.get("DB_PORT"), 5432, "DB_PORT")?,
            name: if conn_url.is_some() {
                string_or(kv, "DB_NAME", "")
            } else {
                require_nonempty(kv, "DB_NAME")?
            },
            user: if conn_url.is_some() {
                string_or(kv, "DB_USER", "")
            } else {
                require_nonempty(kv, "DB_USER")?
            },
            password: SecretString::from(string_or(kv, "DB_PASSWORD", "")),
            ssl_mode: string_or(kv, "DB_SSL_MODE", "disable"),
            conn_url,
            conn_pool_size: parse_usize(kv.get("DB_CONN_POOL_SIZE"), 10, "DB_CONN_POOL_SIZE")?,
            read_timeout: parse_duration(
                kv.get("DB_READ_TIMEOUT"),
                Duration::from_secs(5),
                "DB_READ_TIMEOUT",
            )?,
            write_timeout: parse_duration(
                kv.get("DB_WRITE_TIMEOUT"),
                Duration::from_secs(5),
                "DB_WRITE_TIMEOUT",
            )?,
            idle_timeout: parse_duration(
                kv.get("DB_IDLE_TIMEOUT"),
                Duration::from_secs(300),
                "DB_IDLE_TIMEOUT",
            )?,
            dial_timeout: parse_duration(
                kv.get("DB_DIAL_TIMEOUT"),
                Duration::from_secs(10),
                "DB_DIAL_TIMEOUT",
            )?,
        };

        if db.conn_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DB_CONN_POOL_SIZE",
                message: "pool size must be at least 1".to_string(),
            });
        }

        let jwt = JwtConfig {
            signing_key: string_or(kv, "JWT_SIGNING_KEY", ""),
            access_token_ttl: parse_duration(
                kv.get("JWT_ACCESS_TOKEN_TTL"),
                Duration::from_secs(15 * 60),
                "JWT_ACCESS_TOKEN_TTL",
            )?,
            refresh_token_ttl: parse_duration(
                kv.get("JWT_REFRESH_TOKEN_TTL"),
                Duration::from_secs(720 * 3600),
                "JWT_REFRESH_TOKEN_TTL",
            )?,
            refresh_token_cookie_domain: string_or(kv, "JWT_REFRESH_TOKEN_COOKIE_DOMAIN", ""),
            refresh_token_cookie_path: string_or(kv, "JWT_REFRESH_TOKEN_COOKIE_PATH", "/"),
        };

        let sso = SsoClientConfig {
            address: require_nonempty(kv, "SSO_CLIENT_ADDRESS")?,
            timeout: parse_duration(
                kv.get("SSO_CLIENT_TIMEOUT"),
                Duration::from_secs(5),
                "SSO_CLIENT_TIMEOUT",
            )?,
            retries_count: parse_u32(kv.get("SSO_CLIENT_RETRIES_COUNT"), 3, "SSO_CLIENT_RETRIES_COUNT")?,
        };

        if sso.retries_count > 10 {
            return Err(ConfigError::InvalidValue {
                key: "SSO_CLIENT_RETRIES_COUNT",
                message: "must be <= 10".to_string(),
            });
        }

        Ok(Self {
            env,
            http,
            db,
            jwt,
            sso,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    let mut kv = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        kv.insert(key.trim().to_string(), value.to_string());
    }
    Ok(kv)
}

fn string_or(kv: &HashMap<String, String>, key: &str, default: &str) -> String {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn require_nonempty(kv: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    kv.get(key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::MissingKey { key })
}

fn parse_socket_addr(
    raw: Option<&String>,
    default: &str,
    key: &'static str,
) -> Result<SocketAddr, ConfigError> {
    let raw = raw.map(|s| s.trim()).filter(|s| !s.is_empty());
    let value = raw.unwrap_or(default);
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        message: format!("'{value}' is not a socket address"),
    })
}

fn parse_u16(raw: Option<&String>, default: u16, key: &'static str) -> Result<u16, ConfigError> {
    match raw.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(s) => s.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            message: format!("'{s}' is not a valid number"),
        }),
    }
}

fn parse_u32(raw: Option<&String>, default: u32, key: &'static str) -> Result<u32, ConfigError> {
    match raw.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(s) => s.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            message: format!("'{s}' is not a valid number"),
        }),
    }
}

fn parse_usize(
    raw: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, ConfigError> {
    match raw.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(s) => s.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            message: format!("'{s}' is not a valid number"),
        }),
    }
}

/// Parse a duration written as `10s`, `15m`, `720h`, or a bare number of
/// seconds.
fn parse_duration(
    raw: Option<&String>,
    default: Duration,
    key: &'static str,
) -> Result<Duration, ConfigError> {
    let Some(s) = raw.map(|s| s.trim()).filter(|s| !s.is_empty()) else {
        return Ok(default);
    };

    let (digits, multiplier) = match s.as_bytes().last() {
        Some(b's') => (&s[..s.len() - 1], 1u64),
        Some(b'm') => (&s[..s.len() - 1], 60),
        Some(b'h') => (&s[..s.len() - 1], 3600),
        _ => (s, 1),
    };

    let value: u64 = digits.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        message: format!("'{s}' is not a valid duration"),
    })?;

    Ok(Duration::from_secs(value * multiplier))
}

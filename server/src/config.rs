//! Server configuration module.
//!
//! Parses configuration from environment variables for the Courier server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 8080 | HTTP server port |
//! | `COURIER_JWT_PRIVATE_KEY_SECRET` | Yes | - | Secret name of the PEM signing key |
//! | `COURIER_JWT_PUBLIC_KEY_SECRET` | Yes | - | Secret name of the PEM verification key |
//! | `COURIER_SECRETS_DIR` | One of* | - | Directory holding one file per secret |
//! | `COURIER_SECRETS_URL` | One of* | - | Base URL of the HTTP secret store |
//! | `COURIER_SECRETS_TOKEN` | No | - | Bearer credential for the HTTP secret store |
//! | `COURIER_TOKEN_TTL_SECS` | No | 3600 | Session token lifetime, at most 365 days |
//! | `COURIER_TOTP_ISSUER` | No | Courier | Issuer label in provisioning URIs |
//! | `COURIER_WORKERS_CORE` | No | 10 | Long-lived ingress workers |
//! | `COURIER_WORKERS_MAX` | No | 50 | Maximum concurrent ingress jobs |
//! | `COURIER_WORKER_QUEUE` | No | 100 | Ingress backlog depth |
//! | `COURIER_SEED_PATH` | No | - | JSON seed file for the in-memory store |
//!
//! *Exactly one of `COURIER_SECRETS_DIR` and `COURIER_SECRETS_URL` must be set.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::token::MAX_TOKEN_TTL;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default session token lifetime in seconds.
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Default issuer shown by authenticator apps.
const DEFAULT_TOTP_ISSUER: &str = "Courier";

const DEFAULT_WORKERS_CORE: usize = 10;
const DEFAULT_WORKERS_MAX: usize = 50;
const DEFAULT_WORKER_QUEUE: usize = 100;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Where key material and other secrets are read from.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// A directory with one file per secret, as mounted by orchestrators.
    Directory(PathBuf),

    /// An HTTP secret store.
    Http {
        base_url: String,
        token: Option<String>,
    },
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
            Self::Http { base_url, token } => f
                .debug_struct("Http")
                .field("base_url", base_url)
                .field("token", &token.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Name of the secret holding the PEM private key.
    pub jwt_private_key_secret: String,

    /// Name of the secret holding the PEM public key.
    pub jwt_public_key_secret: String,

    /// Secret store the key material is loaded from.
    pub secret_source: SecretSource,

    /// Lifetime of issued session tokens.
    pub token_ttl: Duration,

    /// Issuer label used in TOTP provisioning URIs.
    pub totp_issuer: String,

    pub workers_core: usize,
    pub workers_max: usize,
    pub worker_queue: usize,

    /// Optional seed file for the in-memory repositories.
    pub seed_path: Option<PathBuf>,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - A required key secret name is missing
    /// - Neither or both secret sources are configured
    /// - A numeric variable fails to parse or is out of range
    ///
    /// # Example
    ///
    /// ```no_run
    /// use courier_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let jwt_private_key_secret = require_env("COURIER_JWT_PRIVATE_KEY_SECRET")?;
        let jwt_public_key_secret = require_env("COURIER_JWT_PUBLIC_KEY_SECRET")?;
        let secret_source = parse_secret_source()?;
        let token_ttl = Duration::from_secs(parse_number_env(
            "COURIER_TOKEN_TTL_SECS",
            DEFAULT_TOKEN_TTL_SECS,
        )?);
        let totp_issuer = optional_env("COURIER_TOTP_ISSUER")
            .unwrap_or_else(|| DEFAULT_TOTP_ISSUER.to_string());
        let workers_core = parse_number_env("COURIER_WORKERS_CORE", DEFAULT_WORKERS_CORE)?;
        let workers_max = parse_number_env("COURIER_WORKERS_MAX", DEFAULT_WORKERS_MAX)?;
        let worker_queue = parse_number_env("COURIER_WORKER_QUEUE", DEFAULT_WORKER_QUEUE)?;
        let seed_path = optional_env("COURIER_SEED_PATH").map(PathBuf::from);

        let config = Self {
            port,
            jwt_private_key_secret,
            jwt_public_key_secret,
            secret_source,
            token_ttl,
            totp_issuer,
            workers_core,
            workers_max,
            worker_queue,
            seed_path,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate cross-field constraints.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.token_ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "COURIER_TOKEN_TTL_SECS must be greater than zero".to_string(),
            ));
        }

        if self.totp_issuer.is_empty() || self.totp_issuer.contains(':') {
            return Err(ConfigError::ValidationError(
                "COURIER_TOTP_ISSUER must be non-empty and must not contain ':'".to_string(),
            ));
        }

        if self.token_ttl > MAX_TOKEN_TTL {
            return Err(ConfigError::ValidationError(format!(
                "COURIER_TOKEN_TTL_SECS must not exceed {}",
                MAX_TOKEN_TTL.as_secs()
            )));
        }

        if self.workers_core == 0 {
            return Err(ConfigError::ValidationError(
                "COURIER_WORKERS_CORE must be at least 1".to_string(),
            ));
        }

        if self.workers_max < self.workers_core {
            return Err(ConfigError::ValidationError(format!(
                "COURIER_WORKERS_MAX ({}) must not be below COURIER_WORKERS_CORE ({})",
                self.workers_max, self.workers_core
            )));
        }

        if self.worker_queue == 0 {
            return Err(ConfigError::ValidationError(
                "COURIER_WORKER_QUEUE must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Read a variable, treating empty values as unset.
fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    optional_env(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

/// Parse a numeric environment variable, falling back to `default` if unset.
fn parse_number_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match optional_env(name) {
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: err.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Resolve the secret store from `COURIER_SECRETS_DIR` / `COURIER_SECRETS_URL`.
fn parse_secret_source() -> Result<SecretSource, ConfigError> {
    let dir = optional_env("COURIER_SECRETS_DIR");
    let url = optional_env("COURIER_SECRETS_URL");

    match (dir, url) {
        (Some(dir), None) => Ok(SecretSource::Directory(PathBuf::from(dir))),
        (None, Some(url)) => {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidFormat {
                    var: "COURIER_SECRETS_URL".to_string(),
                    message: format!("expected an http(s) URL, got '{url}'"),
                });
            }
            Ok(SecretSource::Http {
                base_url: url.trim_end_matches('/').to_string(),
                token: optional_env("COURIER_SECRETS_TOKEN"),
            })
        }
        (Some(_), Some(_)) => Err(ConfigError::ValidationError(
            "set only one of COURIER_SECRETS_DIR and COURIER_SECRETS_URL".to_string(),
        )),
        (None, None) => Err(ConfigError::MissingEnvVar(
            "COURIER_SECRETS_DIR or COURIER_SECRETS_URL".to_string(),
        )),
    }
}

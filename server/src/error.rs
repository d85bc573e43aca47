//! Error types for the Courier server.
//!
//! This module defines the top-level [`ServerError`] taxonomy shared by the
//! login path and the chat pipeline, together with its mapping onto HTTP
//! responses.
//!
//! # Error Categories
//!
//! - **Login path**: [`ServerError::InvalidCredentials`] and
//!   [`ServerError::TooManyAttempts`] are reported with a uniform 401 body that
//!   never reveals which check failed.
//! - **Tokens**: [`ServerError::AuthenticationFailure`] covers malformed,
//!   expired and unsigned tokens.
//! - **Startup**: [`ServerError::KeyLoadingFailure`] and
//!   [`ServerError::SecretAccessFailure`] are fatal when raised during
//!   initialization.
//! - **Chat pipeline**: [`ServerError::NotFound`], [`ServerError::Storage`] and
//!   [`ServerError::Broker`] surface through the asynchronous result channel.
//!
//! # Example
//!
//! ```rust
//! use courier_server::error::ServerError;
//!
//! fn require_conversation(found: bool, id: i64) -> Result<(), ServerError> {
//!     if !found {
//!         return Err(ServerError::not_found("Conversation", "id", id));
//!     }
//!     Ok(())
//! }
//!
//! assert!(require_conversation(false, 7).is_err());
//! ```

use std::error::Error;
use std::fmt;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::store::StoreError;

/// User-facing message for every credential rejection.
pub const INVALID_CREDENTIALS_MESSAGE: &str = "invalid username or password";

/// User-facing message while an identity is locked out.
pub const TOO_MANY_ATTEMPTS_MESSAGE: &str = "too many failed attempts, try again later";

/// Top-level error type for the Courier server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// Username or password did not match, or a required second factor was
    /// missing or wrong. Deliberately carries no detail.
    InvalidCredentials,

    /// The identity is locked out after repeated failures.
    TooManyAttempts {
        /// Seconds until the lock expires.
        retry_after: u64,
    },

    /// A session token was malformed, expired or carried a bad signature.
    AuthenticationFailure(String),

    /// Signing or verification key material could not be parsed.
    KeyLoadingFailure(String),

    /// A referenced user, conversation or message does not exist.
    NotFound {
        resource: &'static str,
        field: &'static str,
        value: String,
    },

    /// The external secret store could not be reached or returned an error.
    SecretAccessFailure(String),

    /// Request or event validation failure.
    Validation(String),

    /// Message storage failed.
    Storage(StoreError),

    /// Publishing to or consuming from the broker failed.
    Broker(BrokerError),

    /// The ingress worker pool cannot accept more work right now.
    Unavailable(String),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::InvalidCredentials => f.write_str(INVALID_CREDENTIALS_MESSAGE),
            Self::TooManyAttempts { retry_after } => {
                write!(f, "too many failed attempts, retry after {retry_after} seconds")
            }
            Self::AuthenticationFailure(msg) => write!(f, "authentication failed: {msg}"),
            Self::KeyLoadingFailure(msg) => write!(f, "failed to load key material: {msg}"),
            Self::NotFound {
                resource,
                field,
                value,
            } => write!(f, "{resource} not found with {field} '{value}'"),
            Self::SecretAccessFailure(msg) => write!(f, "secret access failed: {msg}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Broker(err) => write!(f, "broker error: {err}"),
            Self::Unavailable(msg) => write!(f, "service unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::Broker(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err)
    }
}

impl From<BrokerError> for ServerError {
    fn from(err: BrokerError) -> Self {
        Self::Broker(err)
    }
}

impl ServerError {
    /// Creates a new authentication failure.
    ///
    /// # Example
    ///
    /// ```rust
    /// use courier_server::error::ServerError;
    ///
    /// let err = ServerError::authentication("token expired");
    /// assert!(matches!(err, ServerError::AuthenticationFailure(_)));
    /// ```
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::AuthenticationFailure(message.into())
    }

    /// Creates a new not-found error for `resource` looked up by `field`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use courier_server::error::ServerError;
    ///
    /// let err = ServerError::not_found("User", "id", 42);
    /// assert_eq!(err.to_string(), "User not found with id '42'");
    /// ```
    pub fn not_found(resource: &'static str, field: &'static str, value: impl fmt::Display) -> Self {
        Self::NotFound {
            resource,
            field,
            value: value.to_string(),
        }
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new key loading error.
    pub fn key_loading(message: impl Into<String>) -> Self {
        Self::KeyLoadingFailure(message.into())
    }

    /// Creates a new secret access error.
    pub fn secret_access(message: impl Into<String>) -> Self {
        Self::SecretAccessFailure(message.into())
    }

    /// Creates a new unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::TooManyAttempts { .. }
                | Self::AuthenticationFailure(_)
                | Self::NotFound { .. }
                | Self::Validation(_)
        )
    }

    /// Returns `true` if this error is a missing-resource error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials
            | Self::TooManyAttempts { .. }
            | Self::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

// ============================================================================
// HTTP mapping
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            Self::InvalidCredentials => (
                status,
                Json(ErrorResponse::new(INVALID_CREDENTIALS_MESSAGE).with_code("invalid_credentials")),
            )
                .into_response(),
            Self::TooManyAttempts { retry_after } => (
                status,
                [(header::RETRY_AFTER, retry_after.to_string())],
                Json(ErrorResponse::new(TOO_MANY_ATTEMPTS_MESSAGE).with_code("too_many_attempts")),
            )
                .into_response(),
            Self::AuthenticationFailure(_) => (
                status,
                Json(ErrorResponse::new("authentication required").with_code("unauthorized")),
            )
                .into_response(),
            Self::NotFound { resource, .. } => (
                status,
                Json(ErrorResponse::new(format!("{} not found", resource.to_lowercase())).with_code("not_found")),
            )
                .into_response(),
            Self::Validation(msg) => {
                (status, Json(ErrorResponse::new(msg).with_code("invalid_request"))).into_response()
            }
            Self::Unavailable(_) => (
                status,
                Json(ErrorResponse::new("server busy, try again later").with_code("unavailable")),
            )
                .into_response(),
            other => {
                error!(error = %other, "Request failed with internal error");
                (
                    status,
                    Json(ErrorResponse::new("internal server error").with_code("internal_error")),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> ErrorResponse {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn not_found_displays_resource_field_and_value() {
        let err = ServerError::not_found("Conversation", "id", 9);
        assert_eq!(err.to_string(), "Conversation not found with id '9'");
    }

    #[test]
    fn invalid_credentials_display_is_generic() {
        assert_eq!(
            ServerError::InvalidCredentials.to_string(),
            "invalid username or password"
        );
    }

    #[test]
    fn config_error_converts_with_question_mark() {
        fn inner() -> Result<()> {
            Err(ConfigError::MissingEnvVar("PORT".to_string()))?;
            Ok(())
        }

        assert!(matches!(inner().unwrap_err(), ServerError::Config(_)));
    }

    #[test]
    fn source_is_exposed_for_wrapped_errors() {
        let err = ServerError::from(StoreError::Unavailable("disk".to_string()));
        assert!(err.source().is_some());
        assert!(ServerError::InvalidCredentials.source().is_none());
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(ServerError::InvalidCredentials.is_client_error());
        assert!(ServerError::TooManyAttempts { retry_after: 5 }.is_client_error());
        assert!(ServerError::not_found("User", "id", 1).is_client_error());
        assert!(!ServerError::internal("boom").is_client_error());
        assert!(!ServerError::key_loading("bad pem").is_client_error());
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(ServerError::InvalidCredentials.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ServerError::authentication("expired").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServerError::not_found("Message", "id", 3).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ServerError::validation("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServerError::unavailable("saturated").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServerError::secret_access("timeout").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn too_many_attempts_sets_retry_after() {
        let response = ServerError::TooManyAttempts { retry_after: 840 }.into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::RETRY_AFTER], "840");

        let body = body_json(response).await;
        assert_eq!(body.error, TOO_MANY_ATTEMPTS_MESSAGE);
        assert_eq!(body.code.as_deref(), Some("too_many_attempts"));
    }

    #[tokio::test]
    async fn internal_detail_is_not_returned() {
        let response = ServerError::internal("connection string postgres://secret").into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body.error, "internal server error");
    }

    #[tokio::test]
    async fn authentication_failure_hides_reason() {
        let response = ServerError::authentication("signature mismatch").into_response();
        let body = body_json(response).await;
        assert!(!body.error.contains("signature"));
    }

    #[test]
    fn error_response_serializes_without_code() {
        let json = serde_json::to_string(&ErrorResponse::new("test error")).unwrap();
        assert!(json.contains("test error"));
        assert!(!json.contains("code"));
    }
}

//! Time-based one-time passwords for second-factor login.
//!
//! Codes follow RFC 6238 with HMAC-SHA1, six digits and a 30 second step.
//! Verification accepts the current step and one step either side to absorb
//! clock drift between the server and the authenticator app.

use chrono::Utc;
use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::types::User;

/// Length of a time step in seconds.
pub const STEP_SECS: u64 = 30;

/// Number of digits in a code.
pub const CODE_DIGITS: usize = 6;

/// Steps accepted either side of the current one.
const SKEW_STEPS: u8 = 1;

/// Errors raised by the second-factor verifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TotpError {
    /// The stored secret is not valid base32 or is too short.
    #[error("stored second-factor secret is malformed")]
    MalformedSecret,

    /// The identity has not started enrollment.
    #[error("second factor is not enrolled")]
    NotEnrolled,

    /// The issuer or account name cannot appear in a provisioning URI.
    #[error("issuer and account name must not contain ':'")]
    InvalidLabel,
}

/// A freshly generated secret and its provisioning URI.
#[derive(Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub secret: String,
    pub provisioning_uri: String,
}

impl std::fmt::Debug for Enrollment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enrollment")
            .field("secret", &"<redacted>")
            .field("provisioning_uri", &"<redacted>")
            .finish()
    }
}

/// Generates and checks TOTP secrets and codes.
#[derive(Debug, Clone)]
pub struct TotpService {
    issuer: String,
}

impl TotpService {
    /// Creates a verifier that labels provisioning URIs with `issuer`.
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Generates a new secret for `account` and its `otpauth://` URI.
    ///
    /// This does not activate the second factor; the caller stores the secret
    /// and flips the enabled flag only after [`TotpService::confirm`] succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`TotpError::InvalidLabel`] if the issuer or `account`
    /// contains a colon.
    pub fn enroll(&self, account: &str) -> Result<Enrollment, TotpError> {
        let bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|_| TotpError::MalformedSecret)?;
        let totp = TOTP::new(
            Algorithm::SHA1,
            CODE_DIGITS,
            SKEW_STEPS,
            STEP_SECS,
            bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|_| TotpError::InvalidLabel)?;

        Ok(Enrollment {
            secret: totp.get_secret_base32(),
            provisioning_uri: totp.get_url(),
        })
    }

    /// Checks `code` against the secret stored on `user`.
    ///
    /// # Errors
    ///
    /// Returns [`TotpError::NotEnrolled`] if the user has no secret and
    /// [`TotpError::MalformedSecret`] if the stored secret cannot be decoded.
    pub fn confirm(&self, user: &User, code: &str) -> Result<bool, TotpError> {
        let secret = user.totp_secret.as_deref().ok_or(TotpError::NotEnrolled)?;
        verify(secret, code)
    }

    /// Stateless check of `code` against `secret` at the current time.
    pub fn verify(&self, secret: &str, code: &str) -> Result<bool, TotpError> {
        verify(secret, code)
    }
}

/// Checks `code` against `secret` at the current time.
///
/// An invalid code yields `Ok(false)`; only an undecodable secret is an error.
pub fn verify(secret: &str, code: &str) -> Result<bool, TotpError> {
    verify_at(secret, code, unix_now())
}

/// Checks `code` against `secret` as if the clock read `unix_secs`.
pub fn verify_at(secret: &str, code: &str, unix_secs: u64) -> Result<bool, TotpError> {
    let totp = checker(secret)?;
    // The skew window cannot start before step zero.
    let unix_secs = unix_secs.max(STEP_SECS * u64::from(SKEW_STEPS));
    Ok(totp.check(code, unix_secs))
}

/// Computes the code for `secret` at `unix_secs`.
pub fn code_at(secret: &str, unix_secs: u64) -> Result<String, TotpError> {
    Ok(checker(secret)?.generate(unix_secs))
}

/// Unlabelled generator for a stored base32 secret.
fn checker(secret: &str) -> Result<TOTP, TotpError> {
    let bytes = Secret::Encoded(secret.to_string())
        .to_bytes()
        .map_err(|_| TotpError::MalformedSecret)?;
    TOTP::new(
        Algorithm::SHA1,
        CODE_DIGITS,
        SKEW_STEPS,
        STEP_SECS,
        bytes,
        None,
        String::new(),
    )
    .map_err(|_| TotpError::MalformedSecret)
}

fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

//! Login and second-factor enrollment.
//!
//! A login runs the checks in a fixed order:
//!
//! 1. refuse immediately while the identity is locked out
//! 2. verify username and password
//! 3. if the identity has a second factor enabled, verify the code
//! 4. clear the failure history and issue a session token
//!
//! Any failure in steps 2 and 3 counts towards the lockout and is reported
//! as the same [`ServerError::InvalidCredentials`], whatever the cause.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::credentials::CredentialVerifier;
use crate::error::{Result, ServerError};
use crate::store::UserRepository;
use crate::throttle::{AttemptThrottle, LockStatus};
use crate::token::TokenService;
use crate::totp::{Enrollment, TotpError, TotpService};
use crate::types::User;

/// A freshly issued session token.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: u64,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Composes throttle, credential, second-factor and token checks.
#[derive(Clone)]
pub struct LoginService {
    throttle: AttemptThrottle,
    verifier: CredentialVerifier,
    totp: TotpService,
    tokens: TokenService,
}

impl LoginService {
    pub fn new(
        throttle: AttemptThrottle,
        verifier: CredentialVerifier,
        totp: TotpService,
        tokens: TokenService,
    ) -> Self {
        Self {
            throttle,
            verifier,
            totp,
            tokens,
        }
    }

    pub fn throttle(&self) -> &AttemptThrottle {
        &self.throttle
    }

    /// Authenticates `username` and issues a session token.
    ///
    /// # Errors
    ///
    /// - [`ServerError::TooManyAttempts`] while the identity is locked out
    /// - [`ServerError::InvalidCredentials`] for an unknown user, a wrong
    ///   password, or a missing or wrong second-factor code
    /// - storage failures, unchanged and not counted as login failures
    pub async fn login(&self, username: &str, password: &str, totp_code: Option<&str>) -> Result<IssuedToken> {
        if let LockStatus::Locked { retry_after_secs } = self.throttle.status(username) {
            warn!(retry_after_secs, "Login refused, identity locked");
            return Err(ServerError::TooManyAttempts {
                retry_after: retry_after_secs,
            });
        }

        let user = match self.verifier.authenticate(username, password).await {
            Ok(user) => user,
            Err(ServerError::InvalidCredentials | ServerError::NotFound { .. }) => {
                return Err(self.reject(username, "bad credentials"));
            }
            Err(e) => return Err(e),
        };

        if user.two_factor_enabled && !self.second_factor_ok(&user, totp_code)? {
            return Err(self.reject(username, "bad second factor"));
        }

        self.throttle.record_success(username);
        let access_token = self.tokens.issue(&user.username)?;
        info!(user_id = user.id, "Login succeeded");

        Ok(IssuedToken {
            access_token,
            expires_in: self.tokens.ttl().as_secs(),
        })
    }

    fn second_factor_ok(&self, user: &User, code: Option<&str>) -> Result<bool> {
        let Some(code) = code else {
            return Ok(false);
        };
        match self.totp.confirm(user, code) {
            Ok(valid) => Ok(valid),
            Err(e) => {
                error!(user_id = user.id, error = %e, "Second factor enabled but secret unusable");
                Err(ServerError::internal(format!("second factor misconfigured: {e}")))
            }
        }
    }

    fn reject(&self, username: &str, reason: &'static str) -> ServerError {
        let record = self.throttle.record_failure(username);
        info!(reason, failure_count = record.failure_count, "Login rejected");
        ServerError::InvalidCredentials
    }
}

impl std::fmt::Debug for LoginService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginService")
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

/// Second-factor enrollment for signed-in users.
#[derive(Clone)]
pub struct TwoFactorEnrollment {
    users: Arc<dyn UserRepository>,
    totp: TotpService,
    throttle: AttemptThrottle,
}

impl TwoFactorEnrollment {
    /// `throttle` should be shared with the [`LoginService`] so that wrong
    /// codes here and at login count towards the same lockout.
    pub fn new(users: Arc<dyn UserRepository>, totp: TotpService, throttle: AttemptThrottle) -> Self {
        Self { users, totp, throttle }
    }

    /// Generates and stores a fresh secret for `username`.
    ///
    /// The second factor stays disabled until [`TwoFactorEnrollment::confirm`]
    /// accepts a code. Re-enrolling replaces the pending secret; while a
    /// second factor is active, `current_code` must be a valid code for it.
    ///
    /// # Errors
    ///
    /// - [`ServerError::TooManyAttempts`] while the identity is locked out
    /// - [`ServerError::InvalidCredentials`] if the active factor's code is
    ///   missing or wrong
    /// - [`ServerError::Validation`] if the username cannot label a
    ///   provisioning URI
    pub async fn enable(&self, username: &str, current_code: Option<&str>) -> Result<Enrollment> {
        let mut user = self.find(username).await?;
        if user.two_factor_enabled {
            self.check_current_code(&user, current_code)?;
        }

        let enrollment = self.totp.enroll(&user.username).map_err(|e| match e {
            TotpError::InvalidLabel => ServerError::validation(e.to_string()),
            other => ServerError::internal(other.to_string()),
        })?;

        user.totp_secret = Some(enrollment.secret.clone());
        user.two_factor_enabled = false;
        self.users.save(user.clone()).await?;

        info!(user_id = user.id, "Second factor enrollment started");
        Ok(enrollment)
    }

    /// Activates the second factor if `code` matches the pending secret.
    ///
    /// Returns `false` for a wrong code.
    ///
    /// # Errors
    ///
    /// [`ServerError::Validation`] if enrollment was never started.
    pub async fn confirm(&self, username: &str, code: &str) -> Result<bool> {
        let mut user = self.find(username).await?;

        match self.totp.confirm(&user, code) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(TotpError::NotEnrolled) => {
                return Err(ServerError::validation("second factor enrollment not started"));
            }
            Err(e) => return Err(ServerError::internal(e.to_string())),
        }

        user.two_factor_enabled = true;
        let user_id = user.id;
        self.users.save(user).await?;
        info!(user_id, "Second factor enabled");
        Ok(true)
    }

    /// Re-enrollment replaces an active factor only with proof of it.
    fn check_current_code(&self, user: &User, code: Option<&str>) -> Result<()> {
        if let LockStatus::Locked { retry_after_secs } = self.throttle.status(&user.username) {
            return Err(ServerError::TooManyAttempts {
                retry_after: retry_after_secs,
            });
        }

        let valid = match code {
            Some(code) => self
                .totp
                .confirm(user, code)
                .map_err(|e| ServerError::internal(e.to_string()))?,
            None => false,
        };
        if !valid {
            let record = self.throttle.record_failure(&user.username);
            warn!(
                user_id = user.id,
                failure_count = record.failure_count,
                "Re-enrollment refused, current code missing or wrong"
            );
            return Err(ServerError::InvalidCredentials);
        }
        Ok(())
    }

    async fn find(&self, username: &str) -> Result<User> {
        self.users
            .find_by_username(username)
            .await?
            .ok_or_else(|| ServerError::not_found("User", "username", username))
    }
}

impl std::fmt::Debug for TwoFactorEnrollment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoFactorEnrollment")
            .field("issuer", &self.totp.issuer())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::hash_password_with_cost;
    use crate::store::InMemoryUserRepository;
    use crate::throttle::MAX_FAILED_ATTEMPTS;
    use crate::totp;
    use std::time::Duration;

    const PRIVATE_PEM: &str = include_str!("../tests/fixtures/jwt_private.pem");
    const PUBLIC_PEM: &str = include_str!("../tests/fixtures/jwt_public.pem");
    const SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    struct Fixture {
        login: LoginService,
        enrollment: TwoFactorEnrollment,
        users: Arc<InMemoryUserRepository>,
        tokens: TokenService,
    }

    async fn fixture() -> Fixture {
        let users = Arc::new(InMemoryUserRepository::new());
        let hash = hash_password_with_cost("s3cret", 4).unwrap();
        users.save(User::new(1, "alice", hash.clone())).await.unwrap();

        let mut bob = User::new(2, "bob", hash);
        bob.totp_secret = Some(SECRET.to_string());
        bob.two_factor_enabled = true;
        users.save(bob).await.unwrap();

        let tokens = TokenService::from_pem(PRIVATE_PEM, PUBLIC_PEM, Duration::from_secs(600)).unwrap();
        let throttle = AttemptThrottle::default();
        let login = LoginService::new(
            throttle.clone(),
            CredentialVerifier::new(users.clone()),
            TotpService::new("Courier"),
            tokens.clone(),
        );
        let enrollment = TwoFactorEnrollment::new(users.clone(), TotpService::new("Courier"), throttle);
        Fixture {
            login,
            enrollment,
            users,
            tokens,
        }
    }

    fn current_code() -> String {
        totp::code_at(SECRET, chrono::Utc::now().timestamp() as u64).unwrap()
    }

    #[tokio::test]
    async fn valid_credentials_issue_token_for_username() {
        let f = fixture().await;

        let issued = f.login.login("alice", "s3cret", None).await.unwrap();

        assert_eq!(issued.expires_in, 600);
        assert_eq!(f.tokens.subject_of(&issued.access_token).unwrap(), "alice");
    }

    #[tokio::test]
    async fn unknown_user_and_wrong_password_are_indistinguishable() {
        let f = fixture().await;

        let unknown = f.login.login("mallory", "s3cret", None).await.unwrap_err();
        let wrong = f.login.login("alice", "nope", None).await.unwrap_err();

        assert!(matches!(unknown, ServerError::InvalidCredentials));
        assert!(matches!(wrong, ServerError::InvalidCredentials));
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[tokio::test]
    async fn fifth_failure_locks_even_correct_password() {
        let f = fixture().await;
        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = f.login.login("alice", "nope", None).await;
        }

        let err = f.login.login("alice", "s3cret", None).await.unwrap_err();

        match err {
            ServerError::TooManyAttempts { retry_after } => assert!(retry_after > 14 * 60),
            other => panic!("expected lockout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let f = fixture().await;
        for _ in 0..MAX_FAILED_ATTEMPTS - 1 {
            let _ = f.login.login("alice", "nope", None).await;
        }

        f.login.login("alice", "s3cret", None).await.unwrap();

        assert!(f.login.throttle().record("alice").is_none());
        let _ = f.login.login("alice", "nope", None).await;
        assert_eq!(f.login.throttle().record("alice").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn second_factor_required_when_enabled() {
        let f = fixture().await;

        let missing = f.login.login("bob", "s3cret", None).await.unwrap_err();
        let wrong = f.login.login("bob", "s3cret", Some("000000")).await;

        assert!(matches!(missing, ServerError::InvalidCredentials));
        // A fixed code can collide with the live one once in a million runs.
        if current_code() != "000000" {
            assert!(matches!(wrong, Err(ServerError::InvalidCredentials)));
        }
        assert!(f.login.throttle().record("bob").unwrap().failure_count >= 1);

        let issued = f.login.login("bob", "s3cret", Some(&current_code())).await.unwrap();
        assert_eq!(f.tokens.subject_of(&issued.access_token).unwrap(), "bob");
        assert!(f.login.throttle().record("bob").is_none());
    }

    #[tokio::test]
    async fn enrollment_activates_only_after_confirmation() {
        let f = fixture().await;
        let enrollment = &f.enrollment;

        let pending = enrollment.enable("alice", None).await.unwrap();
        let stored = f.users.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(stored.totp_secret.as_deref(), Some(pending.secret.as_str()));
        assert!(!stored.two_factor_enabled);

        let code = totp::code_at(&pending.secret, chrono::Utc::now().timestamp() as u64).unwrap();
        assert!(enrollment.confirm("alice", &code).await.unwrap());
        assert!(f.users.find_by_username("alice").await.unwrap().unwrap().two_factor_enabled);
    }

    #[tokio::test]
    async fn confirm_with_wrong_code_leaves_factor_disabled() {
        let f = fixture().await;
        let enrollment = &f.enrollment;
        enrollment.enable("alice", None).await.unwrap();

        assert!(!enrollment.confirm("alice", "12345").await.unwrap());
        assert!(!f.users.find_by_username("alice").await.unwrap().unwrap().two_factor_enabled);
    }

    #[tokio::test]
    async fn confirm_without_enrollment_is_a_validation_error() {
        let f = fixture().await;
        let enrollment = &f.enrollment;

        assert!(matches!(
            enrollment.confirm("alice", "123456").await,
            Err(ServerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn re_enrollment_without_current_code_keeps_active_factor() {
        let f = fixture().await;

        let missing = f.enrollment.enable("bob", None).await.unwrap_err();
        assert!(matches!(missing, ServerError::InvalidCredentials));
        if current_code() != "000000" {
            let wrong = f.enrollment.enable("bob", Some("000000")).await.unwrap_err();
            assert!(matches!(wrong, ServerError::InvalidCredentials));
        }

        let bob = f.users.find_by_username("bob").await.unwrap().unwrap();
        assert!(bob.two_factor_enabled);
        assert_eq!(bob.totp_secret.as_deref(), Some(SECRET));
        assert!(f.login.throttle().record("bob").unwrap().failure_count >= 1);
    }

    #[tokio::test]
    async fn re_enrollment_with_current_code_starts_over() {
        let f = fixture().await;

        let pending = f.enrollment.enable("bob", Some(&current_code())).await.unwrap();

        let bob = f.users.find_by_username("bob").await.unwrap().unwrap();
        assert!(!bob.two_factor_enabled);
        assert_eq!(bob.totp_secret.as_deref(), Some(pending.secret.as_str()));
        assert_ne!(pending.secret, SECRET);
    }

    #[tokio::test]
    async fn re_enrollment_is_refused_while_locked_out() {
        let f = fixture().await;
        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = f.login.login("bob", "nope", None).await;
        }

        let err = f.enrollment.enable("bob", Some(&current_code())).await.unwrap_err();

        assert!(matches!(err, ServerError::TooManyAttempts { .. }));
        assert!(f.users.find_by_username("bob").await.unwrap().unwrap().two_factor_enabled);
    }

    #[tokio::test]
    async fn enrollment_rejects_username_unusable_in_uri() {
        let f = fixture().await;
        f.users
            .save(User::new(3, "ca:rol", hash_password_with_cost("pw", 4).unwrap()))
            .await
            .unwrap();

        assert!(matches!(
            f.enrollment.enable("ca:rol", None).await,
            Err(ServerError::Validation(_))
        ));
    }

    #[test]
    fn issued_token_debug_is_redacted() {
        let issued = IssuedToken {
            access_token: "eyJhbGciOi.secret.sig".into(),
            expires_in: 60,
        };
        assert!(!format!("{issued:?}").contains("eyJ"));
    }
}

//! Username and password verification.
//!
//! Passwords are stored as bcrypt hashes and compared with `bcrypt::verify`,
//! which recomputes the hash and compares in constant time. Hashing runs on
//! the blocking pool so a login never stalls the async executor.

use std::sync::Arc;

use bcrypt::{BcryptError, DEFAULT_COST};
use tracing::{debug, warn};

use crate::error::{Result, ServerError};
use crate::store::UserRepository;
use crate::types::User;

/// Hashes `password` with the default bcrypt cost.
pub fn hash_password(password: &str) -> std::result::Result<String, BcryptError> {
    hash_password_with_cost(password, DEFAULT_COST)
}

/// Hashes `password` with an explicit bcrypt cost.
pub fn hash_password_with_cost(password: &str, cost: u32) -> std::result::Result<String, BcryptError> {
    bcrypt::hash(password, cost)
}

/// Returns `true` if `password` matches `hash`.
///
/// A malformed hash never matches.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match bcrypt::verify(password, hash) {
        Ok(matched) => matched,
        Err(e) => {
            warn!(error = %e, "Stored password hash could not be parsed");
            false
        }
    }
}

/// Checks credentials against the user repository.
#[derive(Clone)]
pub struct CredentialVerifier {
    users: Arc<dyn UserRepository>,
}

impl CredentialVerifier {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self { users }
    }

    /// Returns the identity for `username` if `password` matches its hash.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NotFound`] if no such user exists
    /// - [`ServerError::InvalidCredentials`] if the password does not match
    ///
    /// Callers facing clients must collapse both into the same rejection.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let user = self
            .users
            .find_by_username(username)
            .await?
            .ok_or_else(|| ServerError::not_found("User", "username", username))?;

        let candidate = password.to_owned();
        let hash = user.password_hash.clone();
        let matched = tokio::task::spawn_blocking(move || verify_password(&candidate, &hash))
            .await
            .map_err(|e| ServerError::internal(format!("password check task failed: {e}")))?;

        if !matched {
            debug!(user_id = user.id, "Password mismatch");
            return Err(ServerError::InvalidCredentials);
        }

        Ok(user)
    }
}

impl std::fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVerifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryUserRepository;

    const TEST_COST: u32 = 4;

    async fn verifier_with_alice() -> CredentialVerifier {
        let users = Arc::new(InMemoryUserRepository::new());
        let hash = hash_password_with_cost("correct horse", TEST_COST).unwrap();
        users.save(User::new(1, "alice", hash)).await.unwrap();
        CredentialVerifier::new(users)
    }

    #[tokio::test]
    async fn matching_password_returns_identity() {
        let verifier = verifier_with_alice().await;
        let user = verifier.authenticate("alice", "correct horse").await.unwrap();
        assert_eq!(user.id, 1);
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let verifier = verifier_with_alice().await;
        let err = verifier.authenticate("alice", "battery staple").await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidCredentials));
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let verifier = verifier_with_alice().await;
        let err = verifier.authenticate("mallory", "correct horse").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password_with_cost("pw", TEST_COST).unwrap();
        let b = hash_password_with_cost("pw", TEST_COST).unwrap();
        assert_ne!(a, b);
        assert!(verify_password("pw", &a));
        assert!(verify_password("pw", &b));
    }

    #[test]
    fn malformed_hash_never_matches() {
        assert!(!verify_password("pw", "not-a-bcrypt-hash"));
    }
}

//! In-memory user table with Argon2 password hashes

use std::collections::HashMap;

use argon2::password_hash::PasswordHash;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::password::{verify_password, PasswordError};
use crate::PasswordAuthenticator;

/// Fixed set of users, each with a PHC-formatted Argon2 hash.
///
/// Hashes are validated when a user is added so a malformed entry fails at
/// startup instead of on the first login.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn add_user(
        &mut self,
        username: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Result<(), PasswordError> {
        let password_hash = password_hash.into();
        PasswordHash::new(&password_hash)
            .map_err(|e| PasswordError::InvalidHashFormat(e.to_string()))?;
        self.users.insert(username.into(), password_hash);
        Ok(())
    }

    pub fn with_user(
        mut self,
        username: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Result<Self, PasswordError> {
        self.add_user(username, password_hash)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl PasswordAuthenticator for StaticCredentials {
    async fn authenticated(&self, username: &str, password: &str) -> bool {
        let Some(hash) = self.users.get(username) else {
            debug!(user = %username, "Unknown user");
            return false;
        };

        match verify_password(password, hash) {
            Ok(valid) => valid,
            Err(e) => {
                warn!(user = %username, "Password verification failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::hash_password;

    #[tokio::test]
    async fn test_known_user_with_correct_password() {
        let creds = StaticCredentials::new()
            .with_user("admin", hash_password("secret").unwrap())
            .unwrap();

        assert!(creds.authenticated("admin", "secret").await);
        assert!(!creds.authenticated("admin", "Secret").await);
    }

    #[tokio::test]
    async fn test_unknown_user_is_rejected() {
        let creds = StaticCredentials::new()
            .with_user("admin", hash_password("secret").unwrap())
            .unwrap();

        assert!(!creds.authenticated("root", "secret").await);
    }

    #[test]
    fn test_malformed_hash_is_rejected_up_front() {
        let mut creds = StaticCredentials::new();
        let result = creds.add_user("admin", "plaintext");

        assert!(matches!(result, Err(PasswordError::InvalidHashFormat(_))));
        assert!(creds.is_empty());
    }

    #[test]
    fn test_add_user_replaces_existing() {
        let mut creds = StaticCredentials::new();
        creds.add_user("admin", hash_password("one").unwrap()).unwrap();
        creds.add_user("admin", hash_password("two").unwrap()).unwrap();

        assert_eq!(creds.len(), 1);
    }
}

//! Password authentication capability for the proxy
//!
//! The proxy core only ever asks one question: do these credentials pass?
//! [`PasswordAuthenticator`] is that question. Anything from a static user
//! table to a remote directory can answer it; [`StaticCredentials`] is the
//! Argon2-backed table used by the `ncproxy` binary.

pub mod credentials;
pub mod password;

pub use credentials::StaticCredentials;
pub use password::{hash_password, verify_password, PasswordError};

// Re-export useful types
pub use async_trait::async_trait;

/// Decides whether a username/password pair is accepted.
///
/// Implementations own any hardening (lockout, rate limiting, auditing); the
/// proxy calls this once per password attempt and uses the answer as-is.
#[async_trait]
pub trait PasswordAuthenticator: Send + Sync {
    async fn authenticated(&self, username: &str, password: &str) -> bool;
}

#[async_trait]
impl<F> PasswordAuthenticator for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    async fn authenticated(&self, username: &str, password: &str) -> bool {
        self(username, password)
    }
}

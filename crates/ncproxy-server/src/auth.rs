//! Bridges the external password capability into the transport

use std::sync::Arc;

use ncproxy_auth::PasswordAuthenticator;
use tracing::debug;

use crate::transport::SessionContext;

/// Hands password checks straight to the configured authenticator.
///
/// No caching and no throttling happen here; the answer of the wrapped
/// authenticator is the answer of the adapter.
#[derive(Clone)]
pub struct AuthenticationAdapter {
    authenticator: Arc<dyn PasswordAuthenticator>,
}

impl AuthenticationAdapter {
    pub fn new(authenticator: Arc<dyn PasswordAuthenticator>) -> Self {
        Self { authenticator }
    }

    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        context: &SessionContext,
    ) -> bool {
        let accepted = self.authenticator.authenticated(username, password).await;
        debug!(
            session = %context.session_id,
            peer = %context.peer_addr,
            user = %username,
            accepted,
            "Password authentication"
        );
        accepted
    }
}

impl std::fmt::Debug for AuthenticationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationAdapter").finish_non_exhaustive()
    }
}

//! SSH transport built on russh
//!
//! Each accepted TCP session is run through `russh::server::run_stream`. The
//! russh handler checks passwords through the
//! [`AuthenticationAdapter`](crate::auth::AuthenticationAdapter), accepts
//! session channels and serves registered subsystems. Everything else a
//! client may ask for (shells, exec, forwarding) falls through to russh's
//! default refusal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ncproxy_transport::{IoHandler, IoSession, TransportError, TransportResult};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet, Preferred};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::transport::{SecureTransport, SessionContext, TransportSettings};

/// How long a disconnect message gets to reach the client.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Delay before a failed password attempt is answered.
const AUTH_REJECTION_TIME: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Production [`SecureTransport`]: an SSH server offering password
/// authentication only.
#[derive(Debug, Clone, Default)]
pub struct RusshTransport;

impl RusshTransport {
    pub fn new() -> Self {
        Self
    }

    fn build_config(settings: &TransportSettings) -> Result<russh::server::Config, TransportError> {
        let cipher: Vec<russh::cipher::Name> = Preferred::default()
            .cipher
            .iter()
            .copied()
            .filter(|name| settings.ciphers.iter().any(|allowed| allowed == cipher_name(name)))
            .collect();
        if cipher.is_empty() {
            return Err(TransportError::ConfigurationError(
                "no ciphers left to offer".to_string(),
            ));
        }
        if settings.host_keys.is_empty() {
            return Err(TransportError::ConfigurationError(
                "no host keys configured".to_string(),
            ));
        }

        Ok(russh::server::Config {
            inactivity_timeout: Some(settings.properties.idle_timeout),
            auth_rejection_time: AUTH_REJECTION_TIME,
            auth_rejection_time_initial: Some(Duration::ZERO),
            methods: MethodSet::from([MethodKind::Password].as_slice()),
            keys: settings.host_keys.clone(),
            preferred: Preferred {
                cipher: cipher.into(),
                ..Preferred::default()
            },
            ..Default::default()
        })
    }
}

impl SecureTransport for RusshTransport {
    fn cipher_names(&self) -> Vec<String> {
        Preferred::default()
            .cipher
            .iter()
            .map(|name| cipher_name(name).to_string())
            .collect()
    }

    fn session_handler(
        &self,
        settings: TransportSettings,
    ) -> Result<Arc<dyn IoHandler>, TransportError> {
        let config = Arc::new(Self::build_config(&settings)?);
        debug!(ciphers = ?settings.ciphers, "SSH transport configured");
        Ok(Arc::new(SshIoHandler { config, settings }))
    }
}

fn cipher_name(name: &russh::cipher::Name) -> &str {
    name.as_ref()
}

/// Runs the SSH protocol over every accepted connection.
struct SshIoHandler {
    config: Arc<russh::server::Config>,
    settings: TransportSettings,
}

#[async_trait]
impl IoHandler for SshIoHandler {
    async fn session_created(&self, session: IoSession) -> TransportResult<()> {
        let IoSession {
            id,
            stream,
            peer_addr,
            shutdown,
            ..
        } = session;

        let (authenticated_tx, authenticated_rx) = watch::channel(false);
        let handler = SshSessionHandler {
            context: SessionContext::new(id, peer_addr),
            settings: self.settings.clone(),
            channels: HashMap::new(),
            authenticated: authenticated_tx,
        };

        // The auth deadline also covers the identification exchange
        let deadline = Instant::now() + self.settings.properties.auth_timeout;
        let setup = tokio::time::timeout_at(
            deadline,
            russh::server::run_stream(self.config.clone(), stream, handler),
        );
        let mut running = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = setup => match result {
                Ok(Ok(running)) => running,
                Ok(Err(e)) => {
                    return Err(TransportError::Session(format!(
                        "SSH setup with {} failed: {}",
                        peer_addr, e
                    )));
                }
                Err(_) => {
                    info!(session = %id, peer = %peer_addr, "Authentication timeout during handshake");
                    return Ok(());
                }
            },
        };

        let handle = running.handle();
        let reason = tokio::select! {
            biased;
            result = &mut running => {
                match result {
                    Ok(()) => debug!(session = %id, "SSH session ended"),
                    Err(SessionError::Ssh(russh::Error::InactivityTimeout)) => {
                        info!(session = %id, peer = %peer_addr, "Idle timeout, session closed");
                    }
                    Err(e) => warn!(session = %id, peer = %peer_addr, "SSH session error: {}", e),
                }
                return Ok(());
            }
            _ = auth_deadline(deadline, authenticated_rx) => {
                info!(session = %id, peer = %peer_addr, "Authentication timeout");
                "Authentication timeout"
            }
            _ = shutdown.cancelled() => "Server shutting down",
        };

        let _ = handle
            .disconnect(Disconnect::ByApplication, reason.to_string(), "en".to_string())
            .await;
        let _ = tokio::time::timeout(DISCONNECT_GRACE, running).await;
        Ok(())
    }
}

/// Resolves at `deadline` unless the client authenticated first.
async fn auth_deadline(deadline: Instant, mut authenticated: watch::Receiver<bool>) {
    let expired = tokio::time::sleep_until(deadline);
    tokio::pin!(expired);

    loop {
        tokio::select! {
            _ = &mut expired => return,
            changed = authenticated.changed() => {
                // A dropped sender means the session is already gone
                let disarmed = changed.is_err() || *authenticated.borrow();
                if disarmed {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

/// russh handler for one client connection.
struct SshSessionHandler {
    context: SessionContext,
    settings: TransportSettings,
    /// Session channels opened but not yet claimed by a subsystem.
    channels: HashMap<ChannelId, Channel<Msg>>,
    authenticated: watch::Sender<bool>,
}

impl russh::server::Handler for SshSessionHandler {
    type Error = SessionError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let accepted = self
            .settings
            .authenticator
            .authenticate(user, password, &self.context)
            .await;
        if accepted {
            info!(session = %self.context.session_id, user = %user, "Client authenticated");
            self.context.username = Some(user.to_string());
            self.authenticated.send_replace(true);
            return Ok(Auth::Accept);
        }

        warn!(
            session = %self.context.session_id,
            peer = %self.context.peer_addr,
            user = %user,
            "Password authentication failed"
        );
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
            partial_success: false,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(session = %self.context.session_id, channel = ?channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(factory) = self.settings.subsystem(name) else {
            warn!(session = %self.context.session_id, subsystem = %name, "Unknown subsystem requested");
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        let Some(channel) = self.channels.remove(&channel_id) else {
            warn!(session = %self.context.session_id, channel = ?channel_id, "Subsystem requested on unknown channel");
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let command = match factory.create(&self.context).await {
            Ok(command) => command,
            Err(e) => {
                warn!(session = %self.context.session_id, subsystem = %name, "Subsystem unavailable: {}", e);
                session.channel_failure(channel_id)?;
                session.close(channel_id)?;
                return Ok(());
            }
        };

        session.channel_success(channel_id)?;
        let handle = session.handle();
        let session_id = self.context.session_id;
        let subsystem = name.to_string();
        let spawned = self.settings.io.spawn(async move {
            match command.run(Box::new(channel.into_stream())).await {
                Ok(summary) => debug!(
                    session = %session_id,
                    subsystem = %subsystem,
                    ended_by = ?summary.ended_by,
                    "Subsystem finished"
                ),
                Err(e) => warn!(session = %session_id, subsystem = %subsystem, "Subsystem failed: {}", e),
            }
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
        if let Err(e) = spawned {
            warn!(session = %session_id, "Could not start subsystem: {}", e);
            session.close(channel_id)?;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}

impl Drop for SshSessionHandler {
    fn drop(&mut self) {
        debug!(
            session = %self.context.session_id,
            peer = %self.context.peer_addr,
            user = ?self.context.username,
            "SSH session handler dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticationAdapter;
    use crate::config::TransportProperties;
    use crate::keys::{KeyPairProvider, StaticKeyPairProvider};
    use ncproxy_transport::AsyncIoService;
    use tokio::runtime::Handle;

    fn settings(io: AsyncIoService, ciphers: Vec<String>) -> TransportSettings {
        TransportSettings {
            ciphers,
            authenticator: AuthenticationAdapter::new(Arc::new(|_: &str, _: &str| true)),
            host_keys: StaticKeyPairProvider::ed25519_from_seed(&[3; 32])
                .load_keys()
                .unwrap(),
            properties: TransportProperties {
                idle_timeout: Duration::from_secs(30),
                auth_timeout: Duration::from_secs(10),
                connect_timeout: Duration::from_secs(5),
            },
            subsystems: Vec::new(),
            io,
        }
    }

    #[test]
    fn test_offers_default_ciphers() {
        let names = RusshTransport::new().cipher_names();
        assert!(!names.is_empty());
        assert!(names.iter().all(|n| !n.contains("arcfour")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_config_keeps_only_allowed_ciphers() {
        let io = AsyncIoService::new(Handle::current()).unwrap();
        let offered = RusshTransport::new().cipher_names();
        let allowed = vec![offered[0].clone()];

        let config = RusshTransport::build_config(&settings(io, allowed.clone())).unwrap();

        let negotiated: Vec<&str> = config.preferred.cipher.iter().map(cipher_name).collect();
        assert_eq!(negotiated, vec![allowed[0].as_str()]);
        assert_eq!(config.inactivity_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.keys.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_config_without_ciphers_is_rejected() {
        let io = AsyncIoService::new(Handle::current()).unwrap();
        let result = RusshTransport::new().session_handler(settings(io, Vec::new()));

        assert!(matches!(result, Err(TransportError::ConfigurationError(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_auth_deadline_disarmed_by_authentication() {
        let (tx, rx) = watch::channel(false);
        let deadline = Instant::now() + Duration::from_millis(200);
        tx.send_replace(true);

        let fired = tokio::time::timeout(Duration::from_millis(500), auth_deadline(deadline, rx)).await;
        assert!(fired.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_auth_deadline_fires() {
        let (_tx, rx) = watch::channel(false);
        let deadline = Instant::now() + Duration::from_millis(100);

        let fired = tokio::time::timeout(Duration::from_secs(2), auth_deadline(deadline, rx)).await;
        assert!(fired.is_ok());
    }
}

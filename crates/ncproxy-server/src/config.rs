//! Proxy configuration

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ncproxy_auth::PasswordAuthenticator;
use ncproxy_transport::DEFAULT_CONNECT_TIMEOUT;
use thiserror::Error;

use crate::keys::KeyPairProvider;

/// Session inactivity timeout used when none is configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {0}")]
    MissingField(&'static str),

    #[error("Invalid {name}: must be greater than zero")]
    InvalidTimeout { name: &'static str },
}

/// Everything the proxy needs to bind one listener.
#[derive(Clone)]
pub struct ProxyConfiguration {
    /// Address the proxy listens on.
    pub binding_address: SocketAddr,
    /// Address every `netconf` channel is bridged to.
    pub backend_address: SocketAddr,
    pub authenticator: Arc<dyn PasswordAuthenticator>,
    pub key_pair_provider: Arc<dyn KeyPairProvider>,
    pub idle_timeout: Duration,
    /// Deadline for a client to finish authenticating.
    pub auth_timeout: Duration,
    /// Limit on dialling the backend for a subsystem request.
    pub connect_timeout: Duration,
}

impl ProxyConfiguration {
    pub fn builder() -> ProxyConfigurationBuilder {
        ProxyConfigurationBuilder::default()
    }
}

impl fmt::Debug for ProxyConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfiguration")
            .field("binding_address", &self.binding_address)
            .field("backend_address", &self.backend_address)
            .field("idle_timeout", &self.idle_timeout)
            .field("auth_timeout", &self.auth_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ProxyConfigurationBuilder {
    binding_address: Option<SocketAddr>,
    backend_address: Option<SocketAddr>,
    authenticator: Option<Arc<dyn PasswordAuthenticator>>,
    key_pair_provider: Option<Arc<dyn KeyPairProvider>>,
    idle_timeout: Option<Duration>,
    auth_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl ProxyConfigurationBuilder {
    pub fn binding_address(mut self, addr: SocketAddr) -> Self {
        self.binding_address = Some(addr);
        self
    }

    pub fn backend_address(mut self, addr: SocketAddr) -> Self {
        self.backend_address = Some(addr);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn PasswordAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn key_pair_provider(mut self, provider: Arc<dyn KeyPairProvider>) -> Self {
        self.key_pair_provider = Some(provider);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Defaults to the idle timeout.
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = Some(timeout);
        self
    }

    /// Defaults to 10 seconds, or the idle timeout when that is shorter.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ProxyConfiguration, ConfigError> {
        let idle_timeout = self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT);
        Ok(ProxyConfiguration {
            binding_address: self
                .binding_address
                .ok_or(ConfigError::MissingField("binding_address"))?,
            backend_address: self
                .backend_address
                .ok_or(ConfigError::MissingField("backend_address"))?,
            authenticator: self
                .authenticator
                .ok_or(ConfigError::MissingField("authenticator"))?,
            key_pair_provider: self
                .key_pair_provider
                .ok_or(ConfigError::MissingField("key_pair_provider"))?,
            idle_timeout,
            auth_timeout: self.auth_timeout.unwrap_or(idle_timeout),
            connect_timeout: self
                .connect_timeout
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT.min(idle_timeout)),
        })
    }
}

/// Timeouts handed to the secure transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportProperties {
    pub idle_timeout: Duration,
    pub auth_timeout: Duration,
    pub connect_timeout: Duration,
}

impl TransportProperties {
    pub fn from_config(config: &ProxyConfiguration) -> Result<Self, ConfigError> {
        let properties = Self {
            idle_timeout: config.idle_timeout,
            auth_timeout: config.auth_timeout,
            connect_timeout: config.connect_timeout,
        };
        properties.validate()?;
        Ok(properties)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                name: "idle_timeout",
            });
        }
        if self.auth_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                name: "auth_timeout",
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                name: "connect_timeout",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::StaticKeyPairProvider;

    fn base() -> ProxyConfigurationBuilder {
        ProxyConfiguration::builder()
            .binding_address("127.0.0.1:830".parse().unwrap())
            .backend_address("127.0.0.1:2830".parse().unwrap())
            .authenticator(Arc::new(|_: &str, _: &str| false))
            .key_pair_provider(Arc::new(StaticKeyPairProvider::ed25519_from_seed(&[1; 32])))
    }

    #[test]
    fn test_defaults() {
        let config = base().build().unwrap();

        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.auth_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_connect_timeout_never_outlasts_idle_timeout() {
        let config = base().idle_timeout(Duration::from_secs(2)).build().unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(2));

        let config = base()
            .idle_timeout(Duration::from_secs(2))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_auth_timeout_follows_idle_timeout() {
        let config = base().idle_timeout(Duration::from_secs(30)).build().unwrap();
        assert_eq!(config.auth_timeout, Duration::from_secs(30));

        let config = base()
            .idle_timeout(Duration::from_secs(30))
            .auth_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.auth_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_fields() {
        let err = ProxyConfiguration::builder().build().unwrap_err();
        assert_eq!(err, ConfigError::MissingField("binding_address"));

        let err = ProxyConfiguration::builder()
            .binding_address("127.0.0.1:830".parse().unwrap())
            .backend_address("127.0.0.1:2830".parse().unwrap())
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingField("authenticator"));
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let config = base().idle_timeout(Duration::ZERO).build().unwrap();
        assert_eq!(
            TransportProperties::from_config(&config).unwrap_err(),
            ConfigError::InvalidTimeout {
                name: "idle_timeout"
            }
        );

        let config = base().auth_timeout(Duration::ZERO).build().unwrap();
        assert_eq!(
            TransportProperties::from_config(&config).unwrap_err(),
            ConfigError::InvalidTimeout {
                name: "auth_timeout"
            }
        );

        let config = base().connect_timeout(Duration::ZERO).build().unwrap();
        assert_eq!(
            TransportProperties::from_config(&config).unwrap_err(),
            ConfigError::InvalidTimeout {
                name: "connect_timeout"
            }
        );
    }

    #[test]
    fn test_debug_hides_capabilities() {
        let rendered = format!("{:?}", base().build().unwrap());
        assert!(rendered.contains("127.0.0.1:830"));
        assert!(!rendered.contains("authenticator"));
    }
}

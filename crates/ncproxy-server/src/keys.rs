//! Host key providers

use std::path::{Path, PathBuf};

use russh::keys::ssh_key::{private::Ed25519Keypair, LineEnding};
use russh::keys::PrivateKey;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Failed to access host key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode host key {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("Failed to encode generated host key: {0}")]
    Encode(#[from] russh::keys::ssh_key::Error),

    #[error("No host keys available")]
    Empty,
}

/// Supplies the server's host keys when the proxy binds.
///
/// Called once per bind; the keys are then fixed for the lifetime of that
/// listener.
pub trait KeyPairProvider: Send + Sync {
    fn load_keys(&self) -> Result<Vec<PrivateKey>, KeyError>;
}

/// Keys held in memory.
#[derive(Debug, Clone)]
pub struct StaticKeyPairProvider {
    keys: Vec<PrivateKey>,
}

impl StaticKeyPairProvider {
    pub fn new(keys: Vec<PrivateKey>) -> Self {
        Self { keys }
    }

    /// Single Ed25519 key derived from `seed`. Useful for tests that need a
    /// stable host identity.
    pub fn ed25519_from_seed(seed: &[u8; 32]) -> Self {
        Self::new(vec![PrivateKey::from(Ed25519Keypair::from_seed(seed))])
    }

    /// Single freshly generated Ed25519 key.
    pub fn generated() -> Self {
        Self::ed25519_from_seed(&rand::random())
    }
}

impl KeyPairProvider for StaticKeyPairProvider {
    fn load_keys(&self) -> Result<Vec<PrivateKey>, KeyError> {
        if self.keys.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(self.keys.clone())
    }
}

/// OpenSSH private key file, optionally created on first use.
#[derive(Debug, Clone)]
pub struct FileKeyPairProvider {
    path: PathBuf,
    generate_if_missing: bool,
}

impl FileKeyPairProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            generate_if_missing: true,
        }
    }

    /// Fail instead of writing a new key when the file does not exist.
    pub fn existing_only(mut self) -> Self {
        self.generate_if_missing = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> KeyError {
        KeyError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn generate(&self) -> Result<PrivateKey, KeyError> {
        info!("Generating new Ed25519 host key at {}", self.path.display());
        let key = PrivateKey::from(Ed25519Keypair::from_seed(&rand::random()));
        let encoded = key.to_openssh(LineEnding::LF)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }
        std::fs::write(&self.path, encoded.as_bytes()).map_err(|e| self.io_error(e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms).map_err(|e| self.io_error(e))?;
        }

        Ok(key)
    }
}

impl KeyPairProvider for FileKeyPairProvider {
    fn load_keys(&self) -> Result<Vec<PrivateKey>, KeyError> {
        match std::fs::read_to_string(&self.path) {
            Ok(encoded) => {
                debug!("Loading host key from {}", self.path.display());
                let key = russh::keys::decode_secret_key(&encoded, None).map_err(|source| {
                    KeyError::Decode {
                        path: self.path.clone(),
                        source,
                    }
                })?;
                Ok(vec![key])
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.generate_if_missing => {
                Ok(vec![self.generate()?])
            }
            Err(e) => Err(self.io_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_is_reloaded_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileKeyPairProvider::new(dir.path().join("keys").join("host_ed25519"));

        let first = provider.load_keys().unwrap();
        assert!(provider.path().exists());

        let second = provider.load_keys().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].public_key(), second[0].public_key());
    }

    #[cfg(unix)]
    #[test]
    fn test_generated_key_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let provider = FileKeyPairProvider::new(dir.path().join("host_ed25519"));
        provider.load_keys().unwrap();

        let mode = std::fs::metadata(provider.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_file_without_generation() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileKeyPairProvider::new(dir.path().join("absent")).existing_only();

        assert!(matches!(provider.load_keys(), Err(KeyError::Io { .. })));
        assert!(!provider.path().exists());
    }

    #[test]
    fn test_garbage_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");
        std::fs::write(&path, "not a key").unwrap();

        let result = FileKeyPairProvider::new(&path).load_keys();
        assert!(matches!(result, Err(KeyError::Decode { .. })));
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticKeyPairProvider::ed25519_from_seed(&[7u8; 32]);
        let again = StaticKeyPairProvider::ed25519_from_seed(&[7u8; 32]);

        assert_eq!(
            provider.load_keys().unwrap()[0].public_key(),
            again.load_keys().unwrap()[0].public_key()
        );
        assert!(matches!(
            StaticKeyPairProvider::new(Vec::new()).load_keys(),
            Err(KeyError::Empty)
        ));
    }
}

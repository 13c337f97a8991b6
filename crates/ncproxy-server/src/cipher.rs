//! Cipher exclusion policy

/// RC4 stream ciphers. Never offered by the proxy, whatever the transport
/// library enables by default.
pub const ARCFOUR128: &str = "arcfour128";
pub const ARCFOUR256: &str = "arcfour256";

/// Removes excluded algorithms from a transport's offered cipher list.
///
/// Matching is by substring, so `arcfour256` also catches vendor-suffixed
/// names such as `arcfour256@example.org`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherPolicy {
    excluded: Vec<String>,
}

impl Default for CipherPolicy {
    fn default() -> Self {
        Self {
            excluded: vec![ARCFOUR128.to_string(), ARCFOUR256.to_string()],
        }
    }
}

impl CipherPolicy {
    /// Exclude `names` on top of the current list.
    pub fn with_excluded<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.iter().any(|weak| name.contains(weak.as_str()))
    }

    /// Drop excluded entries in place; the rest keep their order.
    pub fn apply<T: AsRef<str>>(&self, offered: &mut Vec<T>) {
        offered.retain(|cipher| !self.is_excluded(cipher.as_ref()));
    }

    pub fn filtered<T: AsRef<str>>(&self, mut offered: Vec<T>) -> Vec<T> {
        self.apply(&mut offered);
        offered
    }
}

//! Identifier generation.
//!
//! An [`Identifier`] is both the registry key and the final path segment of
//! the public callback URL, so it is drawn from a base62 alphabet only.
//! Twelve base62 characters give ~71 bits of entropy, which keeps the
//! collision probability negligible for any realistic number of live sessions.

use std::borrow::Borrow;
use std::fmt;

use rand::Rng;

/// URL-safe alphabet for generated identifiers.
const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length of generated identifiers, in characters.
pub const ID_LEN: usize = 12;

/// Opaque token routing webhook deliveries to one waiting session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let token = (0..ID_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..CHARSET.len());
                CHARSET[idx] as char
            })
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for Identifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

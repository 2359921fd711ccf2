//! Bearer credentials presented when opening a channel.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A non-empty bearer token.
///
/// `Debug` never prints the token itself.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Credential(String);

impl Credential {
    /// Create a credential, rejecting blank tokens.
    pub fn new(token: impl Into<String>) -> Result<Self, CredentialError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(CredentialError::Empty);
        }
        Ok(Self(token))
    }

    /// Treat a missing or blank token as "no credential".
    pub fn from_optional(token: Option<&str>) -> Option<Self> {
        token.and_then(|t| Self::new(t).ok())
    }

    /// The raw token.
    pub fn token(&self) -> &str {
        &self.0
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&"<redacted>").finish()
    }
}

impl FromStr for Credential {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Credential {
    type Error = CredentialError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Credential> for String {
    fn from(c: Credential) -> Self {
        c.0
    }
}

/// Error building a credential.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    #[error("credential token cannot be empty")]
    Empty,
}

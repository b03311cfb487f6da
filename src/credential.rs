//! Bearer credential handed to the core by the session layer.

use std::fmt;

use crate::error::{Result, TelemetryError};

/// Opaque bearer token. `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a token, rejecting blank ones.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(TelemetryError::MissingCredential(
                "bearer token is empty".to_string(),
            ));
        }
        Ok(Self(token))
    }

    /// Reads the token from an environment variable.
    pub fn from_env(var: &str) -> Result<Self> {
        let token = std::env::var(var)
            .map_err(|_| TelemetryError::MissingCredential(format!("{} is not set", var)))?;
        Self::new(token)
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

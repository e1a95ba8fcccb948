//! # DID Handling
//!
//! A DID here is an opaque string beginning with `did:`. We validate just
//! enough structure to keep garbage out of composite storage keys (where
//! DIDs are NUL-separated) and out of log lines, and no more. Resolution
//! is the federation's problem.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from DID validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DidError {
    /// The string does not start with `did:`.
    #[error("invalid DID: missing 'did:' prefix")]
    MissingPrefix,

    /// The method or identifier segment is empty.
    #[error("invalid DID: empty method or identifier")]
    EmptySegment,

    /// The string contains bytes we refuse to store (control characters).
    #[error("invalid DID: contains control characters")]
    ControlCharacters,
}

/// A validated DID.
///
/// Construction enforces the `did:<method>:<identifier>` shape and rejects
/// control characters. The NUL check is what makes NUL-separated composite
/// storage keys unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    pub fn new(s: impl Into<String>) -> Result<Self, DidError> {
        let s = s.into();
        let rest = s.strip_prefix("did:").ok_or(DidError::MissingPrefix)?;
        let (method, identifier) = rest.split_once(':').ok_or(DidError::EmptySegment)?;
        if method.is_empty() || identifier.is_empty() {
            return Err(DidError::EmptySegment);
        }
        if s.bytes().any(|b| b.is_ascii_control()) {
            return Err(DidError::ControlCharacters);
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The DID method segment, e.g. `plc` in `did:plc:abc123`.
    pub fn method(&self) -> &str {
        // Shape was validated at construction.
        self.0["did:".len()..].split(':').next().unwrap_or("")
    }
}

impl std::fmt::Display for Did {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Did {
    type Error = DidError;
    fn try_from(s: String) -> Result<Self, DidError> {
        Did::new(s)
    }
}

impl From<Did> for String {
    fn from(d: Did) -> String {
        d.0
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

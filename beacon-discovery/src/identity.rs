//! Server identity carried in membership records

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one server instance, usually `host:port`.
///
/// Written as the UTF-8 payload of the server's membership record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Decode a record payload.
    ///
    /// Missing, empty and non-UTF-8 payloads carry no identity.
    pub fn decode(data: Option<&[u8]>) -> Option<Self> {
        let text = std::str::from_utf8(data?).ok()?.trim();
        if text.is_empty() {
            None
        } else {
            Some(Self(text.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ServerIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

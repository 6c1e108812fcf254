//! Shared value objects used across the call engine

use super::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Call identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conference identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConferenceId(Uuid);

impl ConferenceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConferenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP URI value object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    secure: bool,
    user: String,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(user: &str, host: &str, port: Option<u16>) -> Self {
        Self {
            secure: false,
            user: user.to_string(),
            host: host.to_string(),
            port,
        }
    }

    pub fn parse(uri: &str) -> Result<Self, DomainError> {
        let (secure, rest) = if let Some(rest) = uri.strip_prefix("sips:") {
            (true, rest)
        } else if let Some(rest) = uri.strip_prefix("sip:") {
            (false, rest)
        } else {
            return Err(DomainError::InvalidOperation(format!(
                "URI must start with 'sip:' or 'sips:': {}",
                uri
            )));
        };

        // URI parameters and headers are not part of the identity we track
        let rest = rest.split([';', '?']).next().unwrap_or(rest);

        let (user, host_port) = match rest.split_once('@') {
            Some((user, host_port)) if !user.is_empty() => (user, host_port),
            _ => {
                return Err(DomainError::InvalidOperation(format!(
                    "Invalid SIP URI format: {}",
                    uri
                )))
            }
        };

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    DomainError::InvalidOperation(format!("Invalid port in SIP URI: {}", uri))
                })?;
                (host, Some(port))
            }
            None => (host_port, None),
        };

        if host.is_empty() {
            return Err(DomainError::InvalidOperation(format!(
                "Missing host in SIP URI: {}",
                uri
            )));
        }

        Ok(Self {
            secure,
            user: user.to_string(),
            host: host.to_string(),
            port,
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "sips" } else { "sip" };
        if let Some(port) = self.port {
            write!(f, "{}:{}@{}:{}", scheme, self.user, self.host, port)
        } else {
            write!(f, "{}:{}@{}", scheme, self.user, self.host)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_uri_parse() {
        let uri = SipUri::parse("sip:alice@example.com").unwrap();
        assert_eq!(uri.user(), "alice");
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), None);
        assert!(!uri.is_secure());

        let uri_with_port = SipUri::parse("sips:bob@example.com:5061;transport=tls").unwrap();
        assert_eq!(uri_with_port.user(), "bob");
        assert_eq!(uri_with_port.port(), Some(5061));
        assert!(uri_with_port.is_secure());
    }

    #[test]
    fn test_sip_uri_rejects_garbage() {
        assert!(SipUri::parse("tel:+331234").is_err());
        assert!(SipUri::parse("sip:example.com").is_err());
        assert!(SipUri::parse("sip:bob@example.com:port").is_err());
    }

    #[test]
    fn test_sip_uri_display() {
        let uri = SipUri::new("alice", "example.com", None);
        assert_eq!(uri.to_string(), "sip:alice@example.com");

        let uri_with_port = SipUri::new("bob", "example.com", Some(5060));
        assert_eq!(uri_with_port.to_string(), "sip:bob@example.com:5060");
    }
}

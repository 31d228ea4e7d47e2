//! Session and element address parsing.
//!
//! A session is addressed as `host:session` (e.g. `localhost:fourc`).  An
//! element is addressed as `host:session:mnemonic`, or by its bare mnemonic
//! when the owning session is already known from context.

use std::fmt;
use std::str::FromStr;

use tangospec_types::BridgeError;

/// `host:session` address of a running session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionAddress {
    host: String,
    session: String,
}

impl SessionAddress {
    /// Parse `host:session`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidAddress`] unless the input is exactly two
    /// non-empty, colon-separated parts.
    pub fn parse(s: &str) -> Result<Self, BridgeError> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(session), None) if !host.is_empty() && !session.is_empty() => {
                Ok(Self {
                    host: host.trim().to_string(),
                    session: session.trim().to_string(),
                })
            }
            _ => Err(BridgeError::InvalidAddress(s.to_string())),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

impl FromStr for SessionAddress {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.session)
    }
}

/// Fully resolved address of one element in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementAddress {
    pub session: SessionAddress,
    pub mnemonic: String,
}

impl ElementAddress {
    /// Resolve `host:session:mnemonic`, or a bare `mnemonic` against
    /// `parent`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidAddress`] for an empty or malformed address, or
    /// for a bare mnemonic when no parent session is known.
    pub fn resolve(s: &str, parent: Option<&SessionAddress>) -> Result<Self, BridgeError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BridgeError::InvalidAddress(s.to_string()));
        }
        match s.rsplit_once(':') {
            Some((session, mnemonic)) if !mnemonic.is_empty() => Ok(Self {
                session: SessionAddress::parse(session)?,
                mnemonic: mnemonic.to_string(),
            }),
            Some(_) => Err(BridgeError::InvalidAddress(s.to_string())),
            None => match parent {
                Some(parent) => Ok(Self {
                    session: parent.clone(),
                    mnemonic: s.to_string(),
                }),
                None => Err(BridgeError::InvalidAddress(s.to_string())),
            },
        }
    }
}

impl fmt::Display for ElementAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.mnemonic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_and_session() {
        let addr = SessionAddress::parse("mach101:fourc").unwrap();
        assert_eq!(addr.host(), "mach101");
        assert_eq!(addr.session(), "fourc");
        assert_eq!(addr.to_string(), "mach101:fourc");
    }

    #[test]
    fn parse_rejects_malformed_addresses() {
        for bad in ["", "localhost", "localhost:", ":spec", "a:b:c"] {
            assert!(
                matches!(SessionAddress::parse(bad), Err(BridgeError::InvalidAddress(_))),
                "'{bad}' must be rejected"
            );
        }
    }

    #[test]
    fn resolve_full_element_address() {
        let addr = ElementAddress::resolve("host:spec:m0", None).unwrap();
        assert_eq!(addr.session.to_string(), "host:spec");
        assert_eq!(addr.mnemonic, "m0");
    }

    #[test]
    fn resolve_bare_mnemonic_against_parent() {
        let parent = SessionAddress::parse("localhost:fourc").unwrap();
        let addr = ElementAddress::resolve("tth", Some(&parent)).unwrap();
        assert_eq!(addr.session, parent);
        assert_eq!(addr.to_string(), "localhost:fourc:tth");
    }

    #[test]
    fn resolve_bare_mnemonic_without_parent_fails() {
        assert!(ElementAddress::resolve("tth", None).is_err());
        assert!(ElementAddress::resolve("host:spec:", None).is_err());
    }
}

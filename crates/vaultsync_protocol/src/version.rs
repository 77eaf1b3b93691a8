//! Client/server version compatibility gating.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing a semantic version string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version string: {0:?}")]
pub struct ParseVersionError(pub String);

/// A `major.minor.patch` semantic version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

impl Version {
    /// Creates a version from components.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let mut parts = trimmed.splitn(3, '.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(|| ParseVersionError(s.to_string()))
        };
        Ok(Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl TryFrom<String> for Version {
    type Error = ParseVersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Outcome of the client/server compatibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompatibilityOutcome {
    /// The client may proceed. When `publish_minimal` is set, the client's
    /// own minimum-compatible version is newer than the one recorded on
    /// the server and should be persisted there (best-effort).
    Compatible {
        /// New minimum to record on the server, if any.
        publish_minimal: Option<Version>,
    },
    /// The client is older than the server requires. Fatal; the user must
    /// upgrade before sync can proceed.
    Incompatible {
        /// Minimum version the server accepts.
        required: Version,
    },
}

/// Compares the running client against the server's declared minimum.
///
/// `client` is the running client version, `client_minimal` the minimum
/// version this client build is compatible with, and `server_minimal` the
/// minimum recorded on the user's server profile (absent for fresh
/// accounts).
pub fn check_compatibility(
    client: Version,
    client_minimal: Version,
    server_minimal: Option<Version>,
) -> CompatibilityOutcome {
    if let Some(required) = server_minimal {
        if client < required {
            return CompatibilityOutcome::Incompatible { required };
        }
    }
    let publish_minimal = match server_minimal {
        Some(recorded) if client_minimal > recorded => Some(client_minimal),
        None => Some(client_minimal),
        _ => None,
    };
    CompatibilityOutcome::Compatible { publish_minimal }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display() {
        assert_eq!(v("2.1.0"), Version::new(2, 1, 0));
        assert_eq!(v("v1.0.3"), Version::new(1, 0, 3));
        assert_eq!(v("10.20.30").to_string(), "10.20.30");
        assert!("2.1".parse::<Version>().is_err());
        assert!("a.b.c".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
    }

    #[test]
    fn ordering() {
        assert!(v("1.9.0") < v("2.0.0"));
        assert!(v("2.0.1") > v("2.0.0"));
        assert!(v("2.1.0") > v("2.0.9"));
        assert_eq!(v("3.0.0"), v("3.0.0"));
    }

    #[test]
    fn older_client_is_incompatible() {
        let outcome = check_compatibility(v("1.9.0"), v("1.5.0"), Some(v("2.0.0")));
        assert_eq!(
            outcome,
            CompatibilityOutcome::Incompatible {
                required: v("2.0.0")
            }
        );
    }

    #[test]
    fn newer_client_publishes_new_minimum() {
        let outcome = check_compatibility(v("2.1.0"), v("2.1.0"), Some(v("2.0.0")));
        assert_eq!(
            outcome,
            CompatibilityOutcome::Compatible {
                publish_minimal: Some(v("2.1.0"))
            }
        );
    }

    #[test]
    fn equal_minimum_publishes_nothing() {
        let outcome = check_compatibility(v("2.0.0"), v("2.0.0"), Some(v("2.0.0")));
        assert_eq!(
            outcome,
            CompatibilityOutcome::Compatible {
                publish_minimal: None
            }
        );
    }

    #[test]
    fn fresh_account_records_minimum() {
        let outcome = check_compatibility(v("2.0.0"), v("1.8.0"), None);
        assert_eq!(
            outcome,
            CompatibilityOutcome::Compatible {
                publish_minimal: Some(v("1.8.0"))
            }
        );
    }

    #[test]
    fn serde_as_string() {
        let version: Version = serde_json::from_str("\"2.4.1\"").unwrap();
        assert_eq!(version, v("2.4.1"));
        assert_eq!(serde_json::to_string(&version).unwrap(), "\"2.4.1\"");
    }
}

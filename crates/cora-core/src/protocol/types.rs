//! Small protocol value types shared across messages.

use std::cmp::Ordering;
use std::fmt;

use crate::constants::{CHANGE_ADDED, CHANGE_DELETED};
use crate::error::{Error, Result};

// =============================================================================
// Session Numbers
// =============================================================================

/// Transport-assigned handle for one logical session on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionNo(pub u32);

impl fmt::Display for SessionNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why the transport reports a session as broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the server.
    Closed,
    /// The physical connection was lost.
    ConnectionLost,
    /// The object the session was attached to does not exist.
    NoSuchObject,
    /// The server does not support the session's protocol.
    Unsupported,
    /// The server refused access.
    Security,
    /// Any code the client does not know.
    Unknown(u32),
}

impl CloseReason {
    /// Map a transport reason code.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => CloseReason::Closed,
            2 => CloseReason::ConnectionLost,
            3 => CloseReason::NoSuchObject,
            4 => CloseReason::Unsupported,
            5 => CloseReason::Security,
            other => CloseReason::Unknown(other),
        }
    }

    /// The transport reason code.
    pub fn code(&self) -> u32 {
        match self {
            CloseReason::Closed => 1,
            CloseReason::ConnectionLost => 2,
            CloseReason::NoSuchObject => 3,
            CloseReason::Unsupported => 4,
            CloseReason::Security => 5,
            CloseReason::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Closed => write!(f, "closed"),
            CloseReason::ConnectionLost => write!(f, "connection lost"),
            CloseReason::NoSuchObject => write!(f, "no such object"),
            CloseReason::Unsupported => write!(f, "unsupported"),
            CloseReason::Security => write!(f, "security"),
            CloseReason::Unknown(code) => write!(f, "unknown ({})", code),
        }
    }
}

// =============================================================================
// Change Codes
// =============================================================================

/// Per-item change code in enumeration notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCode {
    Added,
    Deleted,
}

impl ChangeCode {
    /// Map a wire change code; unknown codes yield `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            CHANGE_ADDED => Some(ChangeCode::Added),
            CHANGE_DELETED => Some(ChangeCode::Deleted),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            ChangeCode::Added => CHANGE_ADDED,
            ChangeCode::Deleted => CHANGE_DELETED,
        }
    }
}

// =============================================================================
// Server Version
// =============================================================================

/// Dotted numeric server version such as `1.3.1.28`.
///
/// Ordering compares components left to right; a shorter version that is a
/// prefix of a longer one sorts first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerVersion {
    text: String,
    parts: Vec<u32>,
}

impl ServerVersion {
    /// Parse a version string.
    ///
    /// Each dot-separated component contributes its leading digits, so
    /// `1.3.11.21beta` parses as `[1, 3, 11, 21]`. A component without
    /// leading digits ends the version.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = Vec::new();
        for component in text.trim().split('.') {
            let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                break;
            }
            let value = digits.parse::<u32>().map_err(|e| Error::Protocol {
                message: format!("bad version component {:?}: {}", component, e),
            })?;
            parts.push(value);
        }
        if parts.is_empty() {
            return Err(Error::Protocol {
                message: format!("unparseable server version {:?}", text),
            });
        }
        Ok(Self {
            text: text.trim().to_string(),
            parts,
        })
    }

    /// The version as reported by the server.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Numeric components.
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    /// Check whether this version is at least the given dotted version.
    ///
    /// A malformed threshold is treated as unsatisfiable.
    pub fn at_least(&self, threshold: &str) -> bool {
        ServerVersion::parse(threshold)
            .map(|min| *self >= min)
            .unwrap_or(false)
    }
}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

// =============================================================================
// Time Stamps
// =============================================================================

/// Server time stamp: nanoseconds since 1990-01-01 00:00:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LgrDate(pub i64);

impl LgrDate {
    const NSEC_PER_SEC: i64 = 1_000_000_000;

    /// Build a stamp from whole seconds since the epoch.
    pub fn from_secs(secs: i64) -> Self {
        LgrDate(secs.saturating_mul(Self::NSEC_PER_SEC))
    }

    pub fn nanos(&self) -> i64 {
        self.0
    }

    pub fn secs(&self) -> i64 {
        self.0.div_euclid(Self::NSEC_PER_SEC)
    }
}

impl fmt::Display for LgrDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.rem_euclid(Self::NSEC_PER_SEC);
        write!(f, "{}.{:09}", self.secs(), nanos)
    }
}

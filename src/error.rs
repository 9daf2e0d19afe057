//! Failure taxonomy shared across the scheduler.
//!
//! Sources are black boxes that pre-classify their own failures into a
//! small, stable set of kinds. The rest of the system (retry policy,
//! queue persistence, progress events) reasons over this shared
//! [`ErrorKind`] rather than any source-specific error type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Classification of a failed operation.
///
/// The string form (see [`ErrorKind::as_str`] / [`FromStr`]) is the
/// canonical representation used for database round-tripping and serde
/// event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A transient network problem that is likely to clear on retry.
    NetworkTransient,
    /// The source rejected the call because a rate limit was exceeded.
    RateLimitExceeded,
    /// Authentication with the source failed.
    AuthenticationFailure,
    /// The requested resource does not exist upstream.
    ResourceNotFound,
    /// The source's response could not be parsed.
    ParsingFailure,
    /// An unclassified failure.
    Unknown,
}

impl ErrorKind {
    /// Returns the canonical string form of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkTransient => "network_transient",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::AuthenticationFailure => "authentication_failure",
            ErrorKind::ResourceNotFound => "resource_not_found",
            ErrorKind::ParsingFailure => "parsing_failure",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a known [`ErrorKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseErrorKindError(String);

impl fmt::Display for ParseErrorKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown error kind: {}", self.0)
    }
}

impl std::error::Error for ParseErrorKindError {}

impl FromStr for ErrorKind {
    type Err = ParseErrorKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network_transient" => Ok(ErrorKind::NetworkTransient),
            "rate_limit_exceeded" => Ok(ErrorKind::RateLimitExceeded),
            "authentication_failure" => Ok(ErrorKind::AuthenticationFailure),
            "resource_not_found" => Ok(ErrorKind::ResourceNotFound),
            "parsing_failure" => Ok(ErrorKind::ParsingFailure),
            "unknown" => Ok(ErrorKind::Unknown),
            other => Err(ParseErrorKindError(other.to_string())),
        }
    }
}

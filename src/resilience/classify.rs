//! Error classification.
//!
//! The core never looks at concrete transport types. Anything that can fail
//! implements [`Failure`], which exposes the structured signals we care about
//! (status code, timeout, connect failure, `Retry-After`) with "absent"
//! defaults. The message text from `Display` is the last-resort signal.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What went wrong with a call, as far as retry and breaker logic cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    ServerError,
    NetworkError,
    TimeoutError,
    ServiceUnavailable,
    Unknown,
}

impl ErrorKind {
    /// Every kind except `Unknown` may succeed on a later attempt.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured view of a failed operation.
pub trait Failure: fmt::Display {
    /// HTTP status code of the response, if the failure carries one.
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// The operation ran past its deadline.
    fn is_timeout(&self) -> bool {
        false
    }

    /// The dependency could not be reached (refused, DNS, reset).
    fn is_connect(&self) -> bool {
        false
    }

    /// Raw `Retry-After` header value from the response.
    fn retry_after_header(&self) -> Option<&str> {
        None
    }
}

/// Classify a failure. Structured signals win over message text.
pub fn classify<F: Failure + ?Sized>(error: &F) -> ErrorKind {
    if let Some(status) = error.status_code() {
        return match status {
            429 => ErrorKind::RateLimit,
            502..=504 => ErrorKind::ServiceUnavailable,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        };
    }
    if error.is_timeout() {
        return ErrorKind::TimeoutError;
    }
    if error.is_connect() {
        return ErrorKind::NetworkError;
    }
    classify_message(&error.to_string())
}

const SERVER_ERROR_CODES: [&str; 5] = ["500", "502", "503", "504", "507"];

fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("quota") {
        ErrorKind::RateLimit
    } else if lower.contains("service unavailable") || lower.contains("overloaded") {
        ErrorKind::ServiceUnavailable
    } else if SERVER_ERROR_CODES.iter().any(|code| lower.contains(code)) {
        ErrorKind::ServerError
    } else {
        ErrorKind::Unknown
    }
}

/// Transport-neutral failure for collaborators that map their own client
/// results into something the core can classify.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<String>,
    },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

impl UpstreamError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        UpstreamError::Status {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attach a `Retry-After` header value to a status failure.
    pub fn with_retry_after(self, value: impl Into<String>) -> Self {
        match self {
            UpstreamError::Status {
                status, message, ..
            } => UpstreamError::Status {
                status,
                message,
                retry_after: Some(value.into()),
            },
            other => other,
        }
    }
}

impl Failure for UpstreamError {
    fn status_code(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout(_))
    }

    fn is_connect(&self) -> bool {
        matches!(self, UpstreamError::Connect(_))
    }

    fn retry_after_header(&self) -> Option<&str> {
        match self {
            UpstreamError::Status { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}

impl Failure for io::Error {
    fn is_timeout(&self) -> bool {
        matches!(self.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
    }

    fn is_connect(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::AddrNotAvailable
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::HostUnreachable
                | io::ErrorKind::NetworkUnreachable
        )
    }
}

impl Failure for tokio::time::error::Elapsed {
    fn is_timeout(&self) -> bool {
        true
    }
}

impl Failure for String {}

impl Failure for str {}

impl<T: Failure + ?Sized> Failure for &T {
    fn status_code(&self) -> Option<u16> {
        (**self).status_code()
    }

    fn is_timeout(&self) -> bool {
        (**self).is_timeout()
    }

    fn is_connect(&self) -> bool {
        (**self).is_connect()
    }

    fn retry_after_header(&self) -> Option<&str> {
        (**self).retry_after_header()
    }
}

/// Boxed errors are downcast to the failure types this crate knows about;
/// anything else is classified from its message alone.
impl Failure for Box<dyn StdError + Send + Sync> {
    fn status_code(&self) -> Option<u16> {
        known_failure(self.as_ref()).and_then(|err| err.status_code())
    }

    fn is_timeout(&self) -> bool {
        known_failure(self.as_ref()).is_some_and(|err| err.is_timeout())
    }

    fn is_connect(&self) -> bool {
        known_failure(self.as_ref()).is_some_and(|err| err.is_connect())
    }

    fn retry_after_header(&self) -> Option<&str> {
        known_failure(self.as_ref()).and_then(|err| err.retry_after_header())
    }
}

fn known_failure<'a>(err: &'a (dyn StdError + Send + Sync + 'static)) -> Option<&'a dyn Failure> {
    if let Some(err) = err.downcast_ref::<UpstreamError>() {
        return Some(err);
    }
    if let Some(err) = err.downcast_ref::<io::Error>() {
        return Some(err);
    }
    if let Some(err) = err.downcast_ref::<tokio::time::error::Elapsed>() {
        return Some(err);
    }
    known_client_failure(err)
}

#[cfg(feature = "reqwest")]
fn known_client_failure<'a>(
    err: &'a (dyn StdError + Send + Sync + 'static),
) -> Option<&'a dyn Failure> {
    err.downcast_ref::<reqwest::Error>()
        .map(|err| err as &dyn Failure)
}

#[cfg(not(feature = "reqwest"))]
fn known_client_failure<'a>(
    _err: &'a (dyn StdError + Send + Sync + 'static),
) -> Option<&'a dyn Failure> {
    None
}

#[cfg(feature = "reqwest")]
impl Failure for reqwest::Error {
    fn status_code(&self) -> Option<u16> {
        self.status().map(|status| status.as_u16())
    }

    fn is_timeout(&self) -> bool {
        reqwest::Error::is_timeout(self)
    }

    fn is_connect(&self) -> bool {
        reqwest::Error::is_connect(self)
    }
}

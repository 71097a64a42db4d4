//! Error classification for retry decisions.
//!
//! All error-shape inspection lives here: structured variants map directly
//! onto the taxonomy, and string-carrying errors fall through to substring
//! matching. Nothing else in the crate inspects error text.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Taxonomy of failure kinds observed while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Server,
    Client,
    RateLimit,
    Timeout,
    Connection,
    Unknown,
}

/// How urgently a failure class should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Classification result for a single error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClass {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub priority: Priority,
}

impl ErrorClass {
    const fn new(kind: ErrorKind, retryable: bool, priority: Priority) -> Self {
        Self {
            kind,
            retryable,
            priority,
        }
    }
}

const NETWORK: ErrorClass = ErrorClass::new(ErrorKind::Network, true, Priority::High);
const SERVER: ErrorClass = ErrorClass::new(ErrorKind::Server, true, Priority::High);
const CLIENT: ErrorClass = ErrorClass::new(ErrorKind::Client, false, Priority::Low);
const RATE_LIMIT: ErrorClass = ErrorClass::new(ErrorKind::RateLimit, true, Priority::Medium);
const TIMEOUT: ErrorClass = ErrorClass::new(ErrorKind::Timeout, true, Priority::High);
const CONNECTION: ErrorClass = ErrorClass::new(ErrorKind::Connection, true, Priority::High);
// An unrecognized failure is assumed transient: occasional wasted retries
// cost less than giving up on a recoverable stream.
const UNKNOWN: ErrorClass = ErrorClass::new(ErrorKind::Unknown, true, Priority::Medium);

/// Classify an error into its taxonomy entry.
pub fn classify(error: &Error) -> ErrorClass {
    match error {
        Error::Network(_) => NETWORK,
        Error::Timeout(_) => TIMEOUT,
        Error::Connection(_) => CONNECTION,
        Error::RateLimited(_) => RATE_LIMIT,
        Error::Server { .. } => SERVER,
        Error::Client { .. } => CLIENT,
        Error::Http(e) => classify_reqwest(e),
        Error::Io(e) => classify_io(e),
        Error::Audio(msg)
        | Error::Buffer(msg)
        | Error::Config(msg)
        | Error::Session(msg)
        | Error::DaemonUnavailable(msg) => classify_message(msg),
        // Retrying inside the cooldown cannot succeed.
        Error::CircuitOpen(_) => ErrorClass::new(ErrorKind::Unknown, false, Priority::High),
        Error::Cancelled => ErrorClass::new(ErrorKind::Client, false, Priority::Low),
        Error::Serialization(_) => CLIENT,
    }
}

fn classify_reqwest(e: &reqwest::Error) -> ErrorClass {
    if e.is_timeout() {
        return TIMEOUT;
    }
    if e.is_connect() {
        return CONNECTION;
    }
    if let Some(status) = e.status() {
        if status.as_u16() == 429 {
            return RATE_LIMIT;
        }
        if status.is_server_error() {
            return SERVER;
        }
        if status.is_client_error() {
            return CLIENT;
        }
    }
    NETWORK
}

fn classify_io(e: &std::io::Error) -> ErrorClass {
    use std::io::ErrorKind as IoKind;
    match e.kind() {
        IoKind::ConnectionRefused | IoKind::ConnectionReset | IoKind::ConnectionAborted => {
            CONNECTION
        }
        IoKind::TimedOut | IoKind::WouldBlock => TIMEOUT,
        IoKind::NotConnected | IoKind::BrokenPipe | IoKind::UnexpectedEof => NETWORK,
        _ => UNKNOWN,
    }
}

/// Substring classification for errors that only carry a message.
///
/// Matching is fixed-priority: the first matching class wins, so the
/// ordering below is part of the contract.
pub fn classify_message(message: &str) -> ErrorClass {
    let msg = message.to_lowercase();

    if contains_any(&msg, &["timeout", "timed out", "deadline exceeded"]) {
        return TIMEOUT;
    }
    if contains_any(&msg, &["connection refused", "host not found", "unreachable", "refused"]) {
        return CONNECTION;
    }
    if contains_any(&msg, &["network", "socket", "dns", "reset by peer", "broken pipe"]) {
        return NETWORK;
    }
    if contains_any(&msg, &["429", "rate limit", "too many requests"]) {
        return RATE_LIMIT;
    }
    if contains_any(&msg, &["500", "502", "503", "504", "server error", "bad gateway"]) {
        return SERVER;
    }
    if contains_any(&msg, &["400", "401", "403", "404", "client error", "bad request", "not found"])
    {
        return CLIENT;
    }
    UNKNOWN
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

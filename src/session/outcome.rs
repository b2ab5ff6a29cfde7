#![forbid(unsafe_code)]

// Outcome events and the error taxonomy. Every meaningful session
// transition emits exactly one Outcome; the stats recorder is the only
// consumer.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What kind of transition an outcome describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Connect,
    Subscribe,
    Message,
}

/// Why the broker refused a connection attempt (CONNACK return codes 1-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    ProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    Other(u8),
}

impl DenyReason {
    /// Map a non-zero CONNACK return code to a reason.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => DenyReason::ProtocolVersion,
            2 => DenyReason::IdentifierRejected,
            3 => DenyReason::ServerUnavailable,
            4 => DenyReason::BadCredentials,
            5 => DenyReason::NotAuthorized,
            other => DenyReason::Other(other),
        }
    }

    /// Whether this refusal counts as an authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, DenyReason::BadCredentials | DenyReason::NotAuthorized)
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::ProtocolVersion => write!(f, "incorrect protocol version"),
            DenyReason::IdentifierRejected => write!(f, "invalid client identifier"),
            DenyReason::ServerUnavailable => write!(f, "server unavailable"),
            DenyReason::BadCredentials => write!(f, "bad username or password"),
            DenyReason::NotAuthorized => write!(f, "not authorized"),
            DenyReason::Other(code) => write!(f, "unknown refusal (code={code})"),
        }
    }
}

/// Classified failure attached to an unsuccessful outcome.
///
/// All of these are expected, measured data points; none terminate the
/// owning virtual user or the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorClass {
    /// The broker actively refused the attempt. Not retried within the
    /// same scheduling tick.
    #[error("broker denied connection: {0}")]
    ProtocolDenied(DenyReason),
    /// No acknowledgment within the bounded wait. Retried on the owning
    /// user's next tick.
    #[error("timed out waiting for acknowledgment")]
    Timeout,
    /// Socket or TLS failure underneath the protocol. Same retry policy
    /// as Timeout.
    #[error("transport failure: {0}")]
    Transport(String),
    /// A received message did not match the expected notification content.
    #[error("unexpected message payload")]
    PayloadMismatch,
    /// The background I/O loop is gone; the bridge refused to wait.
    #[error("event loop unavailable")]
    RuntimeUnavailable,
}

impl ErrorClass {
    pub fn transport(err: impl fmt::Display) -> Self {
        ErrorClass::Transport(err.to_string())
    }
}

/// Immutable record of one session transition.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub client_id: String,
    pub success: bool,
    pub latency: Duration,
    pub error: Option<ErrorClass>,
}

impl Outcome {
    pub fn success(kind: OutcomeKind, client_id: impl Into<String>, latency: Duration) -> Self {
        Self {
            kind,
            client_id: client_id.into(),
            success: true,
            latency,
            error: None,
        }
    }

    pub fn failure(
        kind: OutcomeKind,
        client_id: impl Into<String>,
        latency: Duration,
        error: ErrorClass,
    ) -> Self {
        Self {
            kind,
            client_id: client_id.into(),
            success: false,
            latency,
            error: Some(error),
        }
    }
}

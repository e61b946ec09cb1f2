//! Error types shared by every protocol client.

use std::io;
use std::time::Duration;

/// Result type alias for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Substrings that mark an error message as a transient network condition.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "i/o timeout",
    "no such host",
    "network unreachable",
    "network is unreachable",
    "broken pipe",
    "try again",
    "temporary failure",
];

/// Errors that can occur while talking to a mail server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Dialing the server failed.
    #[error("connection to {host}:{port} failed: {source}")]
    Connection {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// The server sent something that does not follow the protocol grammar.
    #[error("malformed response: {0}")]
    Parse(String),

    /// A well-formed command was answered with an error status.
    #[error("{command} rejected: expected {expected}, got {actual}: {message}")]
    Rejected {
        /// Command verb that was rejected (never includes arguments).
        command: String,
        /// Status the client was waiting for.
        expected: String,
        /// Status the server actually returned.
        actual: String,
        /// Server text.
        message: String,
        /// Whether the status belongs to the protocol's transient class.
        retryable: bool,
    },

    /// Authentication was refused or could not be completed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No advertised mechanism fits the supplied credentials or override.
    #[error("no compatible authentication mechanism: {0}")]
    NoCompatibleMechanism(String),

    /// The in-band TLS upgrade was refused or broke the session.
    #[error("TLS upgrade failed: {0}")]
    TlsUpgrade(String),

    /// TLS handshake or record layer error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Host name cannot be used as a TLS server name.
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// A read or dial did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled a blocking wait.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation is not valid in the current session state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Feature not advertised by the server.
    #[error("server does not support {0}")]
    NotSupported(String),

    /// Envelope address rejected before it reached the wire.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Error reported by an upstream HTTP API wrapped by a collaborator.
    #[error("upstream API returned {status}: {message}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// Retry policy gave up.
    #[error("failed after {retries} retries: {source}")]
    RetriesExhausted {
        /// Number of retries performed after the first attempt.
        retries: u32,
        /// Error of the final attempt.
        #[source]
        source: Box<Self>,
    },
}

impl Error {
    /// Creates a rejection error for a command.
    #[must_use]
    pub fn rejected(
        command: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Rejected {
            command: command.into(),
            expected: expected.into(),
            actual: actual.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Returns true if a retry policy may try the operation again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(err) | Self::Connection { source: err, .. } => is_transient_io(err),
            Self::Rejected { retryable, .. } => *retryable,
            Self::Upstream { status, .. } => is_retryable_http_status(*status),
            Self::Parse(_)
            | Self::Auth(_)
            | Self::NoCompatibleMechanism(_)
            | Self::TlsUpgrade(_)
            | Self::Tls(_)
            | Self::InvalidDnsName(_)
            | Self::Cancelled
            | Self::InvalidState(_)
            | Self::NotSupported(_)
            | Self::InvalidAddress(_)
            | Self::Config(_)
            | Self::RetriesExhausted { .. } => false,
        }
    }

    /// Returns true if this error came from cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::RetriesExhausted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Returns true if this error is a timeout, looking through retry wrappers.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::RetriesExhausted { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Matches an error message against the transient-failure vocabulary.
#[must_use]
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Returns true for HTTP statuses that signal throttling or a temporary outage.
#[must_use]
pub const fn is_retryable_http_status(status: u16) -> bool {
    matches!(status, 429 | 503 | 504)
}

fn is_transient_io(err: &io::Error) -> bool {
    use io::ErrorKind;

    match err.kind() {
        ErrorKind::TimedOut
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::NetworkUnreachable
        | ErrorKind::HostUnreachable => true,
        _ => is_transient_message(&err.to_string()),
    }
}

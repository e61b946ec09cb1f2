//! Diagnostics gathered during a session and outcome records for audit logs.

use std::time::Duration;

use serde::Serialize;

use crate::auth::{Credentials, Mechanism};
use crate::cert::CertificateAnalysis;
use crate::config::{Config, Protocol, TlsMode};
use crate::Error;

/// What a client learned before it succeeded or failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    /// Server greeting text.
    pub banner: Option<String>,
    /// Most recent capability lines.
    pub capabilities: Vec<String>,
    /// Whether a TLS handshake (implicit or upgrade) was attempted.
    pub tls_attempted: bool,
    /// Outcome of the TLS attempt.
    pub tls_outcome: Option<String>,
    /// Certificate analysis of the TLS session.
    pub tls: Option<CertificateAnalysis>,
    /// Mechanism chosen for authentication.
    pub mechanism: Option<Mechanism>,
}

/// Terminal error together with the diagnostics gathered before it.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SessionFailure {
    /// The error that ended the session.
    #[source]
    pub error: Error,
    /// Context collected before the failure.
    pub diagnostics: Box<Diagnostics>,
}

impl SessionFailure {
    /// Pairs an error with diagnostics.
    #[must_use]
    pub fn new(error: Error, diagnostics: Diagnostics) -> Self {
        Self {
            error,
            diagnostics: Box::new(diagnostics),
        }
    }
}

/// Overall result of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// The operation succeeded.
    Success,
    /// The operation failed.
    Failure,
}

/// Structured record handed to an audit logger.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRecord {
    /// Protocol used.
    pub protocol: Protocol,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub tls_mode: TlsMode,
    /// Operation name, e.g. `auth` or `send`.
    pub operation: String,
    /// Outcome.
    pub status: OutcomeStatus,
    /// Wall time in milliseconds.
    pub elapsed_ms: u64,
    /// Masked username, when credentials were involved.
    pub username: Option<String>,
    /// Mechanism used, when authentication happened.
    pub mechanism: Option<Mechanism>,
    /// Error text with secrets removed.
    pub error: Option<String>,
}

impl OutcomeRecord {
    /// Builds a record for `operation` from its result.
    #[must_use]
    pub fn new<T>(
        config: &Config,
        operation: impl Into<String>,
        elapsed: Duration,
        credentials: Option<&Credentials>,
        result: &Result<T, Error>,
    ) -> Self {
        let (status, error) = match result {
            Ok(_) => (OutcomeStatus::Success, None),
            Err(err) => {
                let text = err.to_string();
                let text = credentials.map_or(text.clone(), |creds| creds.redact(&text));
                (OutcomeStatus::Failure, Some(text))
            }
        };

        Self {
            protocol: config.protocol,
            host: config.host.clone(),
            port: config.port,
            tls_mode: config.tls_mode,
            operation: operation.into(),
            status,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            username: credentials.map(Credentials::masked_username),
            mechanism: None,
            error,
        }
    }

    /// Sets the mechanism used.
    #[must_use]
    pub const fn with_mechanism(mut self, mechanism: Option<Mechanism>) -> Self {
        self.mechanism = mechanism;
        self
    }

    /// Serializes the record as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns the serializer error.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

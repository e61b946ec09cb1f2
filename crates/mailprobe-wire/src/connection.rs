//! Line-oriented connection shared by the protocol clients.
//!
//! A [`Connection`] owns the [`Transport`] and applies the cross-cutting
//! rules every wire operation follows: a rate-limiter token before each
//! write, a bounded wait on each read, wire tracing with secrets redacted,
//! and certificate analysis whenever TLS comes up.

use std::time::Duration;

use bytes::BytesMut;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::cert::CertificateAnalysis;
use crate::config::Config;
use crate::ratelimit::RateLimiter;
use crate::tls::server_name;
use crate::trace::{SharedTracer, TraceEvent};
use crate::transport::{AsyncStream, Transport};
use crate::{Error, Result};

/// Placeholder written to traces in place of secret material.
pub const REDACTED: &str = "[redacted]";

/// Buffered, timeout-bounded, rate-limited protocol connection.
pub struct Connection<S> {
    transport: Transport<S>,
    host: String,
    io_timeout: Duration,
    max_line_length: usize,
    buffer_size: usize,
    verification_disabled: bool,
    limiter: RateLimiter,
    cancel: CancellationToken,
    tracer: Option<SharedTracer>,
    write_buffer: BytesMut,
    partial_line: Vec<u8>,
    tls: Option<CertificateAnalysis>,
}

impl<S: AsyncStream> Connection<S> {
    /// Wraps a transport using the limits from `config`.
    ///
    /// An already-encrypted transport (implicit TLS) is analyzed immediately.
    pub fn new(
        transport: Transport<S>,
        config: &Config,
        limiter: RateLimiter,
        cancel: CancellationToken,
    ) -> Self {
        let mut conn = Self {
            transport,
            host: config.host.clone(),
            io_timeout: config.io_timeout,
            max_line_length: config.max_line_length,
            buffer_size: config.buffer_size,
            verification_disabled: config.tls.skip_verify,
            limiter,
            cancel,
            tracer: None,
            write_buffer: BytesMut::with_capacity(config.buffer_size.min(4096)),
            partial_line: Vec::new(),
            tls: None,
        };
        conn.tls = conn.analyze_tls();
        conn
    }

    /// Installs a wire tracer.
    #[must_use]
    pub fn with_tracer(mut self, tracer: SharedTracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Replaces the wire tracer.
    pub fn set_tracer(&mut self, tracer: Option<SharedTracer>) {
        self.tracer = tracer;
    }

    /// Server host this connection talks to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns true if the transport is encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Returns true once the transport has been shut down.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Analysis of the current TLS session, if any.
    #[must_use]
    pub const fn tls_analysis(&self) -> Option<&CertificateAnalysis> {
        self.tls.as_ref()
    }

    /// Cancellation token observed by rate-limit waits.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sends a complete command line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if cancelled while waiting for a token, or
    /// an I/O error.
    pub async fn send(&mut self, line: &[u8]) -> Result<()> {
        let shown = String::from_utf8_lossy(line);
        let shown = shown.trim_end_matches(['\r', '\n']).to_string();
        self.send_traced(line, shown).await
    }

    /// Sends a command line carrying secrets, tracing `shown` instead.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::send`].
    pub async fn send_redacted(&mut self, line: &[u8], shown: &str) -> Result<()> {
        self.send_traced(line, shown.to_string()).await
    }

    /// Sends raw bytes without a rate-limit token or trace entry.
    ///
    /// Used for message bodies that follow an already-admitted command.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.transport.write_all(data).await
    }

    async fn send_traced(&mut self, line: &[u8], shown: String) -> Result<()> {
        self.limiter.acquire(&self.cancel).await?;
        self.trace(TraceEvent::Write(shown));

        self.write_buffer.clear();
        self.write_buffer.extend_from_slice(line);
        self.transport.write_all(&self.write_buffer).await
    }

    /// Reads one line within the configured I/O timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if nothing arrives in time.
    pub async fn read_line(&mut self) -> Result<String> {
        self.read_line_within(self.io_timeout).await
    }

    /// Reads one line within `timeout`.
    ///
    /// A line cut off by the timeout is kept; the next read resumes it, so
    /// the stream stays in step after [`Error::Timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if nothing arrives in time, or the transport
    /// error.
    pub async fn read_line_within(&mut self, timeout: Duration) -> Result<String> {
        let read = self
            .transport
            .read_line_into(&mut self.partial_line, self.max_line_length);
        match tokio::time::timeout(timeout, read).await {
            Err(_) => {
                if !self.partial_line.is_empty() {
                    tracing::debug!(
                        host = %self.host,
                        pending = self.partial_line.len(),
                        "read timed out mid-line"
                    );
                }
                return Err(Error::Timeout(timeout));
            }
            Ok(Err(err)) => {
                self.partial_line.clear();
                return Err(err);
            }
            Ok(Ok(())) => {}
        }

        let bytes = std::mem::take(&mut self.partial_line);
        let line = String::from_utf8_lossy(&bytes).into_owned();
        self.trace(TraceEvent::Read(line.clone()));
        Ok(line)
    }

    /// Upgrades the transport to TLS after the server accepted the upgrade
    /// command.
    ///
    /// The transport is taken out for the handshake; if the handshake fails
    /// the connection stays closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TlsUpgrade`] on pending plaintext or handshake failure,
    /// [`Error::Timeout`] if the handshake exceeds the I/O timeout.
    pub async fn upgrade(&mut self, connector: &TlsConnector) -> Result<&CertificateAnalysis> {
        if !self.partial_line.is_empty() {
            return Err(Error::TlsUpgrade(format!(
                "{} bytes of an unfinished plaintext line pending",
                self.partial_line.len()
            )));
        }
        let name = server_name(&self.host)?;
        let transport = std::mem::replace(&mut self.transport, Transport::Closed);

        let upgraded = tokio::time::timeout(
            self.io_timeout,
            transport.upgrade(connector, name, self.buffer_size),
        )
        .await
        .map_err(|_| Error::Timeout(self.io_timeout))??;
        self.transport = upgraded;

        let analysis = self
            .analyze_tls()
            .ok_or_else(|| Error::TlsUpgrade("no TLS session after handshake".into()))?;
        self.trace(TraceEvent::Diagnostic(format!(
            "TLS established: {} {} ({})",
            analysis.protocol_version,
            analysis.cipher_suite,
            analysis.status.as_str()
        )));
        tracing::debug!(
            host = %self.host,
            version = %analysis.protocol_version,
            cipher = %analysis.cipher_suite,
            status = analysis.status.as_str(),
            "TLS upgrade complete"
        );

        Ok(self.tls.insert(analysis))
    }

    /// Shuts the transport down. Idempotent; errors are logged.
    pub async fn close(&mut self) {
        if self.transport.is_closed() {
            return;
        }
        if let Err(err) = self.transport.shutdown().await {
            tracing::debug!(host = %self.host, error = %err, "transport shutdown failed");
        }
        self.trace(TraceEvent::Closed);
    }

    /// Records a diagnostic on the tracer.
    pub fn diagnostic(&self, message: impl Into<String>) {
        self.trace(TraceEvent::Diagnostic(message.into()));
    }

    fn trace(&self, event: TraceEvent) {
        if let Some(tracer) = &self.tracer {
            tracer.trace_event(event);
        }
    }

    fn analyze_tls(&self) -> Option<CertificateAnalysis> {
        self.transport.tls_connection().map(|conn| {
            CertificateAnalysis::from_connection(conn, &self.host, self.verification_disabled)
        })
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("transport", &self.transport)
            .field("io_timeout", &self.io_timeout)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

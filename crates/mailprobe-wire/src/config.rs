//! Connection configuration types.

use std::time::Duration;

use rustls::pki_types::CertificateDer;

use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Default read buffer size for the transport.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Maximum response line length to prevent memory exhaustion.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Mail protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// SMTP (RFC 5321).
    Smtp,
    /// POP3 (RFC 1939).
    Pop3,
}

impl Protocol {
    /// Returns the default port for this protocol and security mode.
    #[must_use]
    pub const fn default_port(self, mode: TlsMode) -> u16 {
        match (self, mode) {
            (Self::Smtp, TlsMode::None) => 25,
            (Self::Smtp, TlsMode::StartTls) => 587,
            (Self::Smtp, TlsMode::Implicit) => 465,
            (Self::Pop3, TlsMode::None | TlsMode::StartTls) => 110,
            (Self::Pop3, TlsMode::Implicit) => 995,
        }
    }

    /// Returns the in-band upgrade command for this protocol.
    #[must_use]
    pub const fn upgrade_command(self) -> &'static str {
        match self {
            Self::Smtp => "STARTTLS",
            Self::Pop3 => "STLS",
        }
    }

    /// Returns the protocol name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Smtp => "SMTP",
            Self::Pop3 => "POP3",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// No encryption. **Not recommended for production.**
    None,
    /// Start with plaintext, upgrade with STARTTLS/STLS.
    #[default]
    StartTls,
    /// TLS from the first byte.
    Implicit,
}

/// TLS protocol version bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum TlsVersion {
    /// TLS 1.0 (deprecated, never negotiated by this client).
    Tls10,
    /// TLS 1.1 (deprecated, never negotiated by this client).
    Tls11,
    /// TLS 1.2.
    Tls12,
    /// TLS 1.3.
    Tls13,
}

impl TlsVersion {
    /// Parses a version string such as `1.2`, `TLS1.3` or `tls12`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown versions.
    pub fn parse(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_lowercase();
        match normalized.trim_start_matches("tls").trim_start_matches('v') {
            "10" => Ok(Self::Tls10),
            "11" => Ok(Self::Tls11),
            "12" => Ok(Self::Tls12),
            "13" => Ok(Self::Tls13),
            _ => Err(Error::Config(format!("unknown TLS version: {s}"))),
        }
    }
}

/// TLS client options.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Accept any certificate chain. The analysis still runs and warns.
    pub skip_verify: bool,
    /// Lowest acceptable protocol version.
    pub min_version: TlsVersion,
    /// Highest acceptable protocol version.
    pub max_version: TlsVersion,
    /// Extra trust anchors added to the bundled web PKI roots.
    pub extra_roots: Vec<CertificateDer<'static>>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            skip_verify: false,
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            extra_roots: Vec::new(),
        }
    }
}

/// Client configuration for one protocol session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol spoken on the connection.
    pub protocol: Protocol,
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub tls_mode: TlsMode,
    /// TLS options.
    pub tls: TlsOptions,
    /// Dial timeout (TCP connect plus implicit TLS handshake).
    pub connect_timeout: Duration,
    /// Per-response read timeout.
    pub io_timeout: Duration,
    /// Read timeout for the best-effort QUIT on close.
    pub close_timeout: Duration,
    /// Retry policy applied to dialing.
    pub retry: RetryPolicy,
    /// Wire operations per second; `<= 0` disables limiting.
    pub rate_limit: f64,
    /// Optional `socks5://` proxy URL.
    pub proxy: Option<String>,
    /// Name announced in EHLO/HELO.
    pub client_name: String,
    /// Explicit authentication mechanism override.
    pub auth_method: Option<String>,
    /// Read buffer size.
    pub buffer_size: usize,
    /// Maximum accepted response line length.
    pub max_line_length: usize,
}

impl Config {
    /// Creates a configuration with defaults for the protocol (STARTTLS mode).
    #[must_use]
    pub fn new(protocol: Protocol, host: impl Into<String>) -> Self {
        Self::builder(protocol, host).build()
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(protocol: Protocol, host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(protocol, host)
    }
}

/// Builder for connection configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    protocol: Protocol,
    host: String,
    port: Option<u16>,
    tls_mode: TlsMode,
    tls: TlsOptions,
    connect_timeout: Duration,
    io_timeout: Duration,
    close_timeout: Duration,
    retry: RetryPolicy,
    rate_limit: f64,
    proxy: Option<String>,
    client_name: String,
    auth_method: Option<String>,
    buffer_size: usize,
    max_line_length: usize,
}

impl ConfigBuilder {
    /// Creates a new builder with the given protocol and hostname.
    #[must_use]
    pub fn new(protocol: Protocol, host: impl Into<String>) -> Self {
        Self {
            protocol,
            host: host.into(),
            port: None,
            tls_mode: TlsMode::StartTls,
            tls: TlsOptions::default(),
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            rate_limit: 0.0,
            proxy: None,
            client_name: "localhost".to_string(),
            auth_method: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    /// Disables certificate verification.
    #[must_use]
    pub const fn skip_verify(mut self, skip: bool) -> Self {
        self.tls.skip_verify = skip;
        self
    }

    /// Sets the accepted TLS version range.
    #[must_use]
    pub const fn tls_versions(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.tls.min_version = min;
        self.tls.max_version = max;
        self
    }

    /// Adds a trust anchor.
    #[must_use]
    pub fn add_root(mut self, cert: CertificateDer<'static>) -> Self {
        self.tls.extra_roots.push(cert);
        self
    }

    /// Sets the dial timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the response read timeout.
    #[must_use]
    pub const fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Sets the close timeout.
    #[must_use]
    pub const fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the rate limit in operations per second.
    #[must_use]
    pub const fn rate_limit(mut self, per_second: f64) -> Self {
        self.rate_limit = per_second;
        self
    }

    /// Routes the connection through a proxy.
    #[must_use]
    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.proxy = Some(url.into());
        self
    }

    /// Sets the EHLO/HELO client name.
    #[must_use]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Forces a specific authentication mechanism.
    #[must_use]
    pub fn auth_method(mut self, mechanism: impl Into<String>) -> Self {
        self.auth_method = Some(mechanism.into());
        self
    }

    /// Sets the read buffer size.
    #[must_use]
    pub const fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the maximum response line length.
    #[must_use]
    pub const fn max_line_length(mut self, len: usize) -> Self {
        self.max_line_length = len;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        Config {
            protocol: self.protocol,
            port: self
                .port
                .unwrap_or_else(|| self.protocol.default_port(self.tls_mode)),
            host: self.host,
            tls_mode: self.tls_mode,
            tls: self.tls,
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
            close_timeout: self.close_timeout,
            retry: self.retry,
            rate_limit: self.rate_limit,
            proxy: self.proxy,
            client_name: self.client_name,
            auth_method: self.auth_method,
            buffer_size: self.buffer_size,
            max_line_length: self.max_line_length,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        assert_eq!(Protocol::Smtp.default_port(TlsMode::None), 25);
        assert_eq!(Protocol::Smtp.default_port(TlsMode::StartTls), 587);
        assert_eq!(Protocol::Smtp.default_port(TlsMode::Implicit), 465);
        assert_eq!(Protocol::Pop3.default_port(TlsMode::StartTls), 110);
        assert_eq!(Protocol::Pop3.default_port(TlsMode::Implicit), 995);
    }

    #[test]
    fn test_config_new() {
        let config = Config::new(Protocol::Pop3, "pop.example.com");
        assert_eq!(config.host, "pop.example.com");
        assert_eq!(config.port, 110);
        assert_eq!(config.tls_mode, TlsMode::StartTls);
        assert!(!config.tls.skip_verify);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder(Protocol::Smtp, "smtp.example.com")
            .tls_mode(TlsMode::Implicit)
            .io_timeout(Duration::from_secs(10))
            .rate_limit(2.5)
            .client_name("probe.example.org")
            .build();

        assert_eq!(config.port, 465);
        assert_eq!(config.io_timeout, Duration::from_secs(10));
        assert!((config.rate_limit - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.client_name, "probe.example.org");
    }

    #[test]
    fn test_explicit_port_wins() {
        let config = Config::builder(Protocol::Smtp, "smtp.example.com")
            .port(2525)
            .tls_mode(TlsMode::Implicit)
            .build();
        assert_eq!(config.port, 2525);
    }

    #[test]
    fn test_tls_version_parse() {
        assert_eq!(TlsVersion::parse("1.2").unwrap(), TlsVersion::Tls12);
        assert_eq!(TlsVersion::parse("TLS1.3").unwrap(), TlsVersion::Tls13);
        assert_eq!(TlsVersion::parse("tlsv1.0").unwrap(), TlsVersion::Tls10);
        assert!(TlsVersion::parse("2.0").is_err());
    }
}

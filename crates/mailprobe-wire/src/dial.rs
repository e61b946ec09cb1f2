//! Dialing: direct TCP or SOCKS5, optionally straight into TLS.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{Config, TlsMode};
use crate::ratelimit::RateLimiter;
use crate::tls::{create_tls_connector, server_name};
use crate::transport::{BoxedStream, Transport, handshake_error};
use crate::{Error, Result};

/// Default SOCKS port.
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Parsed SOCKS5 proxy URL.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Optional username/password.
    pub auth: Option<(String, String)>,
    /// Resolve the target on the proxy (`socks5h`) instead of locally.
    pub remote_dns: bool,
}

impl ProxyConfig {
    /// Parses `socks5://[user:pass@]host[:port]` or `socks5h://...`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed URLs or other schemes.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| Error::Config(format!("invalid proxy URL: {e}")))?;

        let remote_dns = match url.scheme() {
            "socks5" => false,
            "socks5h" => true,
            other => {
                return Err(Error::Config(format!(
                    "unsupported proxy scheme {other} (expected socks5 or socks5h)"
                )));
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config("proxy URL has no host".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let auth = (!url.username().is_empty()).then(|| {
            (
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            )
        });

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_SOCKS_PORT),
            auth,
            remote_dns,
        })
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth", &self.auth.as_ref().map(|(user, _)| user))
            .field("remote_dns", &self.remote_dns)
            .finish()
    }
}

/// Dials the configured server under the retry policy.
///
/// Each attempt takes a rate-limiter token and is bounded by the connect
/// timeout, which covers the TCP connect, the proxy negotiation and, in
/// implicit mode, the TLS handshake.
///
/// # Errors
///
/// Returns the final dial error (wrapped in [`Error::RetriesExhausted`] when
/// retries ran out), or [`Error::Cancelled`].
pub async fn dial(
    config: &Config,
    limiter: &RateLimiter,
    cancel: &CancellationToken,
) -> Result<Transport<BoxedStream>> {
    let proxy = config.proxy.as_deref().map(ProxyConfig::parse).transpose()?;

    config
        .retry
        .run(cancel, |attempt| {
            let proxy = proxy.as_ref();
            async move {
                limiter.acquire(cancel).await?;
                tracing::debug!(
                    host = %config.host,
                    port = config.port,
                    attempt = attempt + 1,
                    tls = ?config.tls_mode,
                    "dialing"
                );
                tokio::time::timeout(config.connect_timeout, dial_once(config, proxy))
                    .await
                    .map_err(|_| Error::Timeout(config.connect_timeout))?
            }
        })
        .await
}

async fn dial_once(config: &Config, proxy: Option<&ProxyConfig>) -> Result<Transport<BoxedStream>> {
    let stream: BoxedStream = match proxy {
        Some(proxy) => Box::new(connect_via_proxy(config, proxy).await?),
        None => Box::new(connect_direct(config).await?),
    };

    if config.tls_mode != TlsMode::Implicit {
        return Ok(Transport::plain(stream, config.buffer_size));
    }

    let connector = create_tls_connector(&config.tls)?;
    let tls = connector
        .connect(server_name(&config.host)?, stream)
        .await
        .map_err(handshake_error)?;
    Ok(Transport::tls(tls, config.buffer_size))
}

async fn connect_direct(config: &Config) -> Result<TcpStream> {
    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|source| connection_error(config, source))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn connect_via_proxy(config: &Config, proxy: &ProxyConfig) -> Result<Socks5Stream<TcpStream>> {
    let proxy_addr = (proxy.host.as_str(), proxy.port);

    let result = if proxy.remote_dns {
        let target = (config.host.as_str(), config.port);
        match &proxy.auth {
            Some((user, pass)) => Socks5Stream::connect_with_password(proxy_addr, target, user, pass).await,
            None => Socks5Stream::connect(proxy_addr, target).await,
        }
    } else {
        let target = resolve(config).await?;
        match &proxy.auth {
            Some((user, pass)) => Socks5Stream::connect_with_password(proxy_addr, target, user, pass).await,
            None => Socks5Stream::connect(proxy_addr, target).await,
        }
    };

    result.map_err(|err| connection_error(config, socks_io_error(err)))
}

async fn resolve(config: &Config) -> Result<SocketAddr> {
    tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|source| connection_error(config, source))?
        .next()
        .ok_or_else(|| {
            connection_error(
                config,
                io::Error::new(io::ErrorKind::NotFound, "no such host"),
            )
        })
}

fn socks_io_error(err: tokio_socks::Error) -> io::Error {
    match err {
        tokio_socks::Error::Io(err) => err,
        other => io::Error::other(other.to_string()),
    }
}

fn connection_error(config: &Config, source: io::Error) -> Error {
    Error::Connection {
        host: config.host.clone(),
        port: config.port,
        source,
    }
}

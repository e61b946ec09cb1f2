//! Byte transport with an atomic TLS upgrade.
//!
//! The socket and its read buffer live in one enum so an upgrade replaces
//! both at once. A plaintext reader is consumed by the upgrade; nothing can
//! be read through it afterwards.

use std::io;

use rustls::ClientConnection;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::{Error, Result};

/// Byte stream a transport can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream produced by the dialer (direct TCP or proxied).
pub type BoxedStream = Box<dyn AsyncStream>;

/// Plaintext or TLS stream together with its read buffer.
pub enum Transport<S> {
    /// Plaintext stream.
    Plain(BufReader<S>),
    /// TLS stream (boxed to reduce enum size).
    Tls(Box<BufReader<TlsStream<S>>>),
    /// Shut down, or broken by a failed upgrade.
    Closed,
}

impl<S: AsyncStream> Transport<S> {
    /// Wraps a plaintext stream.
    pub fn plain(stream: S, buffer_size: usize) -> Self {
        Self::Plain(BufReader::with_capacity(buffer_size, stream))
    }

    /// Wraps an established TLS stream.
    pub fn tls(stream: TlsStream<S>, buffer_size: usize) -> Self {
        Self::Tls(Box::new(BufReader::with_capacity(buffer_size, stream)))
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Returns true once the transport is unusable.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Number of received bytes not yet consumed by a read.
    #[must_use]
    pub fn buffered(&self) -> usize {
        match self {
            Self::Plain(reader) => reader.buffer().len(),
            Self::Tls(reader) => reader.buffer().len(),
            Self::Closed => 0,
        }
    }

    /// Returns the rustls session state of a TLS transport.
    #[must_use]
    pub fn tls_connection(&self) -> Option<&ClientConnection> {
        match self {
            Self::Tls(reader) => Some(reader.get_ref().get_ref().1),
            Self::Plain(_) | Self::Closed => None,
        }
    }

    /// Reads one LF-terminated line and strips the line terminator.
    ///
    /// # Errors
    ///
    /// Returns an I/O error on EOF, a parse error when the line exceeds
    /// `max_len` bytes, and a state error on a closed transport.
    pub async fn read_line(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        self.read_line_into(&mut line, max_len).await?;
        Ok(line)
    }

    /// Appends the rest of the current line to `line`, without terminator.
    ///
    /// Cancel-safe: bytes taken from the socket before the future is dropped
    /// stay in `line`, so a later call with the same buffer completes the
    /// line.
    ///
    /// # Errors
    ///
    /// Same as [`Transport::read_line`].
    pub async fn read_line_into(&mut self, line: &mut Vec<u8>, max_len: usize) -> Result<()> {
        match self {
            Self::Plain(reader) => read_line_from(reader, line, max_len).await,
            Self::Tls(reader) => read_line_from(reader.as_mut(), line, max_len).await,
            Self::Closed => Err(closed()),
        }
    }

    /// Writes and flushes `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the transport is closed.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
            Self::Tls(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
            Self::Closed => return Err(closed()),
        }
        Ok(())
    }

    /// Performs the TLS handshake over the plaintext socket.
    ///
    /// Refuses to upgrade while unread plaintext is buffered: those bytes were
    /// sent before the handshake and would otherwise be treated as protected
    /// data (STARTTLS command injection).
    ///
    /// # Errors
    ///
    /// Returns [`Error::TlsUpgrade`] if plaintext is pending or the handshake
    /// fails, and [`Error::InvalidState`] if the transport is not plaintext.
    pub async fn upgrade(
        self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
        buffer_size: usize,
    ) -> Result<Self> {
        let reader = match self {
            Self::Plain(reader) => reader,
            Self::Tls(_) => return Err(Error::InvalidState("connection is already using TLS".into())),
            Self::Closed => return Err(closed()),
        };

        let pending = reader.buffer().len();
        if pending > 0 {
            return Err(Error::TlsUpgrade(format!(
                "{pending} bytes of plaintext received after the upgrade response"
            )));
        }

        let stream = reader.into_inner();
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|err| Error::TlsUpgrade(format!("handshake failed: {}", handshake_error(err))))?;

        Ok(Self::tls(tls, buffer_size))
    }

    /// Shuts the stream down and marks the transport closed.
    ///
    /// # Errors
    ///
    /// Returns the shutdown error; the transport is closed either way.
    pub async fn shutdown(&mut self) -> Result<()> {
        let result = match self {
            Self::Plain(reader) => reader.get_mut().shutdown().await,
            Self::Tls(reader) => reader.get_mut().shutdown().await,
            Self::Closed => return Ok(()),
        };
        *self = Self::Closed;
        result.map_err(Error::from)
    }
}

impl<S> std::fmt::Debug for Transport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Plain(_) => "Plain",
            Self::Tls(_) => "Tls",
            Self::Closed => "Closed",
        };
        f.debug_tuple("Transport").field(&kind).finish()
    }
}

/// Converts a handshake I/O error, surfacing the rustls error when present.
#[must_use]
pub fn handshake_error(err: io::Error) -> Error {
    match err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        Some(tls) => Error::Tls(tls.clone()),
        None => Error::Io(err),
    }
}

fn closed() -> Error {
    Error::InvalidState("connection closed".into())
}

async fn read_line_from<R>(reader: &mut R, line: &mut Vec<u8>, max_len: usize) -> Result<()>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }

        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&buf[..pos]);
            reader.consume(pos + 1);
            break;
        }

        let len = buf.len();
        line.extend_from_slice(buf);
        reader.consume(len);

        if line.len() > max_len {
            return Err(Error::Parse(format!("line exceeds {max_len} bytes")));
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.len() > max_len {
        return Err(Error::Parse(format!("line exceeds {max_len} bytes")));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::config::TlsOptions;
    use crate::tls::{create_tls_connector, server_name};
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn reads_crlf_and_bare_lf_lines() {
        let mock = Builder::new().read(b"+OK ready\r\nsecond\nthird\r\n").build();
        let mut transport = Transport::plain(mock, 64);

        assert_eq!(transport.read_line(1024).await.unwrap(), b"+OK ready");
        assert_eq!(transport.read_line(1024).await.unwrap(), b"second");
        assert_eq!(transport.read_line(1024).await.unwrap(), b"third");
    }

    #[tokio::test]
    async fn line_split_across_reads() {
        let mock = Builder::new().read(b"250-mx.exa").read(b"mple.com\r\n").build();
        let mut transport = Transport::plain(mock, 64);
        assert_eq!(transport.read_line(1024).await.unwrap(), b"250-mx.example.com");
    }

    #[tokio::test]
    async fn read_line_into_continues_a_partial_line() {
        let mock = Builder::new().read(b"lf\r\nnext\r\n").build();
        let mut transport = Transport::plain(mock, 64);
        let mut line = b"+OK ha".to_vec();
        transport.read_line_into(&mut line, 1024).await.unwrap();
        assert_eq!(line, b"+OK half");
        assert_eq!(transport.read_line(1024).await.unwrap(), b"next");
    }

    #[tokio::test]
    async fn eof_is_an_io_error() {
        let mock = Builder::new().read(b"partial").build();
        let mut transport = Transport::plain(mock, 64);
        let err = transport.read_line(1024).await.unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let mock = Builder::new().read(&[b'a'; 40]).build();
        let mut transport = Transport::plain(mock, 16);
        let err = transport.read_line(32).await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn write_flushes() {
        let mock = Builder::new().write(b"NOOP\r\n").build();
        let mut transport = Transport::plain(mock, 64);
        transport.write_all(b"NOOP\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn upgrade_refuses_pending_plaintext() {
        // "220 go ahead" and an injected command arrive in one segment.
        let mock = Builder::new().read(b"220 go ahead\r\nRSET\r\n").build();
        let mut transport = Transport::plain(mock, 64);
        transport.read_line(1024).await.unwrap();
        assert!(transport.buffered() > 0);

        let connector = create_tls_connector(&TlsOptions::default()).unwrap();
        let err = transport
            .upgrade(&connector, server_name("mail.example.com").unwrap(), 64)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TlsUpgrade(ref msg) if msg.contains("plaintext")));
    }

    #[tokio::test]
    async fn closed_transport_rejects_io() {
        let mock = Builder::new().build();
        let mut transport = Transport::plain(mock, 64);
        transport.shutdown().await.unwrap();
        assert!(transport.is_closed());
        assert!(matches!(transport.read_line(10).await, Err(Error::InvalidState(_))));
        assert!(matches!(transport.write_all(b"x").await, Err(Error::InvalidState(_))));
        // Idempotent.
        transport.shutdown().await.unwrap();
    }

    #[test]
    fn handshake_error_unwraps_rustls() {
        let err = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::DecryptError);
        assert!(matches!(handshake_error(err), Error::Tls(rustls::Error::DecryptError)));

        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(handshake_error(err), Error::Io(_)));
    }
}

//! Integration tests for TLS dialing and in-band upgrade.
//!
//! A local listener with an rcgen-issued certificate plays the server; the
//! client trusts the test CA through the extra-roots option.

use std::sync::Arc;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mailprobe_wire::dial::dial;
use mailprobe_wire::tls::create_tls_connector;
use mailprobe_wire::{
    CancellationToken, Config, Connection, Error, Protocol, RateLimiter, RetryPolicy, TlsMode,
    VerificationStatus,
};

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailprobe_wire=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

struct TestPki {
    ca: CertificateDer<'static>,
    acceptor: TlsAcceptor,
}

#[allow(clippy::unwrap_used)]
fn test_pki() -> TestPki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name.push(DnType::CommonName, "mailprobe test CA");
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    leaf_params.distinguished_name.push(DnType::CommonName, "localhost");
    let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![leaf.der().clone()], key)
        .unwrap();

    TestPki {
        ca: ca.der().clone(),
        acceptor: TlsAcceptor::from(Arc::new(server)),
    }
}

fn config(port: u16, mode: TlsMode, pki: &TestPki) -> Config {
    Config::builder(Protocol::Pop3, "localhost")
        .port(port)
        .tls_mode(mode)
        .retry(RetryPolicy::none())
        .add_root(pki.ca.clone())
        .build()
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_implicit_tls_dial() {
    let pki = test_pki();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = pki.acceptor.clone();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(socket).await.unwrap();
        tls.write_all(b"+OK secure greeting\r\n").await.unwrap();
        tls.flush().await.unwrap();
        // Hold the connection open until the client is done.
        let mut buf = String::new();
        let _ = BufReader::new(tls).read_line(&mut buf).await;
    });

    let config = config(port, TlsMode::Implicit, &pki);
    let transport = dial(&config, &RateLimiter::disabled(), &CancellationToken::new())
        .await
        .unwrap();
    let mut conn = Connection::new(transport, &config, RateLimiter::disabled(), CancellationToken::new());

    assert!(conn.is_tls());
    assert_eq!(conn.read_line().await.unwrap(), "+OK secure greeting");

    let analysis = conn.tls_analysis().unwrap();
    assert_eq!(analysis.status, VerificationStatus::Valid);
    assert_eq!(analysis.protocol_version, "TLS 1.3");
    assert!(analysis.certificate.as_ref().unwrap().issuer.contains("mailprobe test CA"));
    conn.close().await;
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_stls_upgrade_swaps_transport() {
    init_tracing();
    let pki = test_pki();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = pki.acceptor.clone();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut plain = BufReader::new(socket);
        plain.get_mut().write_all(b"+OK ready\r\n").await.unwrap();

        let mut line = String::new();
        plain.read_line(&mut line).await.unwrap();
        assert_eq!(line, "STLS\r\n");
        plain.get_mut().write_all(b"+OK Begin TLS negotiation\r\n").await.unwrap();

        let tls = acceptor.accept(plain.into_inner()).await.unwrap();
        let mut tls = BufReader::new(tls);
        line.clear();
        tls.read_line(&mut line).await.unwrap();
        assert_eq!(line, "CAPA\r\n");
        tls.get_mut().write_all(b"+OK\r\nUSER\r\n.\r\n").await.unwrap();
        tls.get_mut().flush().await.unwrap();
    });

    let config = config(port, TlsMode::StartTls, &pki);
    let transport = dial(&config, &RateLimiter::disabled(), &CancellationToken::new())
        .await
        .unwrap();
    let mut conn = Connection::new(transport, &config, RateLimiter::disabled(), CancellationToken::new());
    assert!(!conn.is_tls());
    assert!(conn.tls_analysis().is_none());

    assert_eq!(conn.read_line().await.unwrap(), "+OK ready");
    conn.send(b"STLS\r\n").await.unwrap();
    assert!(conn.read_line().await.unwrap().starts_with("+OK"));

    let connector = create_tls_connector(&config.tls).unwrap();
    let analysis = conn.upgrade(&connector).await.unwrap();
    assert_eq!(analysis.status, VerificationStatus::Valid);
    assert!(conn.is_tls());

    conn.send(b"CAPA\r\n").await.unwrap();
    assert_eq!(conn.read_line().await.unwrap(), "+OK");
    assert_eq!(conn.read_line().await.unwrap(), "USER");
    assert_eq!(conn.read_line().await.unwrap(), ".");

    server.await.unwrap();
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_untrusted_certificate_fails_handshake() {
    let pki = test_pki();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = pki.acceptor.clone();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let _ = acceptor.accept(socket).await;
    });

    // No extra root: the test CA is unknown.
    let config = Config::builder(Protocol::Pop3, "localhost")
        .port(port)
        .tls_mode(TlsMode::Implicit)
        .retry(RetryPolicy::none())
        .build();
    let err = dial(&config, &RateLimiter::disabled(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Tls(_)), "{err}");
    assert!(!err.is_retryable());
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_skip_verify_still_analyzes() {
    let pki = test_pki();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = pki.acceptor.clone();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(socket).await.unwrap();
        tls.write_all(b"+OK hi\r\n").await.unwrap();
        let mut buf = String::new();
        let _ = BufReader::new(tls).read_line(&mut buf).await;
    });

    let config = Config::builder(Protocol::Pop3, "localhost")
        .port(port)
        .tls_mode(TlsMode::Implicit)
        .skip_verify(true)
        .retry(RetryPolicy::none())
        .build();
    let transport = dial(&config, &RateLimiter::disabled(), &CancellationToken::new())
        .await
        .unwrap();
    let conn = Connection::new(transport, &config, RateLimiter::disabled(), CancellationToken::new());

    let analysis = conn.tls_analysis().unwrap();
    assert!(analysis.verification_disabled);
    assert!(analysis.warnings.iter().any(|w| w.contains("verification disabled")));
}

//! TLS client configuration.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion};
use tokio_rustls::TlsConnector;

use crate::config::{TlsOptions, TlsVersion};
use crate::{Error, Result};

/// Creates a TLS connector honoring the version bounds and verification mode.
///
/// # Errors
///
/// Returns a configuration error if the version range is empty or contains no
/// version this client can negotiate (TLS 1.2 and 1.3).
pub fn create_tls_connector(options: &TlsOptions) -> Result<TlsConnector> {
    let versions = protocol_versions(options.min_version, options.max_version)?;
    let builder = ClientConfig::builder_with_protocol_versions(&versions);

    let config = if options.skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new()))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for cert in &options.extra_roots {
            roots.add(cert.clone())?;
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Converts a host name into a TLS server name.
///
/// # Errors
///
/// Returns an error if the name is neither a DNS name nor an IP address.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    Ok(ServerName::try_from(host.to_string())?)
}

fn protocol_versions(
    min: TlsVersion,
    max: TlsVersion,
) -> Result<Vec<&'static SupportedProtocolVersion>> {
    if min > max {
        return Err(Error::Config(format!(
            "minimum TLS version {min:?} is above maximum {max:?}"
        )));
    }

    let versions: Vec<_> = [
        (TlsVersion::Tls12, &rustls::version::TLS12),
        (TlsVersion::Tls13, &rustls::version::TLS13),
    ]
    .into_iter()
    .filter(|(version, _)| (min..=max).contains(version))
    .map(|(_, supported)| supported)
    .collect();

    if versions.is_empty() {
        return Err(Error::Config(format!(
            "no supported TLS version between {min:?} and {max:?}"
        )));
    }
    Ok(versions)
}

/// Verifier that accepts any certificate chain but still checks handshake
/// signatures.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl NoVerifier {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
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
    fn test_create_tls_connector() {
        assert!(create_tls_connector(&TlsOptions::default()).is_ok());
    }

    #[test]
    fn test_skip_verify_connector() {
        let options = TlsOptions {
            skip_verify: true,
            ..TlsOptions::default()
        };
        assert!(create_tls_connector(&options).is_ok());
    }

    #[test]
    fn test_version_range() {
        assert_eq!(
            protocol_versions(TlsVersion::Tls12, TlsVersion::Tls13)
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            protocol_versions(TlsVersion::Tls10, TlsVersion::Tls12)
                .unwrap()
                .len(),
            1
        );
        assert!(protocol_versions(TlsVersion::Tls10, TlsVersion::Tls11).is_err());
        assert!(protocol_versions(TlsVersion::Tls13, TlsVersion::Tls12).is_err());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("mail.example.com").is_ok());
        assert!(server_name("192.0.2.1").is_ok());
        assert!(server_name("bad host name").is_err());
    }
}

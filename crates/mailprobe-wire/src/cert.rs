//! Post-handshake certificate and cipher analysis.
//!
//! The analysis is independent of the handshake's own chain validation: it
//! runs even with verification disabled and reports what a careful operator
//! would want to know about the leaf certificate and negotiated parameters.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rustls::ClientConnection;
use rustls::pki_types::CertificateDer;
use serde::Serialize;
use x509_parser::prelude::*;

/// Days before expiry at which a certificate is reported as expiring soon.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

/// Longest validity period accepted by browsers for public certificates.
pub const MAX_VALIDITY_DAYS: i64 = 398;

/// Outcome of the certificate checks, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Every check passed.
    Valid,
    /// The leaf does not cover the requested host.
    HostnameMismatch,
    /// The leaf is past its `notAfter` date.
    Expired,
    /// Subject and issuer are identical.
    SelfSigned,
    /// The leaf could not be parsed or is not yet valid.
    Invalid,
    /// The server presented no certificate.
    NoCertificates,
}

impl VerificationStatus {
    /// Returns the snake-case name used in reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::HostnameMismatch => "hostname_mismatch",
            Self::Expired => "expired",
            Self::SelfSigned => "self_signed",
            Self::Invalid => "invalid",
            Self::NoCertificates => "no_certificates",
        }
    }
}

/// Strength class of a negotiated cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherStrength {
    /// AEAD suites.
    Strong,
    /// CBC suites with SHA-1 MACs.
    Weak,
    /// Broken or export-grade suites.
    Deprecated,
}

/// Classifies a cipher suite name.
#[must_use]
pub fn classify_cipher(suite: &str) -> CipherStrength {
    let name = suite.to_uppercase();
    let has = |needle: &str| name.contains(needle);

    if has("RC4") || has("3DES") || has("DES") || has("EXPORT") || has("NULL") || has("ANON") {
        CipherStrength::Deprecated
    } else if has("GCM") || has("CHACHA20") || has("POLY1305") || has("CCM") {
        CipherStrength::Strong
    } else if has("CBC") && !(has("SHA256") || has("SHA384")) {
        CipherStrength::Weak
    } else {
        CipherStrength::Strong
    }
}

/// Returns true for protocol versions that should no longer be negotiated.
#[must_use]
pub fn is_deprecated_version(version: &str) -> bool {
    let name = version.to_uppercase().replace(['V', '_', ' '], "");
    matches!(
        name.as_str(),
        "SSL2" | "SSL2.0" | "SSL3" | "SSL3.0" | "TLS1" | "TLS10" | "TLS1.0" | "TLS11" | "TLS1.1"
    )
}

/// Subject alternative name entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SubjectAltName {
    /// DNS name, possibly a wildcard.
    Dns(String),
    /// IP address.
    Ip(IpAddr),
    /// RFC 822 mailbox.
    Email(String),
    /// URI.
    Uri(String),
}

/// Details of the leaf certificate.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateInfo {
    /// Subject distinguished name.
    pub subject: String,
    /// Issuer distinguished name.
    pub issuer: String,
    /// Serial number, colon-separated hex.
    pub serial: String,
    /// Start of the validity window.
    pub not_before: DateTime<Utc>,
    /// End of the validity window.
    pub not_after: DateTime<Utc>,
    /// Subject alternative names.
    pub sans: Vec<SubjectAltName>,
    /// Public key algorithm name.
    pub key_algorithm: String,
    /// Public key size in bits, when known.
    pub key_bits: Option<usize>,
}

impl CertificateInfo {
    /// Parses a DER certificate.
    ///
    /// Returns `None` if the bytes are not a valid X.509 certificate.
    #[must_use]
    pub fn from_der(der: &[u8]) -> Option<Self> {
        let (_, cert) = X509Certificate::from_der(der).ok()?;

        let sans = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(SubjectAltName::Dns((*dns).to_string())),
                        GeneralName::RFC822Name(mail) => {
                            Some(SubjectAltName::Email((*mail).to_string()))
                        }
                        GeneralName::URI(uri) => Some(SubjectAltName::Uri((*uri).to_string())),
                        GeneralName::IPAddress(bytes) => ip_from_bytes(bytes).map(SubjectAltName::Ip),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (key_algorithm, key_bits) = match cert.public_key().parsed() {
            Ok(x509_parser::public_key::PublicKey::RSA(rsa)) => ("RSA", Some(rsa.key_size())),
            Ok(x509_parser::public_key::PublicKey::EC(ec)) => ("EC", Some(ec.key_size())),
            Ok(x509_parser::public_key::PublicKey::DSA(_)) => ("DSA", None),
            Ok(_) => ("other", None),
            Err(_) => ("unknown", None),
        };

        let validity = cert.validity();
        Some(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            not_before: DateTime::from_timestamp(validity.not_before.timestamp(), 0)?,
            not_after: DateTime::from_timestamp(validity.not_after.timestamp(), 0)?,
            sans,
            key_algorithm: key_algorithm.to_string(),
            key_bits,
        })
    }

    /// Returns the signed number of whole days until `notAfter`.
    #[must_use]
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    /// Returns the validity period in days.
    #[must_use]
    pub fn validity_days(&self) -> i64 {
        (self.not_after - self.not_before).num_days()
    }

    /// Returns true if the certificate covers `host`.
    ///
    /// DNS SANs take precedence; the subject common name is only consulted when
    /// the certificate carries no DNS or IP SANs.
    #[must_use]
    pub fn matches_host(&self, host: &str) -> bool {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self
                .sans
                .iter()
                .any(|san| matches!(san, SubjectAltName::Ip(addr) if *addr == ip));
        }

        let mut has_names = false;
        for san in &self.sans {
            match san {
                SubjectAltName::Dns(pattern) => {
                    has_names = true;
                    if hostname_matches(pattern, host) {
                        return true;
                    }
                }
                SubjectAltName::Ip(_) => has_names = true,
                _ => {}
            }
        }
        if has_names {
            return false;
        }

        common_name(&self.subject).is_some_and(|cn| hostname_matches(cn, host))
    }

    /// Returns true if subject and issuer are the same name.
    #[must_use]
    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer
    }
}

/// Matches a certificate name against a host, honoring a single left-most
/// wildcard label.
#[must_use]
pub fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_lowercase();
    let host = host.trim_end_matches('.').to_lowercase();

    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix && suffix.contains('.'),
            None => false,
        };
    }
    pattern == host
}

fn common_name(dn: &str) -> Option<&str> {
    dn.split(',')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("CN="))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Full analysis of a TLS session.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateAnalysis {
    /// Host the client asked for.
    pub host: String,
    /// Negotiated protocol version, e.g. `TLS 1.3`.
    pub protocol_version: String,
    /// Negotiated cipher suite name.
    pub cipher_suite: String,
    /// Strength class of the cipher suite.
    pub cipher_strength: CipherStrength,
    /// Leaf certificate, if one was presented and parsed.
    pub certificate: Option<CertificateInfo>,
    /// Number of certificates the server sent.
    pub chain_length: usize,
    /// Verification outcome.
    pub status: VerificationStatus,
    /// Signed days until the leaf expires (negative once expired).
    pub days_until_expiry: Option<i64>,
    /// Whether chain verification was disabled for the handshake.
    pub verification_disabled: bool,
    /// Problems found.
    pub warnings: Vec<String>,
    /// Suggested improvements.
    pub recommendations: Vec<String>,
}

impl CertificateAnalysis {
    /// Analyzes an established client connection.
    #[must_use]
    pub fn from_connection(conn: &ClientConnection, host: &str, verification_disabled: bool) -> Self {
        let version = conn
            .protocol_version()
            .map_or_else(|| "unknown".to_string(), version_name);
        let suite = conn
            .negotiated_cipher_suite()
            .map_or_else(
                || "unknown".to_string(),
                |suite| suite.suite().as_str().unwrap_or("UNKNOWN").to_string(),
            );
        let chain = conn.peer_certificates().unwrap_or_default();

        Self::analyze(chain, host, &version, &suite, verification_disabled, Utc::now())
    }

    /// Analyzes a certificate chain and negotiated parameters at time `now`.
    #[must_use]
    pub fn analyze(
        chain: &[CertificateDer<'_>],
        host: &str,
        protocol_version: &str,
        cipher_suite: &str,
        verification_disabled: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let certificate = chain.first().and_then(|leaf| CertificateInfo::from_der(leaf));
        let status = match (&certificate, chain.is_empty()) {
            (_, true) => VerificationStatus::NoCertificates,
            (None, false) => VerificationStatus::Invalid,
            (Some(cert), false) => {
                if !cert.matches_host(host) {
                    VerificationStatus::HostnameMismatch
                } else if now > cert.not_after {
                    VerificationStatus::Expired
                } else if now < cert.not_before {
                    VerificationStatus::Invalid
                } else if cert.is_self_signed() {
                    VerificationStatus::SelfSigned
                } else {
                    VerificationStatus::Valid
                }
            }
        };

        let mut analysis = Self {
            host: host.to_string(),
            protocol_version: protocol_version.to_string(),
            cipher_suite: cipher_suite.to_string(),
            cipher_strength: classify_cipher(cipher_suite),
            days_until_expiry: certificate.as_ref().map(|c| c.days_until_expiry(now)),
            certificate,
            chain_length: chain.len(),
            status,
            verification_disabled,
            warnings: Vec::new(),
            recommendations: Vec::new(),
        };
        analysis.collect_findings(now);
        analysis
    }

    /// Returns true if no warning was raised.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn collect_findings(&mut self, now: DateTime<Utc>) {
        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();

        if is_deprecated_version(&self.protocol_version) {
            warnings.push(format!("deprecated protocol version {}", self.protocol_version));
            recommendations.push("Disable TLS 1.1 and older; prefer TLS 1.3".to_string());
        } else if self.protocol_version == "TLS 1.2" {
            recommendations.push("Enable TLS 1.3".to_string());
        }

        match self.cipher_strength {
            CipherStrength::Deprecated => {
                warnings.push(format!("deprecated cipher suite {}", self.cipher_suite));
                recommendations.push("Remove RC4, 3DES, export and NULL cipher suites".to_string());
            }
            CipherStrength::Weak => {
                warnings.push(format!("weak cipher suite {}", self.cipher_suite));
                recommendations.push("Prefer AEAD cipher suites (AES-GCM, ChaCha20-Poly1305)".to_string());
            }
            CipherStrength::Strong => {}
        }

        if self.verification_disabled {
            warnings.push("certificate verification disabled".to_string());
            recommendations.push("Re-run with certificate verification enabled".to_string());
        }

        match self.status {
            VerificationStatus::HostnameMismatch => {
                warnings.push(format!("certificate does not match host {}", self.host));
                recommendations.push("Issue a certificate whose SANs include the server name".to_string());
            }
            VerificationStatus::NoCertificates => {
                warnings.push("server presented no certificate".to_string());
            }
            VerificationStatus::Invalid => {
                warnings.push("certificate is not valid (unparseable or not yet valid)".to_string());
            }
            VerificationStatus::Valid | VerificationStatus::Expired | VerificationStatus::SelfSigned => {}
        }

        if let Some(cert) = &self.certificate {
            let days = cert.days_until_expiry(now);
            if now > cert.not_after {
                warnings.push(format!("certificate expired {} days ago", -days));
                recommendations.push("Renew the certificate".to_string());
            } else if days <= EXPIRY_WARNING_DAYS {
                warnings.push(format!("certificate expires in {days} days"));
                recommendations.push("Renew the certificate or automate renewal (ACME)".to_string());
            }

            if cert.is_self_signed() {
                warnings.push("certificate is self-signed".to_string());
                recommendations.push("Use a certificate issued by a public CA".to_string());
            }

            let weak_key = match (cert.key_algorithm.as_str(), cert.key_bits) {
                ("RSA" | "DSA", Some(bits)) => bits < 2048,
                ("EC", Some(bits)) => bits < 256,
                _ => false,
            };
            if weak_key {
                warnings.push(format!(
                    "weak {} key ({} bits)",
                    cert.key_algorithm,
                    cert.key_bits.unwrap_or_default()
                ));
                recommendations.push("Use RSA 2048+ or ECDSA P-256+ keys".to_string());
            }

            if cert.validity_days() > MAX_VALIDITY_DAYS {
                warnings.push(format!(
                    "validity period of {} days exceeds {MAX_VALIDITY_DAYS}",
                    cert.validity_days()
                ));
                recommendations.push(format!("Keep certificate lifetimes at or below {MAX_VALIDITY_DAYS} days"));
            }
        }

        self.warnings = warnings;
        self.recommendations = recommendations;
    }
}

/// Human-readable protocol version name.
#[must_use]
pub fn version_name(version: rustls::ProtocolVersion) -> String {
    match version {
        rustls::ProtocolVersion::SSLv2 => "SSL 2.0".to_string(),
        rustls::ProtocolVersion::SSLv3 => "SSL 3.0".to_string(),
        rustls::ProtocolVersion::TLSv1_0 => "TLS 1.0".to_string(),
        rustls::ProtocolVersion::TLSv1_1 => "TLS 1.1".to_string(),
        rustls::ProtocolVersion::TLSv1_2 => "TLS 1.2".to_string(),
        rustls::ProtocolVersion::TLSv1_3 => "TLS 1.3".to_string(),
        other => format!("{other:?}"),
    }
}

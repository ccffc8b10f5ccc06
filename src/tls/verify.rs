//! Peer certificate name checks
//!
//! Chain validation is left to rustls' webpki verifier; the hostname is
//! matched here against the leaf certificate's SAN DNS names, SAN IP
//! addresses and, when there are no DNS names, the subject common name.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use std::net::IpAddr;
use std::sync::Arc;
use x509_parser::extensions::GeneralName;

/// Strip exactly one trailing dot. A name that becomes empty is rejected.
pub fn normalize_name(name: &str) -> Option<&str> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Names presented by a certificate, already normalized
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertNames {
    pub dns_names: Vec<String>,
    pub ip_addrs: Vec<IpAddr>,
    pub common_name: Option<String>,
}

impl CertNames {
    pub fn new(dns_names: Vec<String>, ip_addrs: Vec<IpAddr>, common_name: Option<String>) -> Self {
        let dns_names = dns_names
            .iter()
            .filter_map(|n| normalize_name(n))
            .map(str::to_string)
            .collect();
        let common_name = common_name
            .as_deref()
            .and_then(normalize_name)
            .map(str::to_string);
        Self {
            dns_names,
            ip_addrs,
            common_name,
        }
    }

    /// Extract names from a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| format!("failed to parse certificate: {}", e))?;

        let mut dns_names = Vec::new();
        let mut ip_addrs = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Ok(v4) = <[u8; 4]>::try_from(&bytes[..]) {
                            ip_addrs.push(IpAddr::from(v4));
                        } else if let Ok(v6) = <[u8; 16]>::try_from(&bytes[..]) {
                            ip_addrs.push(IpAddr::from(v6));
                        }
                    }
                    _ => {}
                }
            }
        }

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        Ok(Self::new(dns_names, ip_addrs, common_name))
    }
}

/// Case-insensitive certificate name match with the restricted wildcard
/// rules: the wildcard is honored only in the left-most label of a pattern
/// with at least two dots that is not an A-label, and it must match at
/// least one character.
pub fn tls_hostname_match(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let hostname = hostname.to_ascii_lowercase();

    let Some(wildcard) = pattern.find('*') else {
        return pattern == hostname;
    };
    let left_label_end = pattern.find('.').unwrap_or(pattern.len());
    let enabled = left_label_end < pattern.len()
        && pattern[left_label_end + 1..].contains('.')
        && wildcard < left_label_end
        && !pattern.starts_with("xn--");
    if !enabled {
        return pattern == hostname;
    }

    let host_label_end = hostname.find('.').unwrap_or(hostname.len());
    if pattern[left_label_end..] != hostname[host_label_end..] {
        return false;
    }
    if host_label_end < left_label_end {
        return false;
    }
    let host_label = &hostname[..host_label_end];
    host_label.starts_with(&pattern[..wildcard])
        && host_label.ends_with(&pattern[wildcard + 1..left_label_end])
}

/// Check `hostname` against the names a certificate presents
pub fn verify_hostname(hostname: &str, names: &CertNames) -> bool {
    let host = hostname
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(hostname);
    let Some(host) = normalize_name(host) else {
        return false;
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        if names.ip_addrs.is_empty() {
            return names.common_name.as_deref() == Some(host);
        }
        return names.ip_addrs.contains(&ip);
    }

    if names.dns_names.is_empty() {
        return names
            .common_name
            .as_deref()
            .map(|cn| tls_hostname_match(cn, host))
            .unwrap_or(false);
    }
    names.dns_names.iter().any(|n| tls_hostname_match(n, host))
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(
        err,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

/// Chain verification without the webpki name check
#[derive(Debug)]
pub(crate) struct ChainVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ChainVerifier {
    pub(crate) fn new(inner: Arc<WebPkiServerVerifier>) -> Self {
        Self { inner }
    }
}

impl ServerCertVerifier for ChainVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(err)) if is_name_mismatch(&err) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any chain; handshake signatures are still checked
#[derive(Debug)]
pub(crate) struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyCertificate {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
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
mod tests {
    use super::*;

    fn dns(names: &[&str]) -> CertNames {
        CertNames::new(names.iter().map(|s| s.to_string()).collect(), Vec::new(), None)
    }

    #[test]
    fn test_exact_match_is_case_insensitive() {
        assert!(tls_hostname_match("Example.COM", "example.com"));
        assert!(!tls_hostname_match("example.com", "www.example.com"));
    }

    #[test]
    fn test_wildcard_in_left_most_label() {
        assert!(tls_hostname_match("*.example.com", "www.example.com"));
        assert!(tls_hostname_match("w*.example.com", "www.example.com"));
        assert!(tls_hostname_match("*w.example.com", "www.example.com"));
        assert!(tls_hostname_match("w*w.example.com", "www.example.com"));
        assert!(!tls_hostname_match("*.example.com", "example.com"));
        assert!(!tls_hostname_match("*.example.com", "a.b.example.com"));
        assert!(!tls_hostname_match("www.*.com", "www.example.com"));
    }

    #[test]
    fn test_name_mismatch_variants() {
        let expected = rustls::pki_types::ServerName::try_from("example.com")
            .unwrap()
            .to_owned();
        assert!(is_name_mismatch(&CertificateError::NotValidForName));
        assert!(is_name_mismatch(&CertificateError::NotValidForNameContext {
            expected,
            presented: vec!["other.example".to_string()],
        }));
        assert!(!is_name_mismatch(&CertificateError::Expired));
        assert!(!is_name_mismatch(&CertificateError::UnknownIssuer));
    }

    #[test]
    fn test_wildcard_needs_two_dots() {
        assert!(!tls_hostname_match("*.com", "example.com"));
        assert!(tls_hostname_match("*.com", "*.com"));
    }

    #[test]
    fn test_wildcard_must_match_a_character() {
        assert!(!tls_hostname_match("w*w.example.com", "ww.example.com"));
        assert!(tls_hostname_match("w*.example.com", "wx.example.com"));
    }

    #[test]
    fn test_no_wildcard_in_a_label() {
        assert!(!tls_hostname_match("xn--*.example.com", "xn--abc.example.com"));
        assert!(tls_hostname_match("xn--*.example.com", "xn--*.example.com"));
    }

    #[test]
    fn test_trailing_dot_is_ignored() {
        let names = dns(&["example.com."]);
        assert!(verify_hostname("example.com", &names));
        assert!(verify_hostname("example.com.", &names));

        let names = CertNames::new(Vec::new(), Vec::new(), Some("*.example.org.".to_string()));
        assert!(verify_hostname("www.example.org", &names));
    }

    #[test]
    fn test_lone_dot_never_matches() {
        let names = dns(&["."]);
        assert!(names.dns_names.is_empty());
        assert!(!verify_hostname("", &names));
        assert!(!verify_hostname(".", &names));

        let names = CertNames::new(Vec::new(), Vec::new(), Some(".".to_string()));
        assert_eq!(names.common_name, None);
        assert!(!verify_hostname(".", &names));
    }

    #[test]
    fn test_common_name_only_used_without_dns_names() {
        let names = CertNames::new(
            vec!["other.example".to_string()],
            Vec::new(),
            Some("example.com".to_string()),
        );
        assert!(!verify_hostname("example.com", &names));
    }

    #[test]
    fn test_ip_address_matching() {
        let names = CertNames::new(
            vec!["localhost".to_string()],
            vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()],
            None,
        );
        assert!(verify_hostname("127.0.0.1", &names));
        assert!(verify_hostname("[::1]", &names));
        assert!(!verify_hostname("127.0.0.2", &names));

        // no IP SANs: fall back to an exact common name match
        let names = CertNames::new(Vec::new(), Vec::new(), Some("192.0.2.1".to_string()));
        assert!(verify_hostname("192.0.2.1", &names));
        assert!(!verify_hostname("192.0.2.2", &names));
    }

    #[test]
    fn test_names_from_der_certificate() {
        let pem = include_bytes!("../../tests/data/server.pem");
        let der = rustls_pemfile::certs(&mut &pem[..])
            .next()
            .unwrap()
            .unwrap();
        let names = CertNames::from_der(der.as_ref()).unwrap();
        assert_eq!(names.dns_names, vec!["localhost".to_string()]);
        assert_eq!(names.ip_addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(names.common_name.as_deref(), Some("localhost"));
    }
}

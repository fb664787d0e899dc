//! TLS client configuration for the tunnel connection.
//!
//! Three ways to trust the server:
//! - CA validation (webpki roots or a custom CA file)
//! - SHA-256 certificate fingerprint pinning
//! - no verification (development only)

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Error type for TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
}

/// Result type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Parses PEM-encoded certificates.
fn parse_cert_pem(pem: &str) -> TlsResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate(
            "no certificates found in PEM".to_string(),
        ));
    }
    Ok(certs)
}

/// Computes the SHA-256 fingerprint of a DER-encoded certificate.
///
/// Returns the fingerprint in colon-separated lowercase hex format.
pub fn compute_fingerprint(cert_der: &[u8]) -> String {
    format_fingerprint(&Sha256::digest(cert_der).into())
}

/// Parses a fingerprint string in either colon-separated or continuous hex format.
///
/// Both formats are accepted (case-insensitive):
/// - Colon-separated: `aa:bb:cc:dd:...` (95 characters for 32 bytes)
/// - Continuous hex: `aabbccdd...` (64 characters)
pub fn parse_fingerprint(s: &str) -> TlsResult<[u8; 32]> {
    let s = s.trim();

    let hex_str = if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 32 || parts.iter().any(|p| p.len() != 2) {
            return Err(TlsError::InvalidFingerprint(format!(
                "expected 32 colon-separated hex bytes, got '{}'",
                s
            )));
        }
        parts.concat()
    } else {
        if s.len() != 64 {
            return Err(TlsError::InvalidFingerprint(format!(
                "continuous hex fingerprint must be 64 characters, got {}",
                s.len()
            )));
        }
        s.to_string()
    };

    let mut result = [0u8; 32];
    for (i, chunk) in hex_str.as_bytes().chunks(2).enumerate() {
        let hex_pair = std::str::from_utf8(chunk)
            .map_err(|_| TlsError::InvalidFingerprint("invalid UTF-8 in fingerprint".to_string()))?;
        result[i] = u8::from_str_radix(hex_pair, 16).map_err(|_| {
            TlsError::InvalidFingerprint(format!("invalid hex character in fingerprint: {}", hex_pair))
        })?;
    }

    Ok(result)
}

/// Formats a fingerprint as colon-separated lowercase hex.
pub fn format_fingerprint(bytes: &[u8; 32]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn with_alpn(mut config: ClientConfig, alpn: &str) -> ClientConfig {
    config.alpn_protocols = vec![alpn.as_bytes().to_vec()];
    config
}

/// Builds a client TLS configuration using CA certificate validation.
pub fn build_client_config_ca(ca_path: Option<&Path>, alpn: &str) -> TlsResult<ClientConfig> {
    let mut store = RootCertStore::empty();
    match ca_path {
        Some(path) => {
            for cert in parse_cert_pem(&fs::read_to_string(path)?)? {
                store
                    .add(cert)
                    .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let config = ClientConfig::builder()
        .with_root_certificates(store)
        .with_no_client_auth();
    Ok(with_alpn(config, alpn))
}

/// Builds a client TLS configuration using fingerprint verification.
pub fn build_client_config_fingerprint(
    fingerprint: &[u8; 32],
    alpn: &str,
) -> TlsResult<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedVerifier {
            expected: Some(*fingerprint),
        }))
        .with_no_client_auth();
    Ok(with_alpn(config, alpn))
}

/// Builds a client TLS configuration with no certificate verification (insecure, for development).
pub fn build_client_config_insecure(alpn: &str) -> TlsResult<ClientConfig> {
    tracing::warn!(
        "TLS certificate verification is disabled. This is insecure and should only be used for development."
    );
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedVerifier { expected: None }))
        .with_no_client_auth();
    Ok(with_alpn(config, alpn))
}

/// Verifier that pins the end-entity certificate's SHA-256 fingerprint.
///
/// With no expected fingerprint every certificate is accepted. Handshake
/// signatures are always checked.
#[derive(Debug)]
struct PinnedVerifier {
    expected: Option<[u8; 32]>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let Some(expected) = self.expected else {
            return Ok(ServerCertVerified::assertion());
        };

        let hash: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
        if hash == expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {}, got {}",
                format_fingerprint(&expected),
                format_fingerprint(&hash)
            )))
        }
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
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
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
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;
    use tempfile::tempdir;

    static INIT: Once = Once::new();

    fn init_crypto() {
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    #[test]
    fn test_compute_fingerprint() {
        let fingerprint = compute_fingerprint(b"test certificate data");
        assert_eq!(fingerprint.len(), 95);
        assert_eq!(fingerprint.matches(':').count(), 31);
        assert_eq!(fingerprint, compute_fingerprint(b"test certificate data"));
    }

    #[test]
    fn test_parse_fingerprint_both_formats() {
        let colon = "aa:bb:cc:dd:ee:ff:00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff:00:11:22:33:44:55:66:77:88:99";
        let hex = "AABBCCDDEEFF00112233445566778899aabbccddeeff00112233445566778899";
        let a = parse_fingerprint(colon).unwrap();
        let b = parse_fingerprint(hex).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], 0xaa);
        assert_eq!(a[31], 0x99);
        assert_eq!(format_fingerprint(&a), colon);
    }

    #[test]
    fn test_parse_fingerprint_invalid() {
        assert!(parse_fingerprint("aabbcc").is_err());
        assert!(parse_fingerprint("aa:bb:cc").is_err());
        assert!(parse_fingerprint(
            "gghhiijjkkllmmnnoopp00112233445566778899aabbccddeeff00112233445566"
        )
        .is_err());
    }

    #[test]
    fn test_build_client_configs_set_alpn() {
        init_crypto();
        let expected = vec![b"hytun/1".to_vec()];
        assert_eq!(build_client_config_ca(None, "hytun/1").unwrap().alpn_protocols, expected);
        assert_eq!(
            build_client_config_fingerprint(&[0; 32], "hytun/1").unwrap().alpn_protocols,
            expected
        );
        assert_eq!(build_client_config_insecure("hytun/1").unwrap().alpn_protocols, expected);
    }

    #[test]
    fn test_build_client_config_custom_ca() {
        init_crypto();
        let dir = tempdir().unwrap();
        let ca_path = dir.path().join("ca.pem");
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        fs::write(&ca_path, cert.cert.pem()).unwrap();

        assert!(build_client_config_ca(Some(&ca_path), "hytun/1").is_ok());
    }

    #[test]
    fn test_build_client_config_ca_rejects_empty_file() {
        init_crypto();
        let dir = tempdir().unwrap();
        let ca_path = dir.path().join("empty.pem");
        fs::write(&ca_path, "").unwrap();

        assert!(matches!(
            build_client_config_ca(Some(&ca_path), "hytun/1"),
            Err(TlsError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_pinned_verifier_rejects_mismatch() {
        init_crypto();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = cert.cert.der().clone();
        let good: [u8; 32] = Sha256::digest(der.as_ref()).into();
        let name = ServerName::try_from("localhost").unwrap();

        let verifier = PinnedVerifier { expected: Some(good) };
        assert!(verifier
            .verify_server_cert(&der, &[], &name, &[], UnixTime::now())
            .is_ok());

        let verifier = PinnedVerifier { expected: Some([0; 32]) };
        assert!(verifier
            .verify_server_cert(&der, &[], &name, &[], UnixTime::now())
            .is_err());

        let verifier = PinnedVerifier { expected: None };
        assert!(verifier
            .verify_server_cert(&der, &[], &name, &[], UnixTime::now())
            .is_ok());
    }
}

//! Certificate minting and TLS configuration for the intercepting proxy.
//!
//! The proxy terminates client TLS with per-host leaf certificates signed by
//! an operator-supplied CA, and dials upstream servers with certificate
//! verification disabled so interception works against any origin.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

mod counter_rand;
mod signer;

pub use counter_rand::CounterEncryptorRand;
pub use signer::{CertSigner, SignError};

/// Cipher suites offered to intercepted clients, in preference order. The
/// server side speaks TLS 1.2 only.
static TLS12_CIPHER_SUITES: &[rustls::SupportedCipherSuite] = &[
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

pub(crate) fn tls12_server_provider() -> Arc<CryptoProvider> {
    Arc::new(CryptoProvider {
        cipher_suites: TLS12_CIPHER_SUITES.to_vec(),
        ..ring::default_provider()
    })
}

/// Client config for dialing upstream origins. With `insecure_skip_verify`
/// the upstream certificate is accepted unconditionally, which is the normal
/// interception mode; without it the webpki root store applies.
pub fn build_upstream_client_config(
    insecure_skip_verify: bool,
) -> Result<Arc<ClientConfig>, SignError> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(SignError::ConfigBuild)?;

    let mut config = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::build_upstream_client_config;

    #[test]
    fn upstream_client_configs_build_in_both_modes() {
        let insecure = build_upstream_client_config(true).expect("insecure config");
        assert_eq!(insecure.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let secure = build_upstream_client_config(false).expect("secure config");
        assert_eq!(secure.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}

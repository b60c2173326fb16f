use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use thiserror::Error;

use crate::counter_rand::CounterEncryptorRand;
use crate::tls12_server_provider;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("CA private key is not an RSA key; leaf determinism requires an RSA signing CA")]
    UnsupportedKeyType,
    #[error("invalid CA material: {0}")]
    InvalidCaMaterial(String),
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("certificate cache lock poisoned")]
    LockPoisoned,
}

/// PKCS#8 v1 header for an Ed25519 private key; the 32-byte seed follows.
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];

// Fixed validity window so a re-minted certificate is byte-identical.
const NOT_BEFORE: (i32, u8, u8) = (2019, 6, 25);
const NOT_AFTER: (i32, u8, u8) = (2049, 6, 25);

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

/// Mints per-host leaf certificates signed by a caller-supplied RSA CA.
///
/// All randomness in a leaf comes from a [`CounterEncryptorRand`] keyed by
/// the CA private key and seeded with the host name, and the RSA PKCS#1 v1.5
/// signature is itself deterministic, so minting the same host twice yields
/// byte-identical certificate DER. Clients that pin or cache the proxy's
/// certificates keep working across restarts.
pub struct CertSigner {
    ca: CaMaterial,
    cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertSigner {
    pub fn from_pem_files(ca_cert_path: &str, ca_key_path: &str) -> Result<Self, SignError> {
        let cert_pem = fs::read_to_string(ca_cert_path)?;
        let key_pem = fs::read_to_string(ca_key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, SignError> {
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|error| SignError::InvalidCaMaterial(format!("CA certificate: {error}")))?;
        let ca_key = KeyPair::from_pem(key_pem)?;
        if !ca_key.is_compatible(&rcgen::PKCS_RSA_SHA256) {
            return Err(SignError::UnsupportedKeyType);
        }
        let key_der = ca_key.serialize_der();
        let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key)
            .map_err(|error| SignError::InvalidCaMaterial(format!("CA issuer: {error}")))?;

        Ok(Self {
            ca: CaMaterial {
                issuer,
                cert_pem: cert_pem.to_string(),
                cert_der,
                key_der,
            },
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca.cert_pem
    }

    /// Returns a cached or freshly built TLS server config presenting the
    /// leaf for `host`.
    pub fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>, SignError> {
        let host = normalize_host(host);
        {
            let cache = self.cache.lock().map_err(|_| SignError::LockPoisoned)?;
            if let Some(config) = cache.get(&host) {
                return Ok(Arc::clone(config));
            }
        }

        let (leaf_der, leaf_key_der) = self.mint_leaf(&host)?;
        let chain = vec![leaf_der, self.ca.cert_der.clone()];
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key_der));

        let mut config = ServerConfig::builder_with_provider(tls12_server_provider())
            .with_protocol_versions(&[&rustls::version::TLS12])?
            .with_no_client_auth()
            .with_single_cert(chain, private_key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let config = Arc::new(config);

        let mut cache = self.cache.lock().map_err(|_| SignError::LockPoisoned)?;
        Ok(Arc::clone(
            cache.entry(host).or_insert_with(|| Arc::clone(&config)),
        ))
    }

    /// Builds the leaf certificate and its PKCS#8 private key for `host`.
    pub fn mint_leaf(&self, host: &str) -> Result<(CertificateDer<'static>, Vec<u8>), SignError> {
        let mut rng = CounterEncryptorRand::new(&self.ca.key_der, host.as_bytes());

        let mut key_der = ED25519_PKCS8_PREFIX.to_vec();
        key_der.extend_from_slice(&rng.next_bytes::<32>());
        let leaf_key = KeyPair::from_pkcs8_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(key_der.as_slice()),
            &rcgen::PKCS_ED25519,
        )?;

        let mut serial = rng.next_bytes::<16>();
        serial[0] &= 0x7f;
        if serial.iter().all(|byte| *byte == 0) {
            serial[15] = 1;
        }

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::NoCa;
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));
        params.not_before = date_time(NOT_BEFORE);
        params.not_after = date_time(NOT_AFTER);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host.to_string());
        params.distinguished_name = distinguished_name;

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(host.try_into()?));
        }

        let leaf_cert = params.signed_by(&leaf_key, &self.ca.issuer)?;
        Ok((leaf_cert.der().clone(), key_der))
    }
}

fn date_time((year, month, day): (i32, u8, u8)) -> time::OffsetDateTime {
    rcgen::date_time_ymd(year, month, day)
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

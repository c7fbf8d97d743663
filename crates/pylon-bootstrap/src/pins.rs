//! Public-key pinning
//!
//! The bootstrap client has no CA to trust yet, so the gateway's TLS
//! certificate is validated against precomputed SPKI fingerprints instead.
//! [`PinnedCertVerifier`] plugs into rustls and accepts a handshake when any
//! certificate in the presented chain hashes to a configured pin; it also
//! captures the leaf certificate so the caller can extract the gateway's
//! signing key for JWS verification afterwards.

use std::sync::{Arc, Mutex};

use aws_lc_rs::digest::{digest, SHA256};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use thiserror::Error;
use x509_parser::prelude::*;

#[derive(Debug, Error)]
pub enum PinError {
    #[error("failed to parse certificate: {0}")]
    ParseError(String),

    #[error("invalid pin encoding: {0}")]
    InvalidEncoding(String),

    #[error("certificate does not carry an Ed25519 public key")]
    NotEd25519,
}

/// A SHA-256 fingerprint of a certificate's SubjectPublicKeyInfo
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKeyPin {
    fingerprint: [u8; 32],
}

impl PublicKeyPin {
    /// Compute the pin of a DER-encoded certificate
    pub fn from_der_cert(der: &[u8]) -> Result<Self, PinError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PinError::ParseError(e.to_string()))?;
        let spki = cert.tbs_certificate.subject_pki.raw;
        let hash = digest(&SHA256, spki);
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(hash.as_ref());
        Ok(Self { fingerprint })
    }

    /// Build a pin from raw fingerprint bytes (e.g. out of a keyring)
    pub fn from_raw(raw: &[u8]) -> Result<Self, PinError> {
        let fingerprint: [u8; 32] = raw
            .try_into()
            .map_err(|_| PinError::InvalidEncoding("pin must be 32 bytes".into()))?;
        Ok(Self { fingerprint })
    }

    /// Decode a pin from its base64 form
    pub fn from_b64(encoded: &str) -> Result<Self, PinError> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| PinError::InvalidEncoding(e.to_string()))?;
        let fingerprint: [u8; 32] = raw
            .try_into()
            .map_err(|_| PinError::InvalidEncoding("pin must be 32 bytes".into()))?;
        Ok(Self { fingerprint })
    }

    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.fingerprint)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.fingerprint
    }
}

impl std::fmt::Debug for PublicKeyPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKeyPin({})", self.to_b64())
    }
}

/// Extract the raw Ed25519 public key from a DER-encoded certificate
pub fn extract_ed25519_public_key(der: &[u8]) -> Result<Vec<u8>, PinError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| PinError::ParseError(e.to_string()))?;
    let key = cert.tbs_certificate.subject_pki.subject_public_key.data.as_ref();
    if key.len() != 32 {
        return Err(PinError::NotEd25519);
    }
    Ok(key.to_vec())
}

/// rustls certificate verifier that trusts pinned public keys only
///
/// Chain validation is replaced entirely: a handshake is accepted when any
/// presented certificate's SPKI hash matches one of the pins. The leaf
/// certificate of the last accepted handshake is retained for key
/// extraction.
pub struct PinnedCertVerifier {
    pins: Vec<PublicKeyPin>,
    provider: CryptoProvider,
    seen_leaf: Mutex<Option<Vec<u8>>>,
}

impl PinnedCertVerifier {
    pub fn new(pins: Vec<PublicKeyPin>) -> Self {
        Self {
            pins,
            provider: rustls::crypto::aws_lc_rs::default_provider(),
            seen_leaf: Mutex::new(None),
        }
    }

    /// The DER leaf certificate from the most recent accepted handshake
    pub fn seen_leaf(&self) -> Option<Vec<u8>> {
        self.seen_leaf.lock().expect("lock poisoned").clone()
    }
}

/// Build a rustls client config that trusts the given verifier
///
/// The provider is pinned to aws-lc-rs explicitly; relying on the process
/// default would be ambiguous when another dependency enables a second
/// rustls provider.
pub fn pinned_tls_config(verifier: Arc<PinnedCertVerifier>) -> rustls::ClientConfig {
    rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("aws-lc-rs supports the default protocol versions")
    .dangerous()
    .with_custom_certificate_verifier(verifier)
    .with_no_client_auth()
}

impl std::fmt::Debug for PinnedCertVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedCertVerifier")
            .field("pins", &self.pins)
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        for cert in std::iter::once(end_entity).chain(intermediates.iter()) {
            if let Ok(pin) = PublicKeyPin::from_der_cert(cert.as_ref()) {
                if self.pins.contains(&pin) {
                    *self.seen_leaf.lock().expect("lock poisoned") =
                        Some(end_entity.as_ref().to_vec());
                    return Ok(ServerCertVerified::assertion());
                }
            }
        }
        Err(rustls::Error::General(
            "server certificate chain does not match any pinned public key".into(),
        ))
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

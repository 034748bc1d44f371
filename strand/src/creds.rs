//! TLS credentials.
//!
//! [`Credentials`] is a tagged variant covering the two supported
//! identity shapes: an X.509 certificate chain with its private key, and
//! a raw Ed25519 seed from which a self-signed certificate is generated.
//! Chain validation policy is deliberately thin: the certificate variant
//! verifies against explicit trust roots, while the Ed25519 variant is
//! meant for pinned/raw-key deployments and accepts the peer's
//! self-signed certificate, leaving identity checks to the application.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::error::Error;

/// PKCS#8 v1 wrapper for a raw Ed25519 seed (RFC 8410).
const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Variant {
    Certificate,
    Ed25519,
}

/// Endpoint identity used for both directions of the handshake.
pub struct Credentials {
    variant: Variant,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    /// Peer certificates trusted when connecting (certificate variant).
    trusted: Vec<CertificateDer<'static>>,
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            variant: self.variant,
            chain: self.chain.clone(),
            key: self.key.clone_key(),
            trusted: self.trusted.clone(),
        }
    }
}

impl Credentials {
    /// Certificate-backed credentials: a DER chain, its private key, and
    /// the peer certificates to trust on outbound connections.
    pub fn from_cert(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        trusted: Vec<CertificateDer<'static>>,
    ) -> Result<Self, Error> {
        if chain.is_empty() {
            return Err(Error::Tls("empty certificate chain".into()));
        }
        Ok(Self {
            variant: Variant::Certificate,
            chain,
            key,
            trusted,
        })
    }

    /// Raw-key credentials: a self-signed certificate is generated from
    /// the 32-byte Ed25519 seed.
    pub fn ed25519(seed: &[u8; 32]) -> Result<Self, Error> {
        let mut pkcs8 = Vec::with_capacity(48);
        pkcs8.extend_from_slice(&PKCS8_ED25519_PREFIX);
        pkcs8.extend_from_slice(seed);

        let key_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
        let key_pair = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &rcgen::PKCS_ED25519)
            .map_err(|e| Error::Tls(format!("ed25519 key: {e}")))?;
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .map_err(|e| Error::Tls(format!("certificate params: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Tls(format!("self-sign: {e}")))?;

        Ok(Self {
            variant: Variant::Ed25519,
            chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8)),
            trusted: Vec::new(),
        })
    }

    /// Raw-key credentials from a freshly generated random seed.
    pub fn ed25519_random() -> Result<Self, Error> {
        let mut seed = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut seed);
        Self::ed25519(&seed)
    }

    /// The local certificate presented to peers (self-signed in the
    /// Ed25519 variant). Useful for pinning in tests and applications.
    pub fn local_cert(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    /// Build the engine server config with the given ALPNs.
    pub(crate) fn server_config(
        &self,
        alpns: &[Vec<u8>],
    ) -> Result<quinn_proto::ServerConfig, Error> {
        let mut tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| Error::Tls(e.to_string()))?;
        tls.alpn_protocols = alpns.to_vec();

        let crypto = quinn_proto::crypto::rustls::QuicServerConfig::try_from(tls)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(quinn_proto::ServerConfig::with_crypto(Arc::new(crypto)))
    }

    /// Build the engine client config with the given ALPNs.
    pub(crate) fn client_config(&self, alpns: &[Vec<u8>]) -> Result<quinn_proto::ClientConfig, Error> {
        let builder = rustls::ClientConfig::builder();
        let mut tls = match self.variant {
            Variant::Certificate => {
                let mut roots = rustls::RootCertStore::empty();
                for cert in &self.trusted {
                    roots
                        .add(cert.clone())
                        .map_err(|e| Error::Tls(e.to_string()))?;
                }
                builder
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            Variant::Ed25519 => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SelfSignedVerifier::new()))
                .with_no_client_auth(),
        };
        tls.alpn_protocols = alpns.to_vec();

        let crypto = quinn_proto::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(quinn_proto::ClientConfig::new(Arc::new(crypto)))
    }
}

/// Verifier for the raw-key variant: signatures are checked, chain
/// validation is not (the presented certificate is self-signed).
#[derive(Debug)]
struct SelfSignedVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl SelfSignedVerifier {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for SelfSignedVerifier {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_deterministic_cert_key() {
        let a = Credentials::ed25519(&[1u8; 32]).unwrap();
        let b = Credentials::ed25519(&[1u8; 32]).unwrap();
        // Same seed yields the same key; certificates may differ in
        // serial/validity but both must exist.
        assert_eq!(a.key.secret_der(), b.key.secret_der());
        assert!(!a.local_cert().as_ref().is_empty());
    }

    #[test]
    fn test_from_cert_rejects_empty_chain() {
        let creds = Credentials::ed25519_random().unwrap();
        let key = creds.key.clone_key();
        assert!(Credentials::from_cert(Vec::new(), key, Vec::new()).is_err());
    }
}

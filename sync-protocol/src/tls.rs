//! Certificate fingerprinting and the TOFU trust abstraction shared by the
//! primary's client-cert verifier and the agent's server-cert verifier.
//!
//! Neither side validates a certificate chain against a CA — pairing is a
//! fingerprint decision made at the application layer, not a PKI decision.
//! The source pattern this replaces is a callback variable set at wiring
//! time; here the verifier is handed a `FingerprintTrust` implementation
//! through its constructor instead.

use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};

pub fn sha256_fingerprint_hex(der: &CertificateDer<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der.as_ref());
    hex::encode(hasher.finalize())
}

/// Injected trust decision for a peer certificate fingerprint. The primary
/// implements this against the node table (pairing); the agent implements
/// it against `state.json`'s `server.fp` field plus any CLI override.
pub trait FingerprintTrust: std::fmt::Debug + Send + Sync {
    /// `true` if `fingerprint` is an acceptable peer identity. Implementations
    /// that TOFU-pin are expected to accept-and-remember on first contact.
    fn accept(&self, fingerprint: &str) -> bool;
}

pub mod server {
    //! Server-side (primary) client certificate verifier: accepts any
    //! client certificate during the TLS handshake. The pairing decision
    //! (TOFU / fingerprint match) happens afterward in the `hello` handler,
    //! once the node id in the application message is known — the
    //! certificate itself carries no identity binding until then.

    use rustls::client::danger::HandshakeSignatureValid;
    use rustls::pki_types::{CertificateDer, UnixTime};
    use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
    use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct AcceptAnyClientCert {
        provider: Arc<rustls::crypto::CryptoProvider>,
    }

    impl AcceptAnyClientCert {
        pub fn new(provider: Arc<rustls::crypto::CryptoProvider>) -> Arc<Self> {
            Arc::new(Self { provider })
        }
    }

    impl ClientCertVerifier for AcceptAnyClientCert {
        fn offer_client_auth(&self) -> bool {
            true
        }

        fn client_auth_mandatory(&self) -> bool {
            true
        }

        fn root_hint_subjects(&self) -> &[DistinguishedName] {
            &[]
        }

        fn verify_client_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _now: UnixTime,
        ) -> Result<ClientCertVerified, rustls::Error> {
            Ok(ClientCertVerified::assertion())
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
}

pub mod client {
    //! Client-side (agent) server certificate verifier: TOFU-pins the
    //! primary's certificate fingerprint via an injected `FingerprintTrust`.

    use super::{sha256_fingerprint_hex, FingerprintTrust};
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct PinnedServerCert {
        trust: Arc<dyn FingerprintTrust>,
        provider: Arc<rustls::crypto::CryptoProvider>,
    }

    impl PinnedServerCert {
        pub fn new(trust: Arc<dyn FingerprintTrust>, provider: Arc<rustls::crypto::CryptoProvider>) -> Arc<Self> {
            Arc::new(Self { trust, provider })
        }
    }

    impl ServerCertVerifier for PinnedServerCert {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            let fingerprint = sha256_fingerprint_hex(end_entity);
            if self.trust.accept(&fingerprint) {
                Ok(ServerCertVerified::assertion())
            } else {
                Err(rustls::Error::General(
                    "server certificate fingerprint mismatch".into(),
                ))
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_lowercase_hex_sha256() {
        let der = CertificateDer::from(vec![1u8, 2, 3, 4]);
        let fp = sha256_fingerprint_hex(&der);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }
}

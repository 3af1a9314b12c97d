//! TLS client configuration and trust policies.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::NegotiationFailure;

/// ALPN identifier of HTTP/2 over TLS.
pub const ALPN_H2: &[u8] = b"h2";

/// ALPN identifier of HTTP/1.1, offered as the fallback.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Which server certificates the client accepts.
#[derive(Debug, Clone, Default)]
pub enum TrustPolicy {
    /// Mozilla's root program, as bundled by `webpki-roots`.
    #[default]
    WebPkiRoots,
    /// Trust anchors read from a PEM bundle.
    PemFile(PathBuf),
    /// Trust exactly these certificates as anchors.
    Certificates(Vec<CertificateDer<'static>>),
    /// Skip chain and name verification. Only for harness runs against
    /// throwaway test servers; handshake signatures are still checked.
    AcceptAny,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a client config that offers `h2` first and `http/1.1` as fallback.
pub fn client_config(trust: &TrustPolicy) -> Result<ClientConfig, NegotiationFailure> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let mut config = match trust {
        TrustPolicy::AcceptAny => {
            tracing::warn!("TLS certificate verification disabled for this session");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                    algorithms: provider.signature_verification_algorithms,
                }))
                .with_no_client_auth()
        }
        policy => builder
            .with_root_certificates(root_store(policy)?)
            .with_no_client_auth(),
    };

    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
    Ok(config)
}

fn root_store(trust: &TrustPolicy) -> Result<RootCertStore, NegotiationFailure> {
    let mut roots = RootCertStore::empty();
    match trust {
        TrustPolicy::WebPkiRoots => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        TrustPolicy::PemFile(path) => {
            let file = File::open(path).map_err(NegotiationFailure::TrustStore)?;
            for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
                roots.add(cert.map_err(NegotiationFailure::TrustStore)?)?;
            }
        }
        TrustPolicy::Certificates(certs) => {
            for cert in certs {
                roots.add(cert.clone())?;
            }
        }
        TrustPolicy::AcceptAny => {}
    }
    tracing::debug!(anchors = roots.len(), "built TLS root store");
    Ok(roots)
}

/// Resolve the name sent in SNI and checked against the certificate.
pub(crate) fn server_name(name: &str) -> Result<ServerName<'static>, NegotiationFailure> {
    ServerName::try_from(name.to_owned())
        .map_err(|_| NegotiationFailure::InvalidServerName(name.to_owned()))
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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

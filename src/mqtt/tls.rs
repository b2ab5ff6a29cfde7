#![forbid(unsafe_code)]

// Client TLS configuration shared by both protocol stacks. With a CA file
// the broker certificate is verified against it; without one, verification
// is disabled entirely; load rigs routinely point at brokers fronted by
// self-signed test certificates.

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read CA certificate {path}: {source}")]
    ReadCa {
        path: String,
        source: std::io::Error,
    },
    #[error("no usable certificates in {0}")]
    EmptyCa(String),
    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// Build the shared client TLS configuration.
pub fn client_config(ca_cert_path: Option<&str>) -> Result<Arc<ClientConfig>, TlsError> {
    let config = match ca_cert_path {
        Some(path) => {
            let file = File::open(path).map_err(|source| TlsError::ReadCa {
                path: path.to_string(),
                source,
            })?;
            let mut reader = BufReader::new(file);
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|source| TlsError::ReadCa {
                    path: path.to_string(),
                    source,
                })?;
                if let Err(err) = roots.add(cert) {
                    warn!(path, %err, "skipping unusable CA certificate");
                }
            }
            if roots.is_empty() {
                return Err(TlsError::EmptyCa(path.to_string()));
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        None => {
            warn!("TLS enabled without CA_CERT_PATH; certificate verification is disabled");
            let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
            ClientConfig::builder_with_provider(provider.clone())
                .with_safe_default_protocol_versions()?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
                .with_no_client_auth()
        }
    };
    Ok(Arc::new(config))
}

/// Verifier that accepts any server certificate but still checks handshake
/// signatures with the provider's algorithms.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
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

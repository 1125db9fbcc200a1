//! TLS configuration for relay and direct-path connections.
//!
//! TLS 1.3 only, everywhere. Direct paths replace CA validation with
//! pinned-fingerprint validation on both sides of the mutual handshake;
//! relay connections validate against a configured CA bundle, or skip
//! verification when the operator pins at a higher layer.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};

use crate::cert::{DirectCert, PinStore};
use crate::error::DirectPathError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err<E: std::fmt::Display>(e: E) -> DirectPathError {
    DirectPathError::Tls(e.to_string())
}

/// Server-certificate verifier that accepts exactly the pinned fingerprint.
#[derive(Debug)]
struct PinnedServerVerifier {
    pins: PinStore,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.pins.matches(end_entity.as_ref()) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "peer certificate does not match pinned fingerprint".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 is not supported".into()))
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

/// Client-certificate verifier for the direct-path listener: mutual TLS
/// with the pinned peer certificate.
#[derive(Debug)]
struct PinnedClientVerifier {
    pins: PinStore,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if self.pins.matches(end_entity.as_ref()) {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "client certificate does not match pinned fingerprint".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 is not supported".into()))
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

/// Verifier that accepts any server certificate (operator opted out of CA
/// validation; authentication happens in the PQ handshake above).
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 is not supported".into()))
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

/// Client config for dialing a direct path: pinned peer validation plus our
/// own ephemeral certificate for the mutual handshake.
///
/// # Errors
///
/// [`DirectPathError::Tls`] on configuration failure.
pub fn pinned_client_config(
    pins: PinStore,
    local: &DirectCert,
) -> Result<rustls::ClientConfig, DirectPathError> {
    let provider = provider();
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier { pins, provider }))
        .with_client_auth_cert(
            vec![CertificateDer::from(local.cert_der.clone())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(local.key_der.clone())),
        )
        .map_err(tls_err)?;

    Ok(config)
}

/// Server config for the direct-path listener: presents our ephemeral
/// certificate and requires the pinned peer certificate.
///
/// # Errors
///
/// [`DirectPathError::Tls`] on configuration failure.
pub fn pinned_server_config(
    pins: PinStore,
    local: &DirectCert,
) -> Result<rustls::ServerConfig, DirectPathError> {
    let provider = provider();
    let config = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .with_client_cert_verifier(Arc::new(PinnedClientVerifier { pins, provider }))
        .with_single_cert(
            vec![CertificateDer::from(local.cert_der.clone())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(local.key_der.clone())),
        )
        .map_err(tls_err)?;

    Ok(config)
}

/// Client config that skips certificate verification (`tls_skip_verify`).
///
/// # Errors
///
/// [`DirectPathError::Tls`] on configuration failure.
pub fn insecure_client_config() -> Result<rustls::ClientConfig, DirectPathError> {
    let provider = provider();
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        .with_no_client_auth();

    Ok(config)
}

/// Client config validating the server against a PEM CA bundle.
///
/// # Errors
///
/// [`DirectPathError::Tls`] if the bundle cannot be read or parsed.
pub fn ca_client_config(ca_file: &Path) -> Result<rustls::ClientConfig, DirectPathError> {
    let mut roots = rustls::RootCertStore::empty();
    let mut reader = BufReader::new(File::open(ca_file).map_err(tls_err)?);
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.map_err(tls_err)?).map_err(tls_err)?;
    }

    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(config)
}

/// Server config from PEM certificate and key files (relay server and the
/// static-TLS p2p listener mode).
///
/// # Errors
///
/// [`DirectPathError::Tls`] if the files cannot be read or parsed.
pub fn server_config_from_pem(
    cert_file: &Path,
    key_file: &Path,
) -> Result<rustls::ServerConfig, DirectPathError> {
    let mut cert_reader = BufReader::new(File::open(cert_file).map_err(tls_err)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(tls_err)?;

    let mut key_reader = BufReader::new(File::open(key_file).map_err(tls_err)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(tls_err)?
        .ok_or_else(|| DirectPathError::Tls("no private key in file".into()))?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_err)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_pinned_configs_build() {
        let identity = Identity::generate();
        let cert = DirectCert::generate(&identity).unwrap();

        let pins = PinStore::new();
        pins.pin(cert.fingerprint);

        assert!(pinned_client_config(pins.clone(), &cert).is_ok());
        assert!(pinned_server_config(pins, &cert).is_ok());
    }

    #[test]
    fn test_insecure_config_builds() {
        assert!(insecure_client_config().is_ok());
    }
}

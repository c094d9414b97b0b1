//! TLS layer: rustls client configuration and handshakes.
//!
//! SNI is always the NDT hostname, never the SOCKS proxy. Peer verification
//! uses the configured CA bundle when given, the built-in webpki roots
//! otherwise, and can be disabled entirely for testing.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{ErrKind, Error, Result};
use crate::settings::Settings;

/// A configured TLS dialer, built once per run.
pub(crate) struct TlsClient {
    connector: TlsConnector,
}

impl TlsClient {
    /// Build the rustls configuration selected by the settings.
    pub(crate) fn from_settings(settings: &Settings) -> Result<TlsClient> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::with_cause(ErrKind::SslGeneric, e.to_string()))?;
        let config = if settings.tls_verify_peer {
            let root_store = match &settings.ca_bundle_path {
                Some(path) => load_ca_bundle(path)?,
                None => RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            };
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerify { provider }))
                .with_no_client_auth()
        };
        Ok(TlsClient {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Handshake over an established TCP connection, with SNI = `hostname`.
    pub(crate) async fn handshake(
        &self,
        hostname: &str,
        tcp: TcpStream,
        timeout: Duration,
    ) -> Result<TlsStream<TcpStream>> {
        let name = ServerName::try_from(hostname.to_owned())
            .map_err(|_| Error::with_cause(ErrKind::InvalidArgument, "invalid SNI hostname"))?;
        match tokio::time::timeout(timeout, self.connector.connect(name, tcp)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(map_handshake_error(err)),
            Err(_) => Err(Error::new(ErrKind::TimedOut)),
        }
    }
}

/// rustls protocol failures become `ssl_generic`; everything else is a
/// syscall failure under TLS and keeps its errno-derived kind.
fn map_handshake_error(err: std::io::Error) -> Error {
    let is_tls = err
        .get_ref()
        .is_some_and(|inner| inner.is::<rustls::Error>());
    if is_tls {
        Error::with_cause(ErrKind::SslGeneric, err.to_string())
    } else {
        err.into()
    }
}

fn load_ca_bundle(path: &std::path::Path) -> Result<RootCertStore> {
    let file = File::open(path).map_err(|e| {
        Error::with_cause(ErrKind::SslGeneric, format!("cannot open CA bundle: {e}"))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| {
            Error::with_cause(ErrKind::SslGeneric, format!("cannot parse CA bundle: {e}"))
        })?;
    let mut store = RootCertStore::empty();
    let (added, _ignored) = store.add_parsable_certificates(certs);
    if added == 0 {
        return Err(Error::with_cause(
            ErrKind::SslGeneric,
            "CA bundle contains no usable certificates",
        ));
    }
    Ok(store)
}

/// Verifier used when `tls_verify_peer` is disabled: accepts any chain and
/// hostname while still checking signature schemes are well-formed sizes.
#[derive(Debug)]
struct NoVerify {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

//! rustls configuration shared by the client-facing acceptor and the origin connector
use crate::error::{Error, Result};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;
use tokio_rustls::rustls::{
  self,
  client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
  crypto::CryptoProvider,
  ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};

/// The only protocol spoken on decrypted tunnels and origin connections
const HTTP11: &[u8] = b"http/1.1";

/// ring-backed crypto provider used for every config this crate builds
pub(crate) fn provider() -> Arc<CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// Server config presenting `cert_chain` to the intercepted client
pub(crate) fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Failed to select TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![HTTP11.to_vec()];
  Ok(config)
}

/// Client config for origin connections.
///
/// Roots come from the platform store; `accept_invalid_certs` swaps in a
/// verifier that accepts anything, which is what a debugging proxy pointed at
/// self-signed staging servers usually wants.
pub(crate) fn client_config(accept_invalid_certs: bool) -> Result<ClientConfig> {
  let builder = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Failed to select TLS versions: {}", e)))?;
  let mut config = if accept_invalid_certs {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  } else {
    builder
      .with_root_certificates(native_roots())
      .with_no_client_auth()
  };
  config.alpn_protocols = vec![HTTP11.to_vec()];
  Ok(config)
}

fn native_roots() -> RootCertStore {
  let mut roots = RootCertStore::empty();
  let native = rustls_native_certs::load_native_certs();
  for error in &native.errors {
    tracing::debug!("[tls] skipping native certificate: {}", error);
  }
  let (added, ignored) = roots.add_parsable_certificates(native.certs);
  tracing::debug!("[tls] loaded {} native roots ({} ignored)", added, ignored);
  roots
}

/// `ServerName` for an origin host, accepting IP literals
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  ServerName::try_from(host.to_string())
    .map_err(|e| Error::tls_error(format!("Invalid server name {}: {}", host, e)))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

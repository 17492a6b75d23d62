//! Error types for the proxy core

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// HTTP building error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Malformed request line, header block or CONNECT target
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// TLS handshake or configuration error
  #[error("TLS error: {0}")]
  Tls(String),

  /// Certificate generation or loading error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// A root CA already exists and must not be overwritten
  #[error("Root CA already exists at {0}")]
  RootCaExists(String),

  /// No root CA has been generated yet
  #[error("Root CA not exists")]
  RootCaMissing,

  /// The OS refused to trust the root CA
  #[error("Failed to trust Root CA: {0}")]
  TrustStore(String),

  /// Origin could not be reached or answered garbage
  #[error("{0}")]
  Upstream(String),

  /// Persistence collaborator failure
  #[error("Storage error: {0}")]
  Storage(String),

  /// Rule, group or stored data lookup failure
  #[error("{0}")]
  NotFound(String),

  /// Listening port outside the accepted range
  #[error("Invalid port {0}, expected a value between 1024 and 49152")]
  InvalidPort(u16),

  /// Test script could not be parsed or evaluated
  #[error("Script error: {0}")]
  Script(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("[ca] {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("[proxy] {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("[proxy] {}", error);
    error
  }

  /// Create an upstream error and log it
  pub fn upstream_error(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::warn!("[forward] {}", error);
    error
  }

  /// Create a storage error and log it
  pub fn storage_error(msg: impl Into<String>) -> Self {
    let error = Error::Storage(msg.into());
    tracing::error!("[storage] {}", error);
    error
  }

  /// Lookup failure, not logged: callers decide whether it matters
  pub fn not_found(msg: impl Into<String>) -> Self {
    Error::NotFound(msg.into())
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// HTTP status the error boundary answers with
  pub fn status_code(&self) -> http::StatusCode {
    match self {
      Error::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
      _ => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("IO error: {}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::Http(value);
    tracing::error!("HTTP error: {}", error);
    error
  }
}

impl From<serde_json::Error> for Error {
  fn from(value: serde_json::Error) -> Self {
    Error::storage_error(format!("invalid JSON: {}", value))
  }
}

pub(crate) fn new_io_error(kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(kind, msg))
}

//! Origin forwarding
//!
//! Every forwarded request gets its own connection to the origin (TLS when the
//! target is `https`), sent with `Connection: close` and read back fully. There
//! is no pooling.

use crate::codec::{self, BodyKind};
use crate::config::{ProxyConfig, PROXY_HEADER};
use crate::error::{new_io_error, Error, Result};
use crate::exchange::{ExchangeResponse, ForwardTarget};
use crate::tls;
use http::header::{HeaderValue, CONNECTION, HOST};
use http::{Method, Uri};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Plain or TLS origin connection
#[derive(Debug)]
pub enum MaybeTlsStream {
  Tcp(TcpStream),
  Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

/// Opens origin connections and performs single request/response round trips
#[derive(Clone)]
pub struct Forwarder {
  tls: TlsConnector,
  timeout: Duration,
  max_body_size: usize,
}

impl std::fmt::Debug for Forwarder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Forwarder")
      .field("timeout", &self.timeout)
      .field("max_body_size", &self.max_body_size)
      .finish()
  }
}

impl Forwarder {
  pub fn new(config: &ProxyConfig) -> Result<Self> {
    let client_config = tls::client_config(config.accept_invalid_upstream_certs)?;
    Ok(Self {
      tls: TlsConnector::from(Arc::new(client_config)),
      timeout: Duration::from_secs(config.upstream_timeout.max(1)),
      max_body_size: config.max_body_size,
    })
  }

  /// Connect to the origin of `uri`, wrapping in TLS for `https`/`wss`
  pub async fn open(&self, uri: &Uri) -> Result<MaybeTlsStream> {
    let (host, port, secure) = origin_of(uri)?;
    let addr = format!("{}:{}", host, port);
    let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr.as_str()))
      .await
      .map_err(|_| Error::upstream_error(format!("Connecting to {} timed out", addr)))?
      .map_err(|e| Error::upstream_error(format!("Failed to connect to {}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    if !secure {
      return Ok(MaybeTlsStream::Tcp(stream));
    }
    let domain = tls::server_name(&host)?;
    let tls_stream = tokio::time::timeout(self.timeout, self.tls.connect(domain, stream))
      .await
      .map_err(|_| Error::upstream_error(format!("TLS handshake with {} timed out", addr)))?
      .map_err(|e| Error::upstream_error(format!("TLS handshake with {} failed: {}", addr, e)))?;
    Ok(MaybeTlsStream::Tls(Box::new(tls_stream)))
  }

  /// Send `target` on a fresh connection and read the whole response
  pub async fn send(&self, target: &ForwardTarget) -> Result<ExchangeResponse> {
    let round_trip = async {
      let stream = self.open(&target.uri).await?;
      self.round_trip(stream, target).await
    };
    tokio::time::timeout(self.timeout, round_trip)
      .await
      .map_err(|_| Error::upstream_error(format!("Request to {} timed out", target.uri)))?
  }

  async fn round_trip(&self, stream: MaybeTlsStream, target: &ForwardTarget) -> Result<ExchangeResponse> {
    let mut headers = target.headers.clone();
    codec::strip_hop_by_hop(&mut headers);
    if !headers.contains_key(HOST) {
      headers.insert(HOST, host_header(&target.uri)?);
    }
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    headers.insert(PROXY_HEADER, HeaderValue::from_static("1"));
    let path = target
      .uri
      .path_and_query()
      .map(|p| p.as_str())
      .unwrap_or("/");
    let raw = codec::encode_request(&target.method, path, &headers, &target.body);

    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(&raw).await?;
    reader.get_mut().flush().await?;

    let head = loop {
      let head = codec::read_response_head(&mut reader).await?;
      // interim answers (100 Continue, 103 Early Hints) precede the real one
      if head.status.is_informational() && head.status != http::StatusCode::SWITCHING_PROTOCOLS {
        continue;
      }
      break head;
    };
    let kind = head.body_kind(&target.method);
    let body = match kind {
      BodyKind::Empty => bytes::Bytes::new(),
      kind => codec::read_body(&mut reader, kind, self.max_body_size).await?,
    };
    tracing::debug!(
      "[forward] {} {} -> {} ({} bytes)",
      target.method,
      target.uri,
      head.status,
      body.len()
    );
    let mut response_headers = head.headers;
    codec::strip_hop_by_hop(&mut response_headers);
    Ok(ExchangeResponse {
      status: head.status,
      reason: head.reason,
      headers: response_headers,
      body,
    })
  }
}

/// Host, port and whether TLS is needed for an absolute URI
pub(crate) fn origin_of(uri: &Uri) -> Result<(String, u16, bool)> {
  let host = uri
    .host()
    .ok_or_else(|| Error::invalid_request(format!("No host in {}", uri)))?
    .trim_start_matches('[')
    .trim_end_matches(']')
    .to_string();
  let secure = matches!(uri.scheme_str(), Some("https") | Some("wss"));
  let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
  Ok((host, port, secure))
}

fn host_header(uri: &Uri) -> Result<HeaderValue> {
  let authority = uri
    .authority()
    .ok_or_else(|| new_io_error(io::ErrorKind::InvalidInput, "URI without authority"))?;
  HeaderValue::from_str(authority.as_str()).map_err(|e| Error::invalid_request(e.to_string()))
}

/// True for methods whose response never has a body
pub(crate) fn is_bodyless(method: &Method, status: http::StatusCode) -> bool {
  *method == Method::HEAD
    || status.is_informational()
    || status == http::StatusCode::NO_CONTENT
    || status == http::StatusCode::NOT_MODIFIED
}

//! Per-connection handling: plain requests, CONNECT tunnels and upgrades

use crate::ca::CertificateManager;
use crate::codec::{self, RequestHead};
use crate::config::{ProxyConfig, PROXY_HEADER};
use crate::error::{Error, Result};
use crate::exchange::{ClientRequest, Exchange};
use crate::forward::{self, Forwarder};
use crate::pipeline::{Pipeline, LOOPBACK_MESSAGE};
use http::header::{HeaderValue, CONNECTION, HOST};
use http::{HeaderMap, Method, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Turns accepted sockets into exchanges for the pipeline
pub struct Dispatcher {
  certs: Arc<CertificateManager>,
  pipeline: Pipeline,
  forwarder: Forwarder,
  enable_https_interception: bool,
  idle_timeout: Duration,
  max_body_size: usize,
}

impl Dispatcher {
  pub fn new(
    config: &ProxyConfig,
    certs: Arc<CertificateManager>,
    pipeline: Pipeline,
    forwarder: Forwarder,
  ) -> Self {
    Self {
      certs,
      pipeline,
      forwarder,
      enable_https_interception: config.enable_https_interception,
      idle_timeout: Duration::from_secs(config.connection_timeout.max(1)),
      max_body_size: config.max_body_size,
    }
  }

  /// Serve one client connection until it closes
  pub async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream);
    let Some(head) = self.next_head(&mut reader).await? else {
      return Ok(());
    };
    if head.method == Method::CONNECT {
      return self.handle_connect(reader, head, peer).await;
    }
    self.serve_http(reader, Some(head), peer, "http", None).await
  }

  /// Next request head, `None` on clean close or idle timeout
  async fn next_head<S>(&self, reader: &mut BufReader<S>) -> Result<Option<RequestHead>>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    match tokio::time::timeout(self.idle_timeout, codec::read_request_head(reader)).await {
      Err(_) => {
        tracing::debug!("[proxy] closing idle connection");
        Ok(None)
      }
      Ok(Ok(head)) => Ok(head),
      Ok(Err(e)) => {
        let _ = write_plain(reader.get_mut(), StatusCode::BAD_REQUEST, &format!("Proxy Error: {}", e)).await;
        Err(e)
      }
    }
  }

  async fn handle_connect(&self, mut reader: BufReader<TcpStream>, head: RequestHead, peer: SocketAddr) -> Result<()> {
    let (host, port) = match parse_authority(&head.target) {
      Ok(target) => target,
      Err(e) => {
        write_plain(reader.get_mut(), StatusCode::BAD_REQUEST, &format!("Proxy Error: {}", e)).await?;
        return Err(e);
      }
    };
    if !self.enable_https_interception {
      return self.blind_tunnel(reader, &host, port).await;
    }
    reader.get_mut().write_all(CONNECT_ESTABLISHED).await?;
    reader.get_mut().flush().await?;

    let leaf = self.certs.issue_leaf_certificate(&host).await?;
    let acceptor = TlsAcceptor::from(leaf.server_config());
    let tls_stream = tokio::time::timeout(self.idle_timeout, acceptor.accept(reader))
      .await
      .map_err(|_| Error::tls_error(format!("TLS handshake for {} timed out", host)))?
      .map_err(|e| Error::tls_error(format!("TLS handshake for {} failed: {}", host, e)))?;
    tracing::debug!("[proxy] {} intercepting tunnel to {}:{}", peer, host, port);
    let authority = if port == 443 {
      bracket_ipv6(&host)
    } else {
      format!("{}:{}", bracket_ipv6(&host), port)
    };
    self
      .serve_http(BufReader::new(tls_stream), None, peer, "https", Some(&authority))
      .await
  }

  async fn blind_tunnel(&self, mut reader: BufReader<TcpStream>, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", bracket_ipv6(host), port);
    let mut upstream = match TcpStream::connect(addr.as_str()).await {
      Ok(stream) => stream,
      Err(e) => {
        let e = Error::upstream_error(format!("Failed to connect to {}: {}", addr, e));
        write_plain(reader.get_mut(), StatusCode::BAD_GATEWAY, &format!("Proxy Error: {}", e)).await?;
        return Err(e);
      }
    };
    reader.get_mut().write_all(CONNECT_ESTABLISHED).await?;
    reader.get_mut().flush().await?;
    tracing::debug!("[proxy] relaying tunnel to {}", addr);
    tokio::io::copy_bidirectional(&mut reader, &mut upstream).await?;
    Ok(())
  }

  /// Sequential HTTP/1.x requests on one (plain or decrypted) connection
  async fn serve_http<S>(
    &self,
    mut reader: BufReader<S>,
    mut first: Option<RequestHead>,
    peer: SocketAddr,
    scheme: &str,
    tunnel_authority: Option<&str>,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    loop {
      let head = match first.take() {
        Some(head) => head,
        None => match self.next_head(&mut reader).await? {
          Some(head) => head,
          None => return Ok(()),
        },
      };
      let uri = match absolute_uri(&head, scheme, tunnel_authority) {
        Ok(uri) => uri,
        Err(e) => {
          write_plain(reader.get_mut(), StatusCode::BAD_REQUEST, &format!("Proxy Error: {}", e)).await?;
          return Err(e);
        }
      };
      if head.is_upgrade() {
        return self.relay_upgrade(reader, head, uri).await;
      }
      let keep_alive = head.keep_alive();
      let body = match codec::read_body(&mut reader, head.body_kind(), self.max_body_size).await {
        Ok(body) => body,
        Err(e) => {
          write_plain(reader.get_mut(), StatusCode::BAD_REQUEST, &format!("Proxy Error: {}", e)).await?;
          return Err(e);
        }
      };

      let method = head.method.clone();
      let mut exchange = Exchange::new(
        peer,
        ClientRequest {
          method: head.method,
          uri,
          version: head.version,
          headers: head.headers,
          body,
        },
      )
      .with_body_limit(self.max_body_size);
      let response = tokio::select! {
        response = self.pipeline.handle(&mut exchange) => response,
        _ = client_closed(&mut reader) => {
          tracing::debug!("[proxy] {} went away, dropping {}", peer, exchange.url());
          return Ok(());
        }
      };

      let mut headers = response.headers;
      if !keep_alive {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
      }
      let raw = codec::encode_response(
        response.status,
        response.reason.as_deref(),
        &headers,
        &response.body,
        forward::is_bodyless(&method, response.status),
      );
      let writer = reader.get_mut();
      writer.write_all(&raw).await?;
      writer.flush().await?;
      if !keep_alive {
        return Ok(());
      }
    }
  }

  /// WebSocket and other upgrades: forward the handshake, then relay bytes
  async fn relay_upgrade<S>(&self, mut reader: BufReader<S>, head: RequestHead, uri: Uri) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    if head.headers.contains_key(PROXY_HEADER) {
      write_plain(reader.get_mut(), StatusCode::BAD_REQUEST, LOOPBACK_MESSAGE).await?;
      return Ok(());
    }
    let upstream = match self.forwarder.open(&uri).await {
      Ok(stream) => stream,
      Err(e) => {
        write_plain(reader.get_mut(), StatusCode::BAD_GATEWAY, &format!("Proxy Error: {}", e)).await?;
        return Err(e);
      }
    };
    let mut upstream = BufReader::new(upstream);
    let mut headers = head.headers;
    for name in ["proxy-connection", "proxy-authorization", "keep-alive"] {
      headers.remove(name);
    }
    if let Some(authority) = uri.authority() {
      if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
          headers.insert(HOST, value);
        }
      }
    }
    headers.insert(PROXY_HEADER, HeaderValue::from_static("1"));
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    upstream
      .get_mut()
      .write_all(&codec::encode_request_head(&head.method, path, &headers))
      .await?;
    upstream.get_mut().flush().await?;

    let response = codec::read_response_head(&mut upstream).await?;
    if response.status != StatusCode::SWITCHING_PROTOCOLS {
      // refused upgrade: relay the answer as a normal response and close
      let body = codec::read_body(&mut upstream, response.body_kind(&head.method), self.max_body_size).await?;
      let mut response_headers = response.headers;
      codec::strip_hop_by_hop(&mut response_headers);
      response_headers.insert(CONNECTION, HeaderValue::from_static("close"));
      let raw = codec::encode_response(
        response.status,
        response.reason.as_deref(),
        &response_headers,
        &body,
        forward::is_bodyless(&head.method, response.status),
      );
      reader.get_mut().write_all(&raw).await?;
      reader.get_mut().flush().await?;
      return Ok(());
    }
    reader.get_mut().write_all(&codec::encode_response_head(&response)).await?;
    reader.get_mut().flush().await?;
    tracing::debug!("[proxy] upgraded connection to {}", uri);
    tokio::io::copy_bidirectional(&mut reader, &mut upstream).await?;
    Ok(())
  }
}

/// Resolves once the client has closed (or broken) its side. Pipelined bytes
/// keep it pending; they are left in the buffer for the next request.
async fn client_closed<R: AsyncBufRead + Unpin>(reader: &mut R) {
  let closed = match reader.fill_buf().await {
    Ok(buf) => buf.is_empty(),
    Err(_) => true,
  };
  if !closed {
    std::future::pending::<()>().await;
  }
}

async fn write_plain<W: AsyncWrite + Unpin>(writer: &mut W, status: StatusCode, message: &str) -> Result<()> {
  let mut headers = HeaderMap::new();
  headers.insert(
    http::header::CONTENT_TYPE,
    HeaderValue::from_static("text/plain;charset=utf-8"),
  );
  headers.insert(CONNECTION, HeaderValue::from_static("close"));
  let raw = codec::encode_response(status, None, &headers, message.as_bytes(), false);
  writer.write_all(&raw).await?;
  writer.flush().await?;
  Ok(())
}

/// `host:port` of a CONNECT target; the port defaults to 443
pub(crate) fn parse_authority(target: &str) -> Result<(String, u16)> {
  let invalid = || Error::invalid_request(format!("Invalid CONNECT target: {}", target));
  if target.is_empty() || target.contains('/') {
    return Err(invalid());
  }
  if let Some(rest) = target.strip_prefix('[') {
    let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
    let port = match rest.strip_prefix(':') {
      Some(p) => p.parse().map_err(|_| invalid())?,
      None if rest.is_empty() => 443,
      None => return Err(invalid()),
    };
    return Ok((host.to_string(), port));
  }
  match target.rsplit_once(':') {
    Some((host, _)) if host.contains(':') => Err(invalid()),
    Some((host, port)) if !host.is_empty() => Ok((host.to_string(), port.parse().map_err(|_| invalid())?)),
    Some(_) => Err(invalid()),
    None => Ok((target.to_string(), 443)),
  }
}

fn bracket_ipv6(host: &str) -> String {
  if host.contains(':') {
    format!("[{}]", host)
  } else {
    host.to_string()
  }
}

/// Absolute URI of a request: absolute-form targets are used as is, origin-form
/// ones are completed from the tunnel or the `Host` header
pub(crate) fn absolute_uri(head: &RequestHead, scheme: &str, tunnel_authority: Option<&str>) -> Result<Uri> {
  let target = head.target.as_str();
  let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
  if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("ws://") || lower.starts_with("wss://") {
    return target
      .parse()
      .map_err(|e| Error::invalid_request(format!("Invalid request target {}: {}", target, e)));
  }
  if !target.starts_with('/') {
    return Err(Error::invalid_request(format!("Invalid request target {}", target)));
  }
  let host = head
    .headers
    .get(HOST)
    .and_then(|h| h.to_str().ok())
    .map(str::trim)
    .filter(|h| !h.is_empty());
  let authority = match (tunnel_authority, host) {
    (Some(_), Some(host)) => host,
    (Some(tunnel), None) => tunnel,
    (None, Some(host)) => host,
    (None, None) => {
      return Err(Error::invalid_request(
        "Origin-form request without Host header, is the client configured to use the proxy?",
      ))
    }
  };
  format!("{}://{}{}", scheme, authority, target)
    .parse()
    .map_err(|e| Error::invalid_request(format!("Invalid request target {}: {}", target, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::Version;

  fn head(target: &str, host: Option<&str>) -> RequestHead {
    let mut headers = HeaderMap::new();
    if let Some(host) = host {
      headers.insert(HOST, HeaderValue::from_str(host).unwrap());
    }
    RequestHead {
      method: Method::GET,
      target: target.to_string(),
      version: Version::HTTP_11,
      headers,
    }
  }

  #[test]
  fn connect_targets() {
    assert_eq!(parse_authority("example.com:443").unwrap(), ("example.com".to_string(), 443));
    assert_eq!(parse_authority("example.com").unwrap(), ("example.com".to_string(), 443));
    assert_eq!(parse_authority("[::1]:8443").unwrap(), ("::1".to_string(), 8443));
    assert!(parse_authority("example.com:https").is_err());
    assert!(parse_authority("http://example.com/").is_err());
    assert!(parse_authority(":443").is_err());
    assert!(parse_authority("").is_err());
  }

  #[test]
  fn request_targets() {
    let uri = absolute_uri(&head("http://a.test:8080/x?y=1", None), "http", None).unwrap();
    assert_eq!(uri.to_string(), "http://a.test:8080/x?y=1");
    let uri = absolute_uri(&head("/x", Some("a.test")), "http", None).unwrap();
    assert_eq!(uri.to_string(), "http://a.test/x");
    let uri = absolute_uri(&head("/x", None), "https", Some("secure.test:8443")).unwrap();
    assert_eq!(uri.to_string(), "https://secure.test:8443/x");
    assert!(absolute_uri(&head("/x", None), "http", None).is_err());
    assert!(absolute_uri(&head("*", Some("a.test")), "http", None).is_err());
  }
}

//! End-to-end tests: real sockets through a running proxy

use apitune::{
  AddRuleOptions, ApiTune, Error, MemoryStore, ProxyConfig, ProxyEvent, RuleNode, TrustStore,
};
use rustls_pki_types::{CertificateDer, ServerName};
use serde_json::json;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

struct FakeTrustStore;

impl TrustStore for FakeTrustStore {
  fn contains(&self, _ca: &CertificateDer<'_>) -> bool {
    false
  }

  fn install(&self, _cert_path: &Path) -> apitune::Result<()> {
    Ok(())
  }

  fn is_installed(&self, _cert_path: &Path) -> bool {
    false
  }
}

async fn proxy(dir: &Path) -> ApiTune {
  let config = ProxyConfig {
    data_dir: dir.to_path_buf(),
    listen_host: "127.0.0.1".parse().unwrap(),
    upstream_timeout: 5,
    ..Default::default()
  };
  ApiTune::builder()
    .config(config)
    .store(Arc::new(MemoryStore::new()))
    .trust_store(Arc::new(FakeTrustStore))
    .build()
    .await
    .unwrap()
}

async fn add_rule(app: &ApiTune, rule: serde_json::Value) -> RuleNode {
  let rule: RuleNode = serde_json::from_value(rule).unwrap();
  app.add_rule(rule, AddRuleOptions::default()).await.unwrap()
}

/// Origin answering every request with its path and the `x-injected` header it saw
async fn echo_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let head = read_head(&mut stream).await;
        let path = head.split_whitespace().nth(1).unwrap_or("").to_string();
        let injected = header(&head, "x-injected").unwrap_or_default();
        let body = format!("{} {}", path, injected);
        let response = format!(
          "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Origin: yes\r\nContent-Length: {}\r\n\r\n{}",
          body.len(),
          body
        );
        let _ = stream.write_all(response.as_bytes()).await;
      });
    }
  });
  addr
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut buf = Vec::new();
  let mut byte = [0u8; 1];
  while !buf.ends_with(b"\r\n\r\n") {
    if stream.read(&mut byte).await.unwrap() == 0 {
      break;
    }
    buf.push(byte[0]);
  }
  String::from_utf8_lossy(&buf).to_string()
}

fn header(head: &str, name: &str) -> Option<String> {
  head.lines().find_map(|line| {
    let (k, v) = line.split_once(':')?;
    k.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
  })
}

/// One response framed by Content-Length; leaves the connection usable
async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, String) {
  let head = read_head(stream).await;
  assert!(!head.is_empty(), "connection closed before a response");
  let len: usize = header(&head, "content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
  let mut body = vec![0u8; len];
  stream.read_exact(&mut body).await.unwrap();
  (head, String::from_utf8_lossy(&body).to_string())
}

fn status(head: &str) -> u16 {
  head.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// A port the settings validator accepts that nothing listens on
fn free_port() -> u16 {
  (20000..40000)
    .step_by(97)
    .find(|port| std::net::TcpListener::bind(("127.0.0.1", *port)).is_ok())
    .unwrap()
}

#[tokio::test]
async fn plain_http_goes_through_rules_and_is_logged() {
  let dir = tempfile::tempdir().unwrap();
  let app = proxy(dir.path()).await;
  let origin = echo_origin().await;
  add_rule(
    &app,
    json!({
      "kind": "rule",
      "name": "inject",
      "matches": {"method": "GET", "url": {"type": "contains", "value": "/api/"}},
      "actions": [
        {"type": "setRequestHeader", "name": "x-injected", "value": "from-rule"},
        {"type": "setResponseHeader", "name": "x-rule", "value": "applied"}
      ],
      "testScript": "test \"status\": response.status == 200\nprint request.path"
    }),
  )
  .await;
  let mut events = app.subscribe();
  let addr = app.start(Some(0)).await.unwrap();

  let mut client = TcpStream::connect(addr).await.unwrap();
  let request = format!(
    "GET http://{}/api/users?page=2 HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    origin, origin
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;
  assert_eq!(status(&head), 200);
  assert_eq!(header(&head, "x-rule").as_deref(), Some("applied"));
  assert_eq!(header(&head, "x-origin").as_deref(), Some("yes"));
  assert_eq!(body, "/api/users?page=2 from-rule");

  let logs = app.proxy_logs();
  assert_eq!(logs.len(), 1);
  assert_eq!(logs[0].url, format!("http://{}/api/users?page=2", origin));
  assert_eq!(logs[0].matched_rules.len(), 1);
  assert!(!logs[0].mocked);

  let result = app.test_result(&logs[0].id).unwrap();
  assert!(result.passed);
  assert_eq!(app.print_logs()[0].message, "/api/users");

  let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
    .await
    .unwrap()
    .unwrap();
  assert!(matches!(first, ProxyEvent::RequestLogged { .. }));
  app.shutdown().await;
}

#[tokio::test]
async fn mock_answers_without_an_origin() {
  let dir = tempfile::tempdir().unwrap();
  let app = proxy(dir.path()).await;
  add_rule(
    &app,
    json!({
      "kind": "rule",
      "name": "mock",
      "matches": {"url": {"type": "prefix", "value": "http://nothing.invalid/"}},
      "actions": [{"type": "mock", "status": 201, "headers": {"content-type": "application/json"}, "body": "{\"ok\":true}"}]
    }),
  )
  .await;
  let addr = app.start(Some(0)).await.unwrap();

  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"POST http://nothing.invalid/items HTTP/1.1\r\nHost: nothing.invalid\r\nContent-Length: 2\r\n\r\n{}")
    .await
    .unwrap();
  let (head, body) = read_response(&mut client).await;
  assert_eq!(status(&head), 201);
  assert_eq!(body, "{\"ok\":true}");
  assert_eq!(header(&head, "content-type").as_deref(), Some("application/json"));

  let logs = app.proxy_logs();
  assert_eq!(logs.len(), 1);
  assert!(logs[0].mocked);
  assert!(logs[0].error.is_none());
  app.shutdown().await;
}

#[tokio::test]
async fn connect_tunnel_is_decrypted_with_a_trusted_leaf() {
  let dir = tempfile::tempdir().unwrap();
  let app = proxy(dir.path()).await;
  add_rule(
    &app,
    json!({
      "kind": "rule",
      "name": "secure mock",
      "matches": {"url": {"type": "equals", "value": "https://example.com/secure"}},
      "actions": [{"type": "mock", "status": 200, "body": "intercepted"}]
    }),
  )
  .await;
  let addr = app.start(Some(0)).await.unwrap();

  let pem = app.certificates().root_ca_pem().await.unwrap();
  let mut roots = RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));

  let mut tcp = TcpStream::connect(addr).await.unwrap();
  tcp
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let established = read_head(&mut tcp).await;
  assert_eq!(status(&established), 200);

  let mut tls = connector
    .connect(ServerName::try_from("example.com").unwrap(), tcp)
    .await
    .unwrap();
  tls
    .write_all(b"GET /secure HTTP/1.1\r\nHost: example.com\r\n\r\n")
    .await
    .unwrap();
  let (head, body) = read_response(&mut tls).await;
  assert_eq!(status(&head), 200);
  assert_eq!(body, "intercepted");

  // same tunnel, second request
  tls
    .write_all(b"GET /secure HTTP/1.1\r\nHost: example.com\r\n\r\n")
    .await
    .unwrap();
  let (head, _) = read_response(&mut tls).await;
  assert_eq!(status(&head), 200);

  let logs = app.proxy_logs();
  assert_eq!(logs.len(), 2);
  assert_eq!(logs[0].url, "https://example.com/secure");
  app.shutdown().await;
}

#[tokio::test]
async fn looped_requests_are_refused() {
  let dir = tempfile::tempdir().unwrap();
  let app = proxy(dir.path()).await;
  let addr = app.start(Some(0)).await.unwrap();

  let mut client = TcpStream::connect(addr).await.unwrap();
  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nX-ApiTune-Proxy: 1\r\n\r\n",
    addr, addr
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;
  assert_eq!(status(&head), 400);
  assert_eq!(body, apitune::pipeline::LOOPBACK_MESSAGE);
  assert!(app.proxy_logs().is_empty());
  app.shutdown().await;
}

#[tokio::test]
async fn websocket_upgrade_is_relayed() {
  let dir = tempfile::tempdir().unwrap();
  let app = proxy(dir.path()).await;
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    assert!(header(&head, "upgrade").is_some());
    stream
      .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
      .await
      .unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    stream.write_all(&buf).await.unwrap();
  });
  let addr = app.start(Some(0)).await.unwrap();

  let mut client = TcpStream::connect(addr).await.unwrap();
  let request = format!(
    "GET http://{}/ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
    origin, origin
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let head = read_head(&mut client).await;
  assert_eq!(status(&head), 101);
  client.write_all(b"ping").await.unwrap();
  let mut echoed = [0u8; 4];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"ping");
  app.shutdown().await;
}

#[tokio::test]
async fn port_change_keeps_open_connections() {
  let dir = tempfile::tempdir().unwrap();
  let app = proxy(dir.path()).await;
  let origin = echo_origin().await;
  let old = app.start(Some(0)).await.unwrap();

  let request = format!("GET http://{}/before HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin);
  let mut client = TcpStream::connect(old).await.unwrap();
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, _) = read_response(&mut client).await;
  assert_eq!(status(&head), 200);

  let port = free_port();
  app.change_port(port).await.unwrap();
  assert_eq!(app.local_addr().unwrap().port(), port);
  assert_eq!(app.settings().unwrap().port, port);

  // the connection accepted on the old port is still served
  let request = format!("GET http://{}/after HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin);
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;
  assert_eq!(status(&head), 200);
  assert!(body.starts_with("/after"));

  assert!(TcpStream::connect(old).await.is_err());
  let mut fresh = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
  fresh.write_all(request.as_bytes()).await.unwrap();
  let (head, _) = read_response(&mut fresh).await;
  assert_eq!(status(&head), 200);

  assert!(matches!(app.change_port(80).await, Err(Error::InvalidPort(80))));
  assert_eq!(app.local_addr().unwrap().port(), port);
  app.shutdown().await;
}

#[tokio::test]
async fn status_rule_reaches_the_client_and_the_log() {
  let dir = tempfile::tempdir().unwrap();
  let app = proxy(dir.path()).await;
  let origin = echo_origin().await;
  let rule = add_rule(
    &app,
    json!({
      "kind": "rule",
      "name": "not found",
      "matches": {"url": {"type": "contains", "value": "/gone"}},
      "actions": [{"type": "setStatus", "status": 404}]
    }),
  )
  .await;
  let addr = app.start(Some(0)).await.unwrap();

  let mut client = TcpStream::connect(addr).await.unwrap();
  let request = format!(
    "GET http://{}/gone HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    origin, origin
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;
  assert_eq!(status(&head), 404);
  assert_eq!(body, "/gone ");

  let logs = app.proxy_logs();
  assert_eq!(logs.len(), 1);
  assert_eq!(logs[0].status.as_u16(), 404);
  assert_eq!(logs[0].matched_rules.len(), 1);
  assert_eq!(logs[0].matched_rules[0].id, rule.id());
  app.shutdown().await;
}

#[tokio::test]
async fn client_hangup_drops_the_exchange() {
  let dir = tempfile::tempdir().unwrap();
  let app = proxy(dir.path()).await;
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        read_head(&mut stream).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = stream
          .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nslow")
          .await;
      });
    }
  });
  let addr = app.start(Some(0)).await.unwrap();

  let mut client = TcpStream::connect(addr).await.unwrap();
  let request = format!("GET http://{}/slow HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin);
  client.write_all(request.as_bytes()).await.unwrap();
  tokio::time::sleep(Duration::from_millis(100)).await;
  client.shutdown().await.unwrap();
  drop(client);

  tokio::time::sleep(Duration::from_millis(1500)).await;
  assert!(app.proxy_logs().is_empty());
  app.shutdown().await;
}

#[tokio::test]
async fn announced_request_carries_rule_mutations() {
  let dir = tempfile::tempdir().unwrap();
  let app = proxy(dir.path()).await;
  let origin = echo_origin().await;
  add_rule(
    &app,
    json!({
      "kind": "rule",
      "name": "map remote",
      "matches": {"url": {"type": "prefix", "value": "http://nothing.invalid/"}},
      "actions": [
        {"type": "setRequestHeader", "name": "x-injected", "value": "mapped"},
        {"type": "redirect", "url": format!("http://{}/new", origin)}
      ]
    }),
  )
  .await;
  let mut events = app.subscribe();
  let addr = app.start(Some(0)).await.unwrap();

  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"GET http://nothing.invalid/old HTTP/1.1\r\nHost: nothing.invalid\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let (head, body) = read_response(&mut client).await;
  assert_eq!(status(&head), 200);
  assert_eq!(body, "/new mapped");

  let announced = tokio::time::timeout(Duration::from_secs(1), events.recv())
    .await
    .unwrap()
    .unwrap();
  match announced {
    ProxyEvent::RequestLogged { url, .. } => assert_eq!(url, format!("http://{}/new", origin)),
    other => panic!("unexpected event {:?}", other),
  }

  let logs = app.proxy_logs();
  assert_eq!(logs.len(), 1);
  assert_eq!(logs[0].url, "http://nothing.invalid/old");
  assert_eq!(logs[0].target_url, format!("http://{}/new", origin));
  assert_eq!(logs[0].request_headers.get("x-injected").unwrap(), "mapped");
  app.shutdown().await;
}

//! One intercepted request/response pair and its logged form

use crate::codec::decoded_body;
use crate::rules::{MatchedRule, ResponseMutations};
use crate::store::Captured;
use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const DEFAULT_BODY_LIMIT: usize = 32 * 1024 * 1024;

/// The request as the client sent it
#[derive(Debug, Clone)]
pub struct ClientRequest {
  pub method: Method,
  /// Absolute URL, reconstructed for origin-form requests
  pub uri: Uri,
  pub version: Version,
  pub headers: HeaderMap,
  pub body: Bytes,
}

/// What will actually be sent to the origin, after rule mutations
#[derive(Debug, Clone)]
pub struct ForwardTarget {
  pub method: Method,
  pub uri: Uri,
  pub headers: HeaderMap,
  pub body: Bytes,
}

/// Answer delivered to the client
#[derive(Debug, Clone)]
pub struct ExchangeResponse {
  pub status: StatusCode,
  pub reason: Option<String>,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl ExchangeResponse {
  pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      reason: None,
      headers,
      body: body.into(),
    }
  }

  /// `text/plain;charset=utf-8` response
  pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::CONTENT_TYPE,
      http::HeaderValue::from_static("text/plain;charset=utf-8"),
    );
    let body: String = body.into();
    Self::new(status, headers, body)
  }
}

/// Per-request state threaded through the pipeline
#[derive(Debug)]
pub struct Exchange {
  pub id: String,
  pub client_addr: SocketAddr,
  pub request: ClientRequest,
  pub target: ForwardTarget,
  pub response: Option<ExchangeResponse>,
  pub matched: Vec<MatchedRule>,
  /// Planned at match time, applied once the response exists
  pub response_mutations: ResponseMutations,
  pub mocked: bool,
  /// Set by the error boundary
  pub error: Option<String>,
  pub started_at: i64,
  started: Instant,
  duration: Option<Duration>,
  /// Largest decoded body shown to scripts and logs
  body_limit: usize,
}

impl Exchange {
  pub fn new(client_addr: SocketAddr, request: ClientRequest) -> Self {
    let target = ForwardTarget {
      method: request.method.clone(),
      uri: request.uri.clone(),
      headers: request.headers.clone(),
      body: request.body.clone(),
    };
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      client_addr,
      request,
      target,
      response: None,
      matched: Vec::new(),
      response_mutations: ResponseMutations::default(),
      mocked: false,
      error: None,
      started_at: crate::rules::model::now_millis(),
      started: Instant::now(),
      duration: None,
      body_limit: DEFAULT_BODY_LIMIT,
    }
  }

  pub fn with_body_limit(mut self, body_limit: usize) -> Self {
    self.body_limit = body_limit;
    self
  }

  pub fn url(&self) -> String {
    self.request.uri.to_string()
  }

  /// Freeze the elapsed time; later calls keep the first value
  pub fn finish(&mut self) -> Duration {
    *self.duration.get_or_insert_with(|| self.started.elapsed())
  }

  pub fn duration(&self) -> Duration {
    self.duration.unwrap_or_else(|| self.started.elapsed())
  }

  /// Read-only view of the request handed to test scripts
  pub fn request_view(&self) -> Value {
    let uri = &self.target.uri;
    let body = decoded_body(&self.target.headers, &self.target.body, self.body_limit);
    let text = String::from_utf8_lossy(&body).into_owned();
    json!({
      "method": self.target.method.as_str(),
      "url": uri.to_string(),
      "path": uri.path(),
      "query": uri.query().unwrap_or_default(),
      "headers": headers_view(&self.target.headers),
      "json": parse_json(&text),
      "body": text,
    })
  }

  /// Read-only view of the response handed to test scripts
  pub fn response_view(&self) -> Value {
    let Some(response) = &self.response else {
      return Value::Null;
    };
    let body = decoded_body(&response.headers, &response.body, self.body_limit);
    let text = String::from_utf8_lossy(&body).into_owned();
    json!({
      "status": response.status.as_u16(),
      "headers": headers_view(&response.headers),
      "json": parse_json(&text),
      "body": text,
      "duration": self.duration().as_millis() as u64,
    })
  }

  /// Immutable snapshot for the log store
  pub fn to_log(&self) -> ExchangeLog {
    let (status, response_headers, response_body) = match &self.response {
      Some(r) => (r.status, r.headers.clone(), body_text(&r.headers, &r.body, self.body_limit)),
      None => (StatusCode::BAD_GATEWAY, HeaderMap::new(), String::new()),
    };
    let host = self
      .request
      .uri
      .host()
      .map(str::to_string)
      .or_else(|| {
        self
          .request
          .headers
          .get(HOST)
          .and_then(|h| h.to_str().ok())
          .map(str::to_string)
      })
      .unwrap_or_default();
    ExchangeLog {
      id: self.id.clone(),
      client_addr: self.client_addr.to_string(),
      method: self.target.method.clone(),
      url: self.url(),
      host,
      path: self.request.uri.path().to_string(),
      version: self.request.version,
      request_headers: self.target.headers.clone(),
      request_body: body_text(&self.target.headers, &self.target.body, self.body_limit),
      target_url: self.target.uri.to_string(),
      status,
      response_headers,
      response_body,
      matched_rules: self.matched.clone(),
      mocked: self.mocked,
      error: self.error.clone(),
      start_time: self.started_at,
      duration: self.duration().as_millis() as u64,
    }
  }
}

fn body_text(headers: &HeaderMap, body: &[u8], limit: usize) -> String {
  String::from_utf8_lossy(&decoded_body(headers, body, limit)).into_owned()
}

fn parse_json(text: &str) -> Value {
  serde_json::from_str(text).unwrap_or(Value::Null)
}

/// Lowercase names; repeated headers joined with `, `
fn headers_view(headers: &HeaderMap) -> Value {
  let mut map = Map::new();
  for name in headers.keys() {
    let joined = headers
      .get_all(name)
      .iter()
      .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
      .collect::<Vec<_>>()
      .join(", ");
    map.insert(name.as_str().to_string(), Value::String(joined));
  }
  Value::Object(map)
}

/// Logged form of an [`Exchange`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeLog {
  pub id: String,
  pub client_addr: String,
  #[serde(with = "http_serde::method")]
  pub method: Method,
  pub url: String,
  pub host: String,
  pub path: String,
  #[serde(with = "http_serde::version")]
  pub version: Version,
  /// Outgoing request headers, after rule mutations
  #[serde(with = "http_serde::header_map")]
  pub request_headers: HeaderMap,
  pub request_body: String,
  /// Where the request was actually sent; differs from `url` after a redirect rule
  pub target_url: String,
  #[serde(with = "http_serde::status_code")]
  pub status: StatusCode,
  #[serde(with = "http_serde::header_map")]
  pub response_headers: HeaderMap,
  pub response_body: String,
  pub matched_rules: Vec<MatchedRule>,
  pub mocked: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub start_time: i64,
  /// Milliseconds
  pub duration: u64,
}

impl Captured for ExchangeLog {
  fn capture_id(&self) -> &str {
    &self.id
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::HeaderValue;

  fn exchange() -> Exchange {
    let mut headers = HeaderMap::new();
    headers.insert(HOST, HeaderValue::from_static("api.test"));
    headers.append("x-tag", HeaderValue::from_static("a"));
    headers.append("x-tag", HeaderValue::from_static("b"));
    Exchange::new(
      "127.0.0.1:5000".parse().unwrap(),
      ClientRequest {
        method: Method::POST,
        uri: Uri::from_static("http://api.test/users?page=2"),
        version: Version::HTTP_11,
        headers,
        body: Bytes::from_static(b"{\"name\":\"x\"}"),
      },
    )
  }

  #[test]
  fn views_expose_parsed_parts() {
    let mut ex = exchange();
    ex.response = Some(ExchangeResponse::new(
      StatusCode::CREATED,
      HeaderMap::new(),
      Bytes::from_static(b"{\"id\":9}"),
    ));
    let request = ex.request_view();
    assert_eq!(request["path"], "/users");
    assert_eq!(request["query"], "page=2");
    assert_eq!(request["headers"]["x-tag"], "a, b");
    assert_eq!(request["json"]["name"], "x");
    let response = ex.response_view();
    assert_eq!(response["status"], 201);
    assert_eq!(response["json"]["id"], 9);
  }

  #[test]
  fn log_serializes_camel_case() {
    let mut ex = exchange();
    ex.response = Some(ExchangeResponse::text(StatusCode::OK, "done"));
    ex.finish();
    let log = serde_json::to_value(ex.to_log()).unwrap();
    assert_eq!(log["method"], "POST");
    assert_eq!(log["status"], 200);
    assert_eq!(log["host"], "api.test");
    assert_eq!(log["responseBody"], "done");
    assert_eq!(log["matchedRules"], json!([]));
    assert!(log.get("error").is_none());
  }

  #[test]
  fn log_records_the_outgoing_request() {
    let mut ex = exchange();
    ex.target.headers.insert("x-injected", HeaderValue::from_static("yes"));
    ex.target.body = Bytes::from_static(b"replaced");
    ex.target.uri = Uri::from_static("http://127.0.0.1:1/b");
    ex.response = Some(ExchangeResponse::text(StatusCode::OK, "done"));
    let log = ex.to_log();
    assert_eq!(log.url, "http://api.test/users?page=2");
    assert_eq!(log.target_url, "http://127.0.0.1:1/b");
    assert_eq!(log.request_headers.get("x-injected").unwrap(), "yes");
    assert_eq!(log.request_body, "replaced");
  }
}

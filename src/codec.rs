//! Lenient HTTP/1.x framing for client and origin traffic
//!
//! Parsing accepts what real clients and servers send rather than what RFC 9112
//! asks for: bare `\n` line endings, blank lines before the start line, status
//! lines without a reason phrase, obs-fold continuations, and header lines that
//! do not parse (they are skipped). Encoding always produces canonical framing
//! with a `Content-Length`.

use crate::error::{new_io_error, Error, Result};
use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use std::borrow::Cow;
use std::io::Read;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub(crate) const CR_LF: &[u8] = b"\r\n";
const SPACE: &[u8] = b" ";
const COLON_SPACE: &[u8] = b": ";

/// Longest accepted start or header line
const MAX_LINE: u64 = 64 * 1024;
/// Largest accepted header block
const MAX_HEAD: usize = 256 * 1024;
/// Blank lines tolerated before a start line
const MAX_LEADING_BLANK_LINES: usize = 8;

/// Headers that describe a single hop and are never forwarded
pub const HOP_BY_HOP: &[&str] = &[
  "connection",
  "proxy-connection",
  "proxy-authorization",
  "proxy-authenticate",
  "keep-alive",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
  pub method: Method,
  /// Request target exactly as sent: origin-form, absolute-form or authority-form
  pub target: String,
  pub version: Version,
  pub headers: HeaderMap,
}

/// Parsed status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
  pub version: Version,
  pub status: StatusCode,
  pub reason: Option<String>,
  pub headers: HeaderMap,
}

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
  Empty,
  Fixed(u64),
  Chunked,
  /// Response body delimited by the origin closing the connection
  UntilClose,
}

impl RequestHead {
  /// Whether the client asked to switch protocols (WebSocket and friends)
  pub fn is_upgrade(&self) -> bool {
    self.headers.contains_key(http::header::UPGRADE)
      && header_has_token(&self.headers, &CONNECTION, "upgrade")
  }

  pub fn body_kind(&self) -> BodyKind {
    if is_chunked(&self.headers) {
      return BodyKind::Chunked;
    }
    match content_length(&self.headers) {
      Some(0) | None => BodyKind::Empty,
      Some(n) => BodyKind::Fixed(n),
    }
  }

  pub fn keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }
}

impl ResponseHead {
  /// Framing of the body following this head, given the request method
  pub fn body_kind(&self, method: &Method) -> BodyKind {
    if *method == Method::HEAD
      || self.status.is_informational()
      || self.status == StatusCode::NO_CONTENT
      || self.status == StatusCode::NOT_MODIFIED
    {
      return BodyKind::Empty;
    }
    if is_chunked(&self.headers) {
      return BodyKind::Chunked;
    }
    match content_length(&self.headers) {
      Some(0) => BodyKind::Empty,
      Some(n) => BodyKind::Fixed(n),
      None => BodyKind::UntilClose,
    }
  }
}

/// Read one request head; `Ok(None)` when the peer closed before sending anything
pub async fn read_request_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<RequestHead>> {
  let Some(line) = read_start_line(reader).await? else {
    return Ok(None);
  };
  let mut parts = line
    .split(|b| *b == b' ' || *b == b'\t')
    .filter(|p| !p.is_empty());
  let method = parts
    .next()
    .ok_or_else(|| Error::invalid_request("empty request line"))?;
  let method = Method::from_bytes(method)
    .map_err(|_| Error::invalid_request(format!("invalid method {:?}", String::from_utf8_lossy(method))))?;
  let target = parts
    .next()
    .ok_or_else(|| Error::invalid_request("missing request target"))?;
  let target = String::from_utf8_lossy(target).into_owned();
  let version = parts.next().map(parse_version).unwrap_or(Version::HTTP_11);
  let headers = read_headers(reader).await?;
  Ok(Some(RequestHead {
    method,
    target,
    version,
    headers,
  }))
}

/// Read a response head, skipping nothing but leading blank lines
pub async fn read_response_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ResponseHead> {
  let line = read_start_line(reader)
    .await?
    .ok_or_else(|| new_io_error(std::io::ErrorKind::UnexpectedEof, "origin closed before responding"))?;
  let mut parts = line.splitn(3, |b| *b == b' ');
  let version = parts.next().map(parse_version).unwrap_or(Version::HTTP_11);
  let status = parts
    .next()
    .map(|s| s.trim_ascii())
    .and_then(|s| StatusCode::from_bytes(s).ok())
    .ok_or_else(|| {
      new_io_error(
        std::io::ErrorKind::InvalidData,
        "invalid http version and status_code data",
      )
    })?;
  let reason = parts
    .next()
    .map(|r| String::from_utf8_lossy(r.trim_ascii()).into_owned())
    .filter(|r| !r.is_empty());
  let headers = read_headers(reader).await?;
  Ok(ResponseHead {
    version,
    status,
    reason,
    headers,
  })
}

/// Buffer a whole body, failing once it grows past `max`
pub async fn read_body<R: AsyncBufRead + Unpin>(reader: &mut R, kind: BodyKind, max: usize) -> Result<Bytes> {
  match kind {
    BodyKind::Empty => Ok(Bytes::new()),
    BodyKind::Fixed(n) => {
      if n > max as u64 {
        return Err(body_too_large());
      }
      let mut body = vec![0; n as usize];
      reader.read_exact(&mut body).await?;
      Ok(Bytes::from(body))
    }
    BodyKind::Chunked => read_chunked_body(reader, max).await,
    BodyKind::UntilClose => {
      let mut body = Vec::new();
      (&mut *reader).take(max as u64 + 1).read_to_end(&mut body).await?;
      if body.len() > max {
        return Err(body_too_large());
      }
      Ok(Bytes::from(body))
    }
  }
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R, max: usize) -> Result<Bytes> {
  let mut body: Vec<u8> = Vec::new();
  loop {
    let line = read_line(reader).await?;
    if line.is_empty() && at_eof(reader).await? {
      return Err(new_io_error(std::io::ErrorKind::UnexpectedEof, "truncated chunked body"));
    }
    let size = line.split(|b| *b == b';').next().unwrap_or_default().trim_ascii();
    if size.is_empty() {
      // stray CRLF between chunks
      continue;
    }
    let size = std::str::from_utf8(size)
      .ok()
      .and_then(|s| usize::from_str_radix(s, 16).ok())
      .ok_or_else(|| new_io_error(std::io::ErrorKind::InvalidData, "invalid chunk size"))?;
    if size == 0 {
      // trailers, discarded
      loop {
        let trailer = read_line(reader).await?;
        if trailer.is_empty() {
          break;
        }
      }
      return Ok(Bytes::from(body));
    }
    if body.len() + size > max {
      return Err(body_too_large());
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader.read_exact(&mut body[start..]).await?;
    read_line(reader).await?;
  }
}

/// Serialize a request for the origin. Framing headers are rewritten.
pub fn encode_request(method: &Method, target: &str, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
  let mut raw = Vec::with_capacity(256 + body.len());
  raw.extend(method.as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(target.as_bytes());
  raw.extend(SPACE);
  raw.extend(b"HTTP/1.1");
  raw.extend(CR_LF);
  write_headers(&mut raw, headers);
  let needs_length =
    !body.is_empty() || *method == Method::POST || *method == Method::PUT || *method == Method::PATCH;
  if needs_length {
    write_content_length(&mut raw, body.len());
  }
  raw.extend(CR_LF);
  raw.extend(body);
  raw
}

/// Serialize a response for the client.
///
/// `bodyless` keeps the origin's `Content-Length` untouched for answers that
/// never carry a body (HEAD, 1xx, 204, 304).
pub fn encode_response(
  status: StatusCode,
  reason: Option<&str>,
  headers: &HeaderMap,
  body: &[u8],
  bodyless: bool,
) -> Vec<u8> {
  let mut raw = Vec::with_capacity(256 + body.len());
  raw.extend(b"HTTP/1.1 ");
  raw.extend(status.as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(
    reason
      .or_else(|| status.canonical_reason())
      .unwrap_or("Unknown")
      .as_bytes(),
  );
  raw.extend(CR_LF);
  if bodyless {
    for (name, value) in headers.iter() {
      if *name != TRANSFER_ENCODING {
        write_header(&mut raw, name, value);
      }
    }
  } else {
    write_headers(&mut raw, headers);
    write_content_length(&mut raw, body.len());
  }
  raw.extend(CR_LF);
  if !bodyless {
    raw.extend(body);
  }
  raw
}

/// Serialize a head verbatim (no framing rewrite), used for upgrade handshakes
pub fn encode_request_head(method: &Method, target: &str, headers: &HeaderMap) -> Vec<u8> {
  let mut raw = Vec::with_capacity(256);
  raw.extend(method.as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(target.as_bytes());
  raw.extend(b" HTTP/1.1");
  raw.extend(CR_LF);
  for (name, value) in headers.iter() {
    write_header(&mut raw, name, value);
  }
  raw.extend(CR_LF);
  raw
}

/// See [`encode_request_head`]
pub fn encode_response_head(head: &ResponseHead) -> Vec<u8> {
  let mut raw = Vec::with_capacity(256);
  raw.extend(b"HTTP/1.1 ");
  raw.extend(head.status.as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(
    head
      .reason
      .as_deref()
      .or_else(|| head.status.canonical_reason())
      .unwrap_or("Unknown")
      .as_bytes(),
  );
  raw.extend(CR_LF);
  for (name, value) in head.headers.iter() {
    write_header(&mut raw, name, value);
  }
  raw.extend(CR_LF);
  raw
}

/// Drop hop-by-hop headers, including those listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let listed: Vec<HeaderName> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
    .collect();
  for name in listed {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(*name);
  }
}

/// Body with its `Content-Encoding` undone, for display and scripts.
/// Unknown encodings, corrupt streams and bodies that inflate past `limit`
/// yield the raw bytes.
pub fn decoded_body<'a>(headers: &HeaderMap, body: &'a [u8], limit: usize) -> Cow<'a, [u8]> {
  let encoding = headers
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().to_ascii_lowercase());
  let cap = (limit as u64).saturating_add(1);
  let mut decoded = Vec::new();
  let result = match encoding.as_deref() {
    Some("gzip") | Some("x-gzip") => MultiGzDecoder::new(body).take(cap).read_to_end(&mut decoded),
    Some("deflate") => ZlibDecoder::new(body).take(cap).read_to_end(&mut decoded),
    _ => return Cow::Borrowed(body),
  };
  match result {
    Ok(_) if decoded.len() > limit => {
      tracing::debug!("[codec] body inflates past {} bytes, keeping it encoded", limit);
      Cow::Borrowed(body)
    }
    Ok(_) => Cow::Owned(decoded),
    Err(e) => {
      tracing::debug!("[codec] could not decode body: {}", e);
      Cow::Borrowed(body)
    }
  }
}

/// Parse `name: value`; `None` for lines that are not a valid header
pub(crate) fn parse_header_line(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
  let colon = line.iter().position(|b| *b == b':')?;
  let name = HeaderName::from_bytes(line[..colon].trim_ascii_end()).ok()?;
  let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii()).ok()?;
  Some((name, value))
}

pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
  if header_has_token(headers, &CONNECTION, "close") {
    return false;
  }
  match version {
    Version::HTTP_09 | Version::HTTP_10 => header_has_token(headers, &CONNECTION, "keep-alive"),
    _ => true,
  }
}

fn header_has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
  headers
    .get_all(name)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn is_chunked(headers: &HeaderMap) -> bool {
  header_has_token(headers, &TRANSFER_ENCODING, "chunked")
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(CONTENT_LENGTH)
    .and_then(|x| x.to_str().ok()?.trim().parse().ok())
}

fn parse_version(raw: &[u8]) -> Version {
  match raw.trim_ascii() {
    b"HTTP/0.9" => Version::HTTP_09,
    b"HTTP/1.0" => Version::HTTP_10,
    _ => Version::HTTP_11,
  }
}

fn body_too_large() -> Error {
  new_io_error(std::io::ErrorKind::InvalidData, "body exceeds the configured limit")
}

/// One line without its terminator; empty at EOF
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
  let mut line = Vec::new();
  (&mut *reader).take(MAX_LINE).read_until(b'\n', &mut line).await?;
  if line.len() as u64 >= MAX_LINE && !line.ends_with(b"\n") {
    return Err(new_io_error(std::io::ErrorKind::InvalidData, "line too long"));
  }
  if line.ends_with(b"\n") {
    line.pop();
  }
  if line.ends_with(b"\r") {
    line.pop();
  }
  Ok(line)
}

async fn at_eof<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<bool> {
  Ok(reader.fill_buf().await?.is_empty())
}

async fn read_start_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
  for _ in 0..=MAX_LEADING_BLANK_LINES {
    if at_eof(reader).await? {
      return Ok(None);
    }
    let line = read_line(reader).await?;
    if !line.trim_ascii().is_empty() {
      return Ok(Some(line));
    }
  }
  Err(Error::invalid_request("too many blank lines before start line"))
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap> {
  let mut lines: Vec<Vec<u8>> = Vec::new();
  let mut total = 0;
  loop {
    let line = read_line(reader).await?;
    if line.is_empty() {
      break;
    }
    total += line.len();
    if total > MAX_HEAD {
      return Err(Error::invalid_request("header block too large"));
    }
    if matches!(line.first(), Some(b' ') | Some(b'\t')) {
      if let Some(last) = lines.last_mut() {
        last.push(b' ');
        last.extend_from_slice(line.trim_ascii());
        continue;
      }
    }
    lines.push(line);
  }
  let mut headers = HeaderMap::new();
  for line in lines {
    match parse_header_line(&line) {
      Some((name, value)) => {
        headers.append(name, value);
      }
      None => tracing::debug!(
        "[codec] skipping invalid header line {:?}",
        String::from_utf8_lossy(&line)
      ),
    }
  }
  Ok(headers)
}

fn write_header(raw: &mut Vec<u8>, name: &HeaderName, value: &HeaderValue) {
  raw.extend(name.as_str().as_bytes());
  raw.extend(COLON_SPACE);
  raw.extend(value.as_bytes());
  raw.extend(CR_LF);
}

fn write_headers(raw: &mut Vec<u8>, headers: &HeaderMap) {
  for (name, value) in headers.iter() {
    if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING {
      continue;
    }
    write_header(raw, name, value);
  }
}

fn write_content_length(raw: &mut Vec<u8>, len: usize) {
  raw.extend(CONTENT_LENGTH.as_str().as_bytes());
  raw.extend(COLON_SPACE);
  raw.extend(len.to_string().as_bytes());
  raw.extend(CR_LF);
}

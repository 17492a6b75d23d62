//! Runtime rule matching
//!
//! The stored tree is flattened into a [`RuleSnapshot`] of enabled rules in
//! tree order, with patterns compiled once. Readers load the current snapshot
//! without locking; the storage service swaps in a new one after every change.
//!
//! Evaluation walks every rule, records every match, and merges actions into a
//! [`RulePlan`] where each mutation slot (a header name, the body, the status,
//! the forwarding target...) belongs to the first action that claims it. A mock
//! ends mutation planning but later matches are still recorded.

use super::model::{HeaderOp, RuleAction, RuleNode, UrlMatchType, UrlPattern};
use arc_swap::ArcSwap;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// What a request looks like to a rule
#[derive(Debug, Clone, Copy)]
pub struct MatchInput<'a> {
  pub method: &'a str,
  /// `scheme://host[:port]/path?query`
  pub url: &'a str,
  pub path_and_query: &'a str,
  pub headers: &'a HeaderMap,
}

#[derive(Debug)]
enum UrlMatcher {
  Contains(String),
  Equals(String),
  Prefix(String),
  Pattern(Regex),
}

impl UrlMatcher {
  fn compile(pattern: &UrlPattern) -> Result<Self, regex::Error> {
    Ok(match pattern.kind {
      UrlMatchType::Contains => UrlMatcher::Contains(pattern.value.clone()),
      UrlMatchType::Equals => UrlMatcher::Equals(pattern.value.clone()),
      UrlMatchType::Prefix => UrlMatcher::Prefix(pattern.value.clone()),
      UrlMatchType::Regex => UrlMatcher::Pattern(Regex::new(&pattern.value)?),
      UrlMatchType::Wildcard => UrlMatcher::Pattern(Regex::new(&wildcard_to_regex(&pattern.value))?),
    })
  }

  fn is_match(&self, input: &MatchInput<'_>) -> bool {
    let candidates = [input.url, input.path_and_query];
    match self {
      UrlMatcher::Contains(v) => candidates.iter().any(|c| c.contains(v.as_str())),
      UrlMatcher::Equals(v) => candidates.iter().any(|c| *c == v.as_str()),
      UrlMatcher::Prefix(v) => candidates.iter().any(|c| c.starts_with(v.as_str())),
      UrlMatcher::Pattern(re) => re.is_match(input.url),
    }
  }
}

fn wildcard_to_regex(pattern: &str) -> String {
  let mut re = String::with_capacity(pattern.len() + 8);
  re.push('^');
  for c in pattern.chars() {
    match c {
      '*' => re.push_str(".*"),
      '?' => re.push('.'),
      c => re.push_str(&regex::escape(&c.to_string())),
    }
  }
  re.push('$');
  re
}

#[derive(Debug)]
enum HeaderTest {
  Equals(String),
  Contains(String),
  Regex(Regex),
  Exists,
  Absent,
}

#[derive(Debug)]
struct HeaderMatcher {
  name: HeaderName,
  test: HeaderTest,
}

impl HeaderMatcher {
  fn is_match(&self, headers: &HeaderMap) -> bool {
    let mut values = headers.get_all(&self.name).iter().map(|v| String::from_utf8_lossy(v.as_bytes()));
    match &self.test {
      HeaderTest::Exists => headers.contains_key(&self.name),
      HeaderTest::Absent => !headers.contains_key(&self.name),
      HeaderTest::Equals(expected) => values.any(|v| v == expected.as_str()),
      HeaderTest::Contains(needle) => values.any(|v| v.contains(needle.as_str())),
      HeaderTest::Regex(re) => values.any(|v| re.is_match(&v)),
    }
  }
}

#[derive(Debug, Clone)]
enum CompiledAction {
  SetRequestHeader(HeaderName, HeaderValue),
  RemoveRequestHeader(HeaderName),
  SetRequestBody(Bytes),
  SetResponseHeader(HeaderName, HeaderValue),
  RemoveResponseHeader(HeaderName),
  SetStatus(StatusCode),
  SetResponseBody(Bytes, Option<HeaderValue>),
  Delay(Duration),
  Redirect(String),
  Mock(MockResponse),
}

/// A locally produced response
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
}

/// An enabled rule ready for evaluation
#[derive(Debug)]
pub struct CompiledRule {
  pub id: String,
  pub name: String,
  pub test_script: Option<String>,
  method: Option<String>,
  url: Option<UrlMatcher>,
  headers: Vec<HeaderMatcher>,
  actions: Vec<CompiledAction>,
  /// A pattern failed to compile; the rule never matches
  broken: bool,
}

impl CompiledRule {
  fn compile(rule: &super::model::RuleData) -> Self {
    let mut broken = false;
    let url = match rule.matches.url.as_ref().filter(|u| !u.value.is_empty()) {
      Some(pattern) => match UrlMatcher::compile(pattern) {
        Ok(m) => Some(m),
        Err(e) => {
          tracing::warn!("[rules] rule {} has an invalid url pattern: {}", rule.id, e);
          broken = true;
          None
        }
      },
      None => None,
    };

    let mut headers = Vec::new();
    for cond in &rule.matches.headers {
      let Ok(name) = HeaderName::from_bytes(cond.name.trim().as_bytes()) else {
        tracing::warn!("[rules] rule {} has an invalid header name {:?}", rule.id, cond.name);
        broken = true;
        continue;
      };
      let value = cond.value.clone().unwrap_or_default();
      let test = match cond.op {
        HeaderOp::Equals => HeaderTest::Equals(value),
        HeaderOp::Contains => HeaderTest::Contains(value),
        HeaderOp::Exists => HeaderTest::Exists,
        HeaderOp::Absent => HeaderTest::Absent,
        HeaderOp::Regex => match Regex::new(&value) {
          Ok(re) => HeaderTest::Regex(re),
          Err(e) => {
            tracing::warn!("[rules] rule {} has an invalid header regex: {}", rule.id, e);
            broken = true;
            continue;
          }
        },
      };
      headers.push(HeaderMatcher { name, test });
    }

    let actions = rule
      .actions
      .iter()
      .filter_map(|action| match compile_action(action) {
        Some(compiled) => Some(compiled),
        None => {
          tracing::warn!("[rules] rule {} skips invalid action {:?}", rule.id, action);
          None
        }
      })
      .collect();

    let method = rule
      .matches
      .method
      .as_ref()
      .map(|m| m.trim().to_string())
      .filter(|m| !m.is_empty() && m != "*");

    CompiledRule {
      id: rule.id.clone(),
      name: rule.name.clone(),
      test_script: rule.test_script.clone().filter(|s| !s.trim().is_empty()),
      method,
      url,
      headers,
      actions,
      broken,
    }
  }

  pub fn is_match(&self, input: &MatchInput<'_>) -> bool {
    if self.broken {
      return false;
    }
    if let Some(method) = &self.method {
      if !method.eq_ignore_ascii_case(input.method) {
        return false;
      }
    }
    if let Some(url) = &self.url {
      if !url.is_match(input) {
        return false;
      }
    }
    self.headers.iter().all(|h| h.is_match(input.headers))
  }
}

fn compile_action(action: &RuleAction) -> Option<CompiledAction> {
  let header = |name: &str| HeaderName::from_bytes(name.trim().as_bytes()).ok();
  let value = |value: &str| HeaderValue::from_str(value).ok();
  Some(match action {
    RuleAction::SetRequestHeader { name, value: v } => CompiledAction::SetRequestHeader(header(name)?, value(v)?),
    RuleAction::RemoveRequestHeader { name } => CompiledAction::RemoveRequestHeader(header(name)?),
    RuleAction::SetRequestBody { body } => CompiledAction::SetRequestBody(Bytes::from(body.clone())),
    RuleAction::SetResponseHeader { name, value: v } => CompiledAction::SetResponseHeader(header(name)?, value(v)?),
    RuleAction::RemoveResponseHeader { name } => CompiledAction::RemoveResponseHeader(header(name)?),
    RuleAction::SetStatus { status } => CompiledAction::SetStatus(StatusCode::from_u16(*status).ok()?),
    RuleAction::SetResponseBody { body, content_type } => {
      let content_type = match content_type {
        Some(ct) => Some(value(ct)?),
        None => None,
      };
      CompiledAction::SetResponseBody(Bytes::from(body.clone()), content_type)
    }
    RuleAction::Delay { ms } => CompiledAction::Delay(Duration::from_millis(*ms)),
    RuleAction::Redirect { url } => {
      let parsed: http::Uri = url.parse().ok()?;
      parsed.scheme()?;
      parsed.authority()?;
      CompiledAction::Redirect(url.clone())
    }
    RuleAction::Mock { status, headers, body } => {
      let mut map = HeaderMap::new();
      for (k, v) in headers {
        map.append(header(k)?, value(v)?);
      }
      CompiledAction::Mock(MockResponse {
        status: StatusCode::from_u16(*status).ok()?,
        headers: map,
        body: Bytes::from(body.clone()),
      })
    }
  })
}

/// Enabled rules in tree order
#[derive(Debug, Default)]
pub struct RuleSnapshot {
  pub rules: Vec<Arc<CompiledRule>>,
}

impl RuleSnapshot {
  pub fn build(nodes: &[RuleNode]) -> Self {
    let mut rules = Vec::new();
    flatten(nodes, &mut rules);
    Self { rules }
  }
}

fn flatten(nodes: &[RuleNode], out: &mut Vec<Arc<CompiledRule>>) {
  for node in nodes {
    match node {
      RuleNode::Rule(rule) if rule.enable => out.push(Arc::new(CompiledRule::compile(rule))),
      RuleNode::Group(group) if group.enable => flatten(&group.rule_list, out),
      _ => {}
    }
  }
}

/// A rule that matched the current request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedRule {
  pub id: String,
  pub name: String,
  #[serde(skip)]
  pub test_script: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMutations {
  pub set_headers: Vec<(HeaderName, HeaderValue)>,
  pub remove_headers: Vec<HeaderName>,
  pub body: Option<Bytes>,
  /// Replacement forwarding URL
  pub redirect: Option<String>,
}

impl RequestMutations {
  pub fn is_empty(&self) -> bool {
    self.set_headers.is_empty() && self.remove_headers.is_empty() && self.body.is_none() && self.redirect.is_none()
  }

  /// Apply header and body mutations; the redirect is left to the caller
  pub fn apply(&self, headers: &mut HeaderMap, body: &mut Bytes) {
    for name in &self.remove_headers {
      headers.remove(name);
    }
    for (name, value) in &self.set_headers {
      headers.insert(name.clone(), value.clone());
    }
    if let Some(new_body) = &self.body {
      *body = new_body.clone();
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMutations {
  pub set_headers: Vec<(HeaderName, HeaderValue)>,
  pub remove_headers: Vec<HeaderName>,
  pub status: Option<StatusCode>,
  pub body: Option<Bytes>,
}

impl ResponseMutations {
  pub fn is_empty(&self) -> bool {
    self.set_headers.is_empty() && self.remove_headers.is_empty() && self.status.is_none() && self.body.is_none()
  }

  pub fn apply(&self, status: &mut StatusCode, headers: &mut HeaderMap, body: &mut Bytes) {
    if let Some(s) = self.status {
      *status = s;
    }
    for name in &self.remove_headers {
      headers.remove(name);
    }
    for (name, value) in &self.set_headers {
      headers.insert(name.clone(), value.clone());
    }
    if let Some(new_body) = &self.body {
      *body = new_body.clone();
      // the body was replaced, any origin encoding no longer applies
      headers.remove(http::header::CONTENT_ENCODING);
    }
  }
}

/// Result of evaluating every rule against one request
#[derive(Debug, Clone, Default)]
pub struct RulePlan {
  pub matched: Vec<MatchedRule>,
  pub request: RequestMutations,
  pub response: ResponseMutations,
  pub delay: Option<Duration>,
  pub mock: Option<MockResponse>,
}

#[derive(Hash, PartialEq, Eq)]
enum Slot {
  RequestHeader(HeaderName),
  RequestBody,
  Redirect,
  ResponseHeader(HeaderName),
  Status,
  ResponseBody,
  Delay,
}

struct Planner {
  plan: RulePlan,
  claimed: HashSet<Slot>,
}

impl Planner {
  fn claim(&mut self, slot: Slot) -> bool {
    self.claimed.insert(slot)
  }

  fn add(&mut self, action: &CompiledAction) {
    match action {
      CompiledAction::SetRequestHeader(name, value) => {
        if self.claim(Slot::RequestHeader(name.clone())) {
          self.plan.request.set_headers.push((name.clone(), value.clone()));
        }
      }
      CompiledAction::RemoveRequestHeader(name) => {
        if self.claim(Slot::RequestHeader(name.clone())) {
          self.plan.request.remove_headers.push(name.clone());
        }
      }
      CompiledAction::SetRequestBody(body) => {
        if self.claim(Slot::RequestBody) {
          self.plan.request.body = Some(body.clone());
        }
      }
      CompiledAction::Redirect(url) => {
        if self.claim(Slot::Redirect) {
          self.plan.request.redirect = Some(url.clone());
        }
      }
      CompiledAction::SetResponseHeader(name, value) => {
        if self.claim(Slot::ResponseHeader(name.clone())) {
          self.plan.response.set_headers.push((name.clone(), value.clone()));
        }
      }
      CompiledAction::RemoveResponseHeader(name) => {
        if self.claim(Slot::ResponseHeader(name.clone())) {
          self.plan.response.remove_headers.push(name.clone());
        }
      }
      CompiledAction::SetStatus(status) => {
        if self.claim(Slot::Status) {
          self.plan.response.status = Some(*status);
        }
      }
      CompiledAction::SetResponseBody(body, content_type) => {
        if self.claim(Slot::ResponseBody) {
          self.plan.response.body = Some(body.clone());
          if let Some(ct) = content_type {
            if self.claim(Slot::ResponseHeader(CONTENT_TYPE)) {
              self.plan.response.set_headers.push((CONTENT_TYPE, ct.clone()));
            }
          }
        }
      }
      CompiledAction::Delay(delay) => {
        if self.claim(Slot::Delay) {
          self.plan.delay = Some(*delay);
        }
      }
      CompiledAction::Mock(mock) => {
        self.plan.mock = Some(mock.clone());
      }
    }
  }
}

impl RuleSnapshot {
  pub fn evaluate(&self, input: &MatchInput<'_>) -> RulePlan {
    let mut planner = Planner {
      plan: RulePlan::default(),
      claimed: HashSet::new(),
    };
    for rule in &self.rules {
      if !rule.is_match(input) {
        continue;
      }
      planner.plan.matched.push(MatchedRule {
        id: rule.id.clone(),
        name: rule.name.clone(),
        test_script: rule.test_script.clone(),
      });
      for action in &rule.actions {
        if planner.plan.mock.is_some() {
          break;
        }
        planner.add(action);
      }
    }
    planner.plan
  }
}

/// Shared handle on the current snapshot
#[derive(Debug, Default)]
pub struct RuleEngine {
  snapshot: ArcSwap<RuleSnapshot>,
}

impl RuleEngine {
  pub fn new() -> Self {
    Self::default()
  }

  /// Rebuild from the stored tree and publish atomically
  pub fn update(&self, nodes: &[RuleNode]) {
    let snapshot = RuleSnapshot::build(nodes);
    tracing::debug!("[rules] runtime snapshot now holds {} rules", snapshot.rules.len());
    self.snapshot.store(Arc::new(snapshot));
  }

  pub fn snapshot(&self) -> Arc<RuleSnapshot> {
    self.snapshot.load_full()
  }

  pub fn evaluate(&self, input: &MatchInput<'_>) -> RulePlan {
    self.snapshot.load().evaluate(input)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn nodes(value: serde_json::Value) -> Vec<RuleNode> {
    serde_json::from_value(value).unwrap()
  }

  fn input<'a>(method: &'a str, url: &'a str, path: &'a str, headers: &'a HeaderMap) -> MatchInput<'a> {
    MatchInput {
      method,
      url,
      path_and_query: path,
      headers,
    }
  }

  #[test]
  fn disabled_group_prunes_subtree() {
    let engine = RuleEngine::new();
    engine.update(&nodes(json!([
      {"kind": "group", "id": "g", "enable": false, "ruleList": [
        {"kind": "rule", "id": "inner", "matches": {"url": {"type": "contains", "value": "/api"}}}
      ]},
      {"kind": "rule", "id": "outer", "matches": {"url": {"type": "contains", "value": "/api"}}}
    ])));
    let headers = HeaderMap::new();
    let plan = engine.evaluate(&input("GET", "http://x.test/api", "/api", &headers));
    let ids: Vec<_> = plan.matched.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["outer"]);
  }

  #[test]
  fn earlier_mutations_win_and_mock_stops_planning() {
    let engine = RuleEngine::new();
    engine.update(&nodes(json!([
      {"kind": "rule", "id": "a", "actions": [
        {"type": "setStatus", "status": 418},
        {"type": "setResponseHeader", "name": "x-from", "value": "a"}
      ]},
      {"kind": "rule", "id": "b", "actions": [
        {"type": "setStatus", "status": 500},
        {"type": "mock", "status": 200, "body": "mocked"},
        {"type": "setResponseHeader", "name": "x-late", "value": "b"}
      ]},
      {"kind": "rule", "id": "c", "actions": [
        {"type": "setRequestHeader", "name": "x-c", "value": "c"}
      ]}
    ])));
    let headers = HeaderMap::new();
    let plan = engine.evaluate(&input("POST", "http://x.test/", "/", &headers));
    assert_eq!(plan.matched.len(), 3);
    assert_eq!(plan.response.status, Some(StatusCode::IM_A_TEAPOT));
    assert_eq!(plan.mock.as_ref().unwrap().body, Bytes::from("mocked"));
    assert_eq!(plan.response.set_headers.len(), 1);
    assert!(plan.request.is_empty());
  }

  #[test]
  fn url_and_header_conditions() {
    let engine = RuleEngine::new();
    engine.update(&nodes(json!([
      {"kind": "rule", "id": "wild", "matches": {"method": "get", "url": {"type": "wildcard", "value": "https://*.example.com/users/*"}}},
      {"kind": "rule", "id": "path", "matches": {"url": {"type": "prefix", "value": "/users"}}},
      {"kind": "rule", "id": "hdr", "matches": {"headers": [
        {"name": "Authorization", "op": "regex", "value": "^Bearer "},
        {"name": "x-debug", "op": "absent"}
      ]}},
      {"kind": "rule", "id": "bad", "matches": {"url": {"type": "regex", "value": "("}}}
    ])));
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
    let plan = engine.evaluate(&input(
      "GET",
      "https://api.example.com/users/1",
      "/users/1",
      &headers,
    ));
    let ids: Vec<_> = plan.matched.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["wild", "path", "hdr"]);

    let plan = engine.evaluate(&input("POST", "https://api.example.com/users/1", "/users/1", &HeaderMap::new()));
    let ids: Vec<_> = plan.matched.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["path"]);
  }

  #[test]
  fn response_mutations_apply_in_place() {
    let mutations = ResponseMutations {
      set_headers: vec![(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
      remove_headers: vec![HeaderName::from_static("x-remove")],
      status: Some(StatusCode::NOT_FOUND),
      body: Some(Bytes::from("{}")),
    };
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();
    headers.insert("x-remove", HeaderValue::from_static("1"));
    headers.insert("content-encoding", HeaderValue::from_static("gzip"));
    let mut body = Bytes::from("old");
    mutations.apply(&mut status, &mut headers, &mut body);
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers.len(), 1);
    assert_eq!(body, Bytes::from("{}"));
  }

  #[test]
  fn readers_always_see_a_whole_snapshot() {
    let engine = Arc::new(RuleEngine::new());
    let generation = |g: usize| {
      nodes(json!([
        {"kind": "rule", "id": format!("{}-a", g), "name": g.to_string()},
        {"kind": "rule", "id": format!("{}-b", g), "name": g.to_string()}
      ]))
    };
    engine.update(&generation(0));
    let writer = {
      let engine = engine.clone();
      std::thread::spawn(move || {
        for g in 1..200 {
          engine.update(&generation(g));
        }
      })
    };
    let headers = HeaderMap::new();
    for _ in 0..2000 {
      let plan = engine.evaluate(&input("GET", "http://x/", "/", &headers));
      assert_eq!(plan.matched.len(), 2);
      assert_eq!(plan.matched[0].name, plan.matched[1].name);
    }
    writer.join().unwrap();
  }
}

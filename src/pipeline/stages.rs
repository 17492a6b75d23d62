//! The proxy's stages, in the order [`standard`] registers them

use super::{Flow, Pipeline, Placement, Stage};
use crate::codec;
use crate::config::PROXY_HEADER;
use crate::error::{Error, Result};
use crate::events::{EventBus, ProxyEvent};
use crate::exchange::{Exchange, ExchangeResponse, ForwardTarget};
use crate::forward::Forwarder;
use crate::rules::{MatchInput, RuleEngine};
use crate::script::ScriptRunner;
use crate::store::Captures;
use http::header::{HeaderValue, HOST};
use http::{StatusCode, Uri};
use std::sync::Arc;

/// Body of the answer to a request that looped back into the proxy
pub const LOOPBACK_MESSAGE: &str =
  "ApiTune needs to be set as a proxy server to use, please refer to the documentation for details";

/// Build the pipeline the proxy serves with
pub fn standard(
  engine: Arc<RuleEngine>,
  forwarder: Forwarder,
  runner: ScriptRunner,
  captures: Arc<Captures>,
  events: EventBus,
) -> Pipeline {
  Pipeline::new()
    .stage(LoopbackGuard)
    .stage(TestScriptStage {
      runner,
      captures: captures.clone(),
      events: events.clone(),
    })
    .stage(StateInit)
    .stage(ResponseLogStage {
      captures,
      events: events.clone(),
    })
    .stage(RuleStage { engine })
    .stage(RequestLogStage { events })
    .stage(ForwardStage { forwarder })
}

/// Rejects requests that carry our own control header, i.e. requests the
/// proxy sent to itself because it was addressed directly
pub struct LoopbackGuard;

#[async_trait::async_trait]
impl Stage for LoopbackGuard {
  fn name(&self) -> &'static str {
    "loopback-guard"
  }

  async fn on_request(&self, exchange: &mut Exchange) -> Result<Flow> {
    if !exchange.request.headers.contains_key(PROXY_HEADER) {
      return Ok(Flow::Continue);
    }
    tracing::warn!("[proxy] rejected looped request to {}", exchange.url());
    exchange.response = Some(ExchangeResponse::text(StatusCode::BAD_REQUEST, LOOPBACK_MESSAGE));
    Ok(Flow::Respond)
  }
}

/// Runs matched rules' test scripts against the final exchange
pub struct TestScriptStage {
  runner: ScriptRunner,
  captures: Arc<Captures>,
  events: EventBus,
}

#[async_trait::async_trait]
impl Stage for TestScriptStage {
  fn name(&self) -> &'static str {
    "test-script"
  }

  fn placement(&self) -> Placement {
    Placement::Wrap
  }

  async fn on_request(&self, _exchange: &mut Exchange) -> Result<Flow> {
    Ok(Flow::Continue)
  }

  async fn on_response(&self, exchange: &mut Exchange) -> Result<()> {
    if exchange.matched.is_empty() {
      return Ok(());
    }
    let request = exchange.request_view();
    let response = exchange.response_view();
    let Some(report) = self
      .runner
      .run(&exchange.id, &exchange.matched, request, response)
      .await
    else {
      return Ok(());
    };
    tracing::debug!(
      "[script] {} passed={} assertions={}",
      exchange.id,
      report.result.passed,
      report.result.results.len()
    );
    for print in report.prints {
      self.captures.prints.append(print.clone());
      self.events.emit(ProxyEvent::PrintLogAppended(print));
    }
    self.captures.test_results.append(report.result.clone());
    self.events.emit(ProxyEvent::TestResultUpdated(report.result));
    Ok(())
  }
}

/// Resets per-exchange state and prepares the forwarding target
pub struct StateInit;

#[async_trait::async_trait]
impl Stage for StateInit {
  fn name(&self) -> &'static str {
    "state-init"
  }

  async fn on_request(&self, exchange: &mut Exchange) -> Result<Flow> {
    let mut headers = exchange.request.headers.clone();
    codec::strip_hop_by_hop(&mut headers);
    exchange.target = ForwardTarget {
      method: exchange.request.method.clone(),
      uri: exchange.request.uri.clone(),
      headers,
      body: exchange.request.body.clone(),
    };
    exchange.matched.clear();
    exchange.response_mutations = Default::default();
    exchange.mocked = false;
    Ok(Flow::Continue)
  }
}

/// Writes the finished exchange to the log store
pub struct ResponseLogStage {
  captures: Arc<Captures>,
  events: EventBus,
}

#[async_trait::async_trait]
impl Stage for ResponseLogStage {
  fn name(&self) -> &'static str {
    "response-log"
  }

  fn placement(&self) -> Placement {
    Placement::Wrap
  }

  async fn on_request(&self, _exchange: &mut Exchange) -> Result<Flow> {
    Ok(Flow::Continue)
  }

  async fn on_response(&self, exchange: &mut Exchange) -> Result<()> {
    let duration = exchange.finish();
    let log = exchange.to_log();
    tracing::info!(
      "[proxy] {} {} {} {}ms{}",
      log.method,
      log.url,
      log.status.as_u16(),
      duration.as_millis(),
      if log.mocked { " (mock)" } else { "" }
    );
    self.captures.logs.append(log.clone());
    self.events.emit(ProxyEvent::ProxyLogAppended(Box::new(log)));
    Ok(())
  }
}

/// Matches rules, applies request mutations, delays and mocks, and applies
/// the planned response mutations once a response exists
pub struct RuleStage {
  engine: Arc<RuleEngine>,
}

#[async_trait::async_trait]
impl Stage for RuleStage {
  fn name(&self) -> &'static str {
    "rules"
  }

  fn placement(&self) -> Placement {
    Placement::Wrap
  }

  async fn on_request(&self, exchange: &mut Exchange) -> Result<Flow> {
    let url = exchange.url();
    let path_and_query = exchange
      .request
      .uri
      .path_and_query()
      .map(|p| p.as_str().to_string())
      .unwrap_or_else(|| "/".to_string());
    let plan = self.engine.evaluate(&MatchInput {
      method: exchange.request.method.as_str(),
      url: &url,
      path_and_query: &path_and_query,
      headers: &exchange.request.headers,
    });
    if plan.matched.is_empty() {
      return Ok(Flow::Continue);
    }
    tracing::debug!(
      "[rules] {} matched {:?}",
      url,
      plan.matched.iter().map(|m| m.name.as_str()).collect::<Vec<_>>()
    );
    exchange.matched = plan.matched;
    exchange.response_mutations = plan.response;

    let target = &mut exchange.target;
    plan.request.apply(&mut target.headers, &mut target.body);
    if let Some(redirect) = &plan.request.redirect {
      let uri: Uri = redirect
        .parse()
        .map_err(|e| Error::invalid_request(format!("Invalid redirect URL {}: {}", redirect, e)))?;
      let authority = uri
        .authority()
        .ok_or_else(|| Error::invalid_request(format!("Redirect URL {} is not absolute", redirect)))?;
      let host = HeaderValue::from_str(authority.as_str()).map_err(|e| Error::invalid_request(e.to_string()))?;
      target.headers.insert(HOST, host);
      target.uri = uri;
    }

    if let Some(delay) = plan.delay {
      tokio::time::sleep(delay).await;
    }
    if let Some(mock) = plan.mock {
      exchange.mocked = true;
      exchange.response = Some(ExchangeResponse::new(mock.status, mock.headers, mock.body));
      return Ok(Flow::Respond);
    }
    Ok(Flow::Continue)
  }

  async fn on_response(&self, exchange: &mut Exchange) -> Result<()> {
    // error responses reach the client untouched
    if exchange.response_mutations.is_empty() || exchange.error.is_some() {
      return Ok(());
    }
    if let Some(response) = exchange.response.as_mut() {
      exchange
        .response_mutations
        .apply(&mut response.status, &mut response.headers, &mut response.body);
      if exchange.response_mutations.status.is_some() {
        response.reason = None;
      }
    }
    Ok(())
  }
}

/// Announces the request about to leave the proxy, as mutated by the rules
pub struct RequestLogStage {
  events: EventBus,
}

#[async_trait::async_trait]
impl Stage for RequestLogStage {
  fn name(&self) -> &'static str {
    "request-log"
  }

  async fn on_request(&self, exchange: &mut Exchange) -> Result<Flow> {
    let target = &exchange.target;
    tracing::debug!("[proxy] {} {} -> {}", target.method, exchange.url(), target.uri);
    self.events.emit(ProxyEvent::RequestLogged {
      id: exchange.id.clone(),
      method: target.method.to_string(),
      url: target.uri.to_string(),
    });
    Ok(Flow::Continue)
  }
}

/// Sends the target to the origin
pub struct ForwardStage {
  forwarder: Forwarder,
}

#[async_trait::async_trait]
impl Stage for ForwardStage {
  fn name(&self) -> &'static str {
    "forward"
  }

  async fn on_request(&self, exchange: &mut Exchange) -> Result<Flow> {
    let response = self.forwarder.send(&exchange.target).await?;
    exchange.response = Some(response);
    Ok(Flow::Respond)
  }
}

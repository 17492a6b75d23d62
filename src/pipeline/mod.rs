//! Request pipeline
//!
//! Stages run their request phase in registration order. A [`Placement::Wrap`]
//! stage also gets a response phase, run after everything registered after it
//! has finished, in reverse registration order. A stage ends the request phase
//! early by returning [`Flow::Respond`] once it has set the response; wrap
//! stages already entered still see that response.
//!
//! Failures and panics in a request phase become an error response before any
//! response phase runs, so failed exchanges are logged and scored like the
//! rest. Failures in a response phase are logged and leave the response alone.

pub mod stages;

use crate::error::{Error, Result};
use crate::exchange::{Exchange, ExchangeResponse};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub use stages::{
  ForwardStage, LoopbackGuard, RequestLogStage, ResponseLogStage, RuleStage, StateInit, TestScriptStage,
  LOOPBACK_MESSAGE,
};

/// Whether a stage also runs after the response exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
  Inline,
  Wrap,
}

/// What the pipeline does after a request phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
  Continue,
  /// `exchange.response` is set, skip the remaining request phases
  Respond,
}

#[async_trait::async_trait]
pub trait Stage: Send + Sync {
  fn name(&self) -> &'static str;

  fn placement(&self) -> Placement {
    Placement::Inline
  }

  async fn on_request(&self, exchange: &mut Exchange) -> Result<Flow>;

  async fn on_response(&self, _exchange: &mut Exchange) -> Result<()> {
    Ok(())
  }
}

#[derive(Default, Clone)]
pub struct Pipeline {
  stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a stage
  pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
    self.stages.push(Arc::new(stage));
    self
  }

  pub fn stage_names(&self) -> Vec<&'static str> {
    self.stages.iter().map(|s| s.name()).collect()
  }

  /// Drive `exchange` through every stage; always leaves a response behind
  pub async fn handle(&self, exchange: &mut Exchange) -> ExchangeResponse {
    let mut entered: Vec<&Arc<dyn Stage>> = Vec::new();
    for stage in &self.stages {
      if stage.placement() == Placement::Wrap {
        entered.push(stage);
      }
      let outcome = AssertUnwindSafe(stage.on_request(exchange)).catch_unwind().await;
      match outcome {
        Ok(Ok(Flow::Continue)) => {}
        Ok(Ok(Flow::Respond)) => break,
        Ok(Err(e)) => {
          error_response(exchange, &e);
          break;
        }
        Err(panic) => {
          let e = Error::other(format!("{} stage panicked: {}", stage.name(), panic_message(&*panic)));
          error_response(exchange, &e);
          break;
        }
      }
    }
    if exchange.response.is_none() {
      error_response(exchange, &Error::other("no response was produced"));
    }
    for stage in entered.into_iter().rev() {
      let outcome = AssertUnwindSafe(stage.on_response(exchange)).catch_unwind().await;
      match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("[proxy] {} response hook failed: {}", stage.name(), e),
        Err(panic) => tracing::error!(
          "[proxy] {} response hook panicked: {}",
          stage.name(),
          panic_message(&*panic)
        ),
      }
    }
    match &exchange.response {
      Some(response) => response.clone(),
      None => ExchangeResponse::text(http::StatusCode::INTERNAL_SERVER_ERROR, "Proxy Error: no response"),
    }
  }
}

/// The outer error boundary
fn error_response(exchange: &mut Exchange, error: &Error) {
  let message = match error {
    Error::Upstream(msg) | Error::Other(msg) | Error::InvalidRequest(msg) => msg.clone(),
    e => e.to_string(),
  };
  tracing::warn!("[proxy] {} {} failed: {}", exchange.request.method, exchange.url(), message);
  exchange.error = Some(message.clone());
  exchange.response = Some(ExchangeResponse::text(
    error.status_code(),
    format!("Proxy Error: {}", message),
  ));
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::exchange::ClientRequest;
  use bytes::Bytes;
  use http::{HeaderMap, Method, StatusCode, Uri, Version};
  use parking_lot::Mutex;

  struct Recorder {
    name: &'static str,
    placement: Placement,
    trace: Arc<Mutex<Vec<String>>>,
    outcome: fn(&mut Exchange) -> Result<Flow>,
  }

  #[async_trait::async_trait]
  impl Stage for Recorder {
    fn name(&self) -> &'static str {
      self.name
    }

    fn placement(&self) -> Placement {
      self.placement
    }

    async fn on_request(&self, exchange: &mut Exchange) -> Result<Flow> {
      self.trace.lock().push(format!("{}:req", self.name));
      (self.outcome)(exchange)
    }

    async fn on_response(&self, exchange: &mut Exchange) -> Result<()> {
      let status = exchange.response.as_ref().map(|r| r.status.as_u16()).unwrap_or(0);
      self.trace.lock().push(format!("{}:resp:{}", self.name, status));
      Ok(())
    }
  }

  fn exchange() -> Exchange {
    Exchange::new(
      "127.0.0.1:1".parse().unwrap(),
      ClientRequest {
        method: Method::GET,
        uri: Uri::from_static("http://a.test/"),
        version: Version::HTTP_11,
        headers: HeaderMap::new(),
        body: Bytes::new(),
      },
    )
  }

  fn recorder(
    name: &'static str,
    placement: Placement,
    trace: &Arc<Mutex<Vec<String>>>,
    outcome: fn(&mut Exchange) -> Result<Flow>,
  ) -> Recorder {
    Recorder {
      name,
      placement,
      trace: trace.clone(),
      outcome,
    }
  }

  fn respond_ok(exchange: &mut Exchange) -> Result<Flow> {
    exchange.response = Some(ExchangeResponse::text(StatusCode::OK, "ok"));
    Ok(Flow::Respond)
  }

  #[tokio::test]
  async fn wraps_unwind_in_reverse_order() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new()
      .stage(recorder("outer", Placement::Wrap, &trace, |_| Ok(Flow::Continue)))
      .stage(recorder("inline", Placement::Inline, &trace, |_| Ok(Flow::Continue)))
      .stage(recorder("inner", Placement::Wrap, &trace, |_| Ok(Flow::Continue)))
      .stage(recorder("terminal", Placement::Inline, &trace, respond_ok))
      .stage(recorder("skipped", Placement::Wrap, &trace, |_| Ok(Flow::Continue)));
    let mut ex = exchange();
    let response = pipeline.handle(&mut ex).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
      *trace.lock(),
      vec![
        "outer:req",
        "inline:req",
        "inner:req",
        "terminal:req",
        "inner:resp:200",
        "outer:resp:200"
      ]
    );
  }

  #[tokio::test]
  async fn errors_become_500_before_response_hooks() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new()
      .stage(recorder("log", Placement::Wrap, &trace, |_| Ok(Flow::Continue)))
      .stage(recorder("fail", Placement::Inline, &trace, |_| {
        Err(Error::upstream_error("origin unreachable"))
      }));
    let mut ex = exchange();
    let response = pipeline.handle(&mut ex).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(&response.body[..], b"Proxy Error: origin unreachable");
    assert_eq!(
      response.headers.get("content-type").unwrap(),
      "text/plain;charset=utf-8"
    );
    assert_eq!(trace.lock().last().unwrap(), "log:resp:500");
    assert_eq!(ex.error.as_deref(), Some("origin unreachable"));
  }

  #[tokio::test]
  async fn panics_are_contained() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new()
      .stage(recorder("log", Placement::Wrap, &trace, |_| Ok(Flow::Continue)))
      .stage(recorder("boom", Placement::Inline, &trace, |_| panic!("kaboom")));
    let mut ex = exchange();
    let response = pipeline.handle(&mut ex).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(String::from_utf8_lossy(&response.body).contains("kaboom"));
    assert_eq!(trace.lock().last().unwrap(), "log:resp:500");
  }

  #[tokio::test]
  async fn missing_response_is_an_error() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new().stage(recorder("noop", Placement::Inline, &trace, |_| Ok(Flow::Continue)));
    let mut ex = exchange();
    let response = pipeline.handle(&mut ex).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
  }
}

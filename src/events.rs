//! Notifications for whoever renders the traffic (UI, CLI)

use crate::exchange::ExchangeLog;
use crate::script::{PrintLog, TestResult};
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum ProxyEvent {
  /// A completed exchange entered the log store
  ProxyLogAppended(Box<ExchangeLog>),
  /// A request passed rule matching and is about to be forwarded or mocked
  #[serde(rename_all = "camelCase")]
  RequestLogged { id: String, method: String, url: String },
  TestResultUpdated(TestResult),
  PrintLogAppended(PrintLog),
}

/// Broadcast bus; slow subscribers lag instead of blocking the proxy
#[derive(Debug, Clone)]
pub struct EventBus {
  sender: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
    self.sender.subscribe()
  }

  /// Never fails: having no subscriber is normal
  pub fn emit(&self, event: ProxyEvent) {
    let _ = self.sender.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn emit_without_subscribers_is_fine() {
    let bus = EventBus::default();
    bus.emit(ProxyEvent::RequestLogged {
      id: "1".into(),
      method: "GET".into(),
      url: "http://a.test/".into(),
    });
    let mut rx = bus.subscribe();
    bus.emit(ProxyEvent::RequestLogged {
      id: "2".into(),
      method: "GET".into(),
      url: "http://a.test/".into(),
    });
    match rx.recv().await.unwrap() {
      ProxyEvent::RequestLogged { id, .. } => assert_eq!(id, "2"),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn events_serialize_with_tag() {
    let event = ProxyEvent::RequestLogged {
      id: "1".into(),
      method: "GET".into(),
      url: "u".into(),
    };
    let value = serde_json::to_value(event).unwrap();
    assert_eq!(value["event"], "requestLogged");
    assert_eq!(value["payload"]["method"], "GET");
  }
}

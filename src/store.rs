//! Bounded in-memory capture stores
//!
//! Proxy logs, test results and script prints each live in a [`CaptureStore`]:
//! a fixed-capacity FIFO guarded by its own mutex. Appending to a full store
//! evicts the oldest entry.

use crate::config::ProxyConfig;
use crate::exchange::ExchangeLog;
use crate::script::{PrintLog, TestResult};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Entries addressable by id
pub trait Captured: Clone + Send + 'static {
  fn capture_id(&self) -> &str;
}

/// Fixed-capacity FIFO of captured entries
#[derive(Debug)]
pub struct CaptureStore<T> {
  capacity: usize,
  entries: Mutex<VecDeque<T>>,
}

impl<T: Captured> CaptureStore<T> {
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      capacity,
      entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Append an entry, returning the one evicted to make room
  pub fn append(&self, entry: T) -> Option<T> {
    let mut entries = self.entries.lock();
    let evicted = if entries.len() >= self.capacity {
      entries.pop_front()
    } else {
      None
    };
    entries.push_back(entry);
    evicted
  }

  /// Snapshot of every entry, oldest first
  pub fn get_all(&self) -> Vec<T> {
    self.entries.lock().iter().cloned().collect()
  }

  /// Most recent entry with `id`
  pub fn get(&self, id: &str) -> Option<T> {
    self
      .entries
      .lock()
      .iter()
      .rev()
      .find(|e| e.capture_id() == id)
      .cloned()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  pub fn clear(&self) {
    self.entries.lock().clear();
  }
}

/// The three stores the proxy writes to
#[derive(Debug)]
pub struct Captures {
  pub logs: CaptureStore<ExchangeLog>,
  pub test_results: CaptureStore<TestResult>,
  pub prints: CaptureStore<PrintLog>,
}

impl Captures {
  pub fn new(config: &ProxyConfig) -> Self {
    Self {
      logs: CaptureStore::new(config.log_capacity),
      test_results: CaptureStore::new(config.test_result_capacity),
      prints: CaptureStore::new(config.print_capacity),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[derive(Clone, Debug, PartialEq)]
  struct Entry(String);

  impl Captured for Entry {
    fn capture_id(&self) -> &str {
      &self.0
    }
  }

  #[test]
  fn evicts_oldest_at_capacity() {
    let store = CaptureStore::new(100);
    for i in 0..100 {
      assert!(store.append(Entry(i.to_string())).is_none());
    }
    let evicted = store.append(Entry("100".to_string()));
    assert_eq!(evicted, Some(Entry("0".to_string())));
    assert_eq!(store.len(), 100);
    assert!(store.get("0").is_none());
    assert_eq!(store.get_all().first(), Some(&Entry("1".to_string())));
    assert_eq!(store.get_all().last(), Some(&Entry("100".to_string())));
  }

  #[test]
  fn get_returns_latest_and_clear_empties() {
    let store = CaptureStore::new(4);
    store.append(Entry("a".to_string()));
    store.append(Entry("b".to_string()));
    assert_eq!(store.get("b"), Some(Entry("b".to_string())));
    store.clear();
    assert!(store.is_empty());
    assert!(store.get("a").is_none());
  }

  #[test]
  fn concurrent_appends_never_exceed_capacity() {
    let store = Arc::new(CaptureStore::new(50));
    let handles: Vec<_> = (0..8)
      .map(|t| {
        let store = store.clone();
        std::thread::spawn(move || {
          for i in 0..100 {
            store.append(Entry(format!("{}-{}", t, i)));
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(store.len(), 50);
  }
}

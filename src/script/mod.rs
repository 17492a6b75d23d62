//! Test scripts bound to rules
//!
//! After an exchange completes, the script of every matched rule runs against
//! read-only JSON views of the final request and response. Scripts never see
//! the network or the filesystem, run on the blocking pool under a timeout and
//! are bounded by a step budget. Every failure, syntax or runtime, ends up in
//! the [`TestResult`]; nothing propagates to the exchange.

mod eval;
mod lexer;
mod parser;

use crate::rules::MatchedRule;
use crate::store::Captured;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

pub use eval::{Assertion, Interpreter, ScriptOutput, MAX_STEPS};
pub use parser::parse;

/// Syntax error, located by line
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ScriptError {
  pub line: usize,
  pub message: String,
}

impl ScriptError {
  pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
    Self {
      line,
      message: message.into(),
    }
  }
}

/// Outcome of one assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
  pub rule_id: String,
  pub name: String,
  pub passed: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

/// All assertions run for one exchange, keyed by its log id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
  pub id: String,
  pub passed: bool,
  pub results: Vec<AssertionResult>,
  pub errors: Vec<String>,
  pub timestamp: i64,
}

impl Captured for TestResult {
  fn capture_id(&self) -> &str {
    &self.id
  }
}

/// One `print` statement's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintLog {
  pub id: String,
  pub log_id: String,
  pub rule_id: String,
  pub message: String,
  pub timestamp: i64,
}

impl Captured for PrintLog {
  fn capture_id(&self) -> &str {
    &self.id
  }
}

/// Everything produced by the scripts of one exchange
#[derive(Debug, Clone)]
pub struct ScriptReport {
  pub result: TestResult,
  pub prints: Vec<PrintLog>,
}

/// Runs matched rules' scripts off the async workers
#[derive(Debug, Clone)]
pub struct ScriptRunner {
  timeout: Duration,
  max_steps: usize,
}

impl ScriptRunner {
  pub fn new(timeout: Duration) -> Self {
    Self {
      timeout,
      max_steps: MAX_STEPS,
    }
  }

  pub fn with_max_steps(mut self, max_steps: usize) -> Self {
    self.max_steps = max_steps;
    self
  }

  /// Run the scripts of `rules` in match order.
  ///
  /// Returns `None` when no matched rule carries a script.
  pub async fn run(
    &self,
    log_id: &str,
    rules: &[MatchedRule],
    request: Value,
    response: Value,
  ) -> Option<ScriptReport> {
    let jobs: Vec<(String, String, String)> = rules
      .iter()
      .filter_map(|rule| {
        let script = rule.test_script.as_deref()?.trim();
        if script.is_empty() {
          return None;
        }
        Some((rule.id.clone(), rule.name.clone(), script.to_string()))
      })
      .collect();
    if jobs.is_empty() {
      return None;
    }
    let log_id = log_id.to_string();
    let max_steps = self.max_steps;
    let task_log_id = log_id.clone();
    let task = tokio::task::spawn_blocking(move || {
      run_all(&task_log_id, &jobs, &request, &response, max_steps)
    });
    let report = match tokio::time::timeout(self.timeout, task).await {
      Ok(Ok(report)) => report,
      Ok(Err(e)) => {
        tracing::error!("[script] script task for {} failed: {}", log_id, e);
        failed_report(&log_id, format!("script execution failed: {}", e))
      }
      Err(_) => {
        tracing::warn!("[script] scripts for {} timed out after {:?}", log_id, self.timeout);
        failed_report(
          &log_id,
          format!("script timed out after {}ms", self.timeout.as_millis()),
        )
      }
    };
    Some(report)
  }
}

fn failed_report(log_id: &str, error: String) -> ScriptReport {
  ScriptReport {
    result: TestResult {
      id: log_id.to_string(),
      passed: false,
      results: Vec::new(),
      errors: vec![error],
      timestamp: crate::rules::model::now_millis(),
    },
    prints: Vec::new(),
  }
}

fn run_all(
  log_id: &str,
  jobs: &[(String, String, String)],
  request: &Value,
  response: &Value,
  max_steps: usize,
) -> ScriptReport {
  let timestamp = crate::rules::model::now_millis();
  let mut results = Vec::new();
  let mut errors = Vec::new();
  let mut prints = Vec::new();
  for (rule_id, rule_name, script) in jobs {
    let statements = match parse(script) {
      Ok(statements) => statements,
      Err(e) => {
        errors.push(format!("{}: {}", rule_name, e));
        continue;
      }
    };
    let rule = json!({ "id": rule_id, "name": rule_name });
    let output = Interpreter::new(request.clone(), response.clone(), rule)
      .with_max_steps(max_steps)
      .run(&statements);
    results.extend(output.assertions.into_iter().map(|a| AssertionResult {
      rule_id: rule_id.clone(),
      name: a.name,
      passed: a.passed,
      message: a.message,
    }));
    prints.extend(output.prints.into_iter().map(|message| PrintLog {
      id: uuid::Uuid::new_v4().to_string(),
      log_id: log_id.to_string(),
      rule_id: rule_id.clone(),
      message,
      timestamp,
    }));
    if let Some(error) = output.error {
      errors.push(format!("{}: {}", rule_name, error));
    }
  }
  let passed = errors.is_empty() && results.iter().all(|r| r.passed);
  ScriptReport {
    result: TestResult {
      id: log_id.to_string(),
      passed,
      results,
      errors,
      timestamp,
    },
    prints,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rule(id: &str, script: Option<&str>) -> MatchedRule {
    MatchedRule {
      id: id.to_string(),
      name: format!("rule {}", id),
      test_script: script.map(str::to_string),
    }
  }

  #[tokio::test]
  async fn no_scripts_no_report() {
    let runner = ScriptRunner::new(Duration::from_secs(1));
    let rules = vec![rule("a", None), rule("b", Some("  "))];
    assert!(runner.run("log", &rules, Value::Null, Value::Null).await.is_none());
  }

  #[tokio::test]
  async fn scripts_run_in_match_order() {
    let runner = ScriptRunner::new(Duration::from_secs(1));
    let rules = vec![
      rule("a", Some("test \"ok\": response.status == 200\nprint \"from a\"")),
      rule("b", Some("test \"body\": response.json.id == 1")),
    ];
    let response = json!({"status": 200, "json": {"id": 1}});
    let report = runner.run("log-1", &rules, Value::Null, response).await.unwrap();
    assert!(report.result.passed);
    assert_eq!(report.result.id, "log-1");
    let ids: Vec<_> = report.result.results.iter().map(|r| r.rule_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(report.prints.len(), 1);
    assert_eq!(report.prints[0].log_id, "log-1");
    assert_eq!(report.prints[0].message, "from a");
  }

  #[tokio::test]
  async fn syntax_error_becomes_failing_result() {
    let runner = ScriptRunner::new(Duration::from_secs(1));
    let rules = vec![
      rule("a", Some("test \"ok\" response.status == 200")),
      rule("b", Some("test \"fine\": true")),
    ];
    let report = runner.run("log", &rules, Value::Null, Value::Null).await.unwrap();
    assert!(!report.result.passed);
    assert_eq!(report.result.errors.len(), 1);
    assert!(report.result.errors[0].starts_with("rule a: line 1"));
    assert_eq!(report.result.results.len(), 1);
    assert!(report.result.results[0].passed);
  }

  #[tokio::test]
  async fn runaway_script_is_cut_off() {
    let runner = ScriptRunner::new(Duration::from_secs(1)).with_max_steps(10);
    let rules = vec![rule("a", Some("let x = 1 + 1 + 1 + 1 + 1 + 1 + 1 + 1 + 1 + 1 + 1 + 1"))];
    let report = runner.run("log", &rules, Value::Null, Value::Null).await.unwrap();
    assert!(!report.result.passed);
    assert_eq!(report.result.errors.len(), 1);
  }
}

//! Rule tree as stored and exchanged with the UI

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A node of the rule tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuleNode {
  Rule(RuleData),
  Group(RuleGroup),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleData {
  #[serde(default)]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default = "enabled")]
  pub enable: bool,
  #[serde(default)]
  pub update_time: i64,
  #[serde(default)]
  pub matches: RuleMatch,
  #[serde(default)]
  pub actions: Vec<RuleAction>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub test_script: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroup {
  #[serde(default)]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default = "enabled")]
  pub enable: bool,
  #[serde(default)]
  pub update_time: i64,
  #[serde(default)]
  pub rule_list: Vec<RuleNode>,
}

fn enabled() -> bool {
  true
}

/// Conditions a request must satisfy; all present conditions must hold
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
  /// Case-insensitive method; `None` or `"*"` matches any
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub method: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<UrlPattern>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub headers: Vec<HeaderCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlPattern {
  #[serde(rename = "type", default)]
  pub kind: UrlMatchType,
  pub value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlMatchType {
  #[default]
  Contains,
  Equals,
  Prefix,
  Wildcard,
  Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderCondition {
  pub name: String,
  #[serde(default)]
  pub op: HeaderOp,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOp {
  Equals,
  Contains,
  Regex,
  #[default]
  Exists,
  Absent,
}

/// One mutation, applied in list order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RuleAction {
  SetRequestHeader {
    name: String,
    value: String,
  },
  RemoveRequestHeader {
    name: String,
  },
  SetRequestBody {
    body: String,
  },
  SetResponseHeader {
    name: String,
    value: String,
  },
  RemoveResponseHeader {
    name: String,
  },
  SetStatus {
    status: u16,
  },
  SetResponseBody {
    body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
  },
  Delay {
    ms: u64,
  },
  /// Forward to another URL ("map remote")
  Redirect {
    url: String,
  },
  /// Answer locally without contacting the origin
  Mock {
    #[serde(default = "ok_status")]
    status: u16,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: String,
  },
}

fn ok_status() -> u16 {
  200
}

/// The persisted rule blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStorage {
  #[serde(default)]
  pub api_rules: Vec<RuleNode>,
  #[serde(default)]
  pub updated_at: i64,
  /// Remote sync bookkeeping, passed through untouched
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sync_info: Option<Value>,
}

impl RuleNode {
  pub fn id(&self) -> &str {
    match self {
      RuleNode::Rule(r) => &r.id,
      RuleNode::Group(g) => &g.id,
    }
  }

  pub fn name(&self) -> &str {
    match self {
      RuleNode::Rule(r) => &r.name,
      RuleNode::Group(g) => &g.name,
    }
  }

  pub fn enabled(&self) -> bool {
    match self {
      RuleNode::Rule(r) => r.enable,
      RuleNode::Group(g) => g.enable,
    }
  }

  pub fn is_group(&self) -> bool {
    matches!(self, RuleNode::Group(_))
  }

  pub fn set_id(&mut self, id: String) {
    match self {
      RuleNode::Rule(r) => r.id = id,
      RuleNode::Group(g) => g.id = id,
    }
  }

  pub fn set_name(&mut self, name: String) {
    match self {
      RuleNode::Rule(r) => r.name = name,
      RuleNode::Group(g) => g.name = name,
    }
  }

  pub fn set_enable(&mut self, enable: bool) {
    match self {
      RuleNode::Rule(r) => r.enable = enable,
      RuleNode::Group(g) => g.enable = enable,
    }
  }

  pub fn touch(&mut self, now: i64) {
    match self {
      RuleNode::Rule(r) => r.update_time = now,
      RuleNode::Group(g) => g.update_time = now,
    }
  }
}

/// Depth-first lookup by id
#[cfg(test)]
pub fn find<'a>(nodes: &'a [RuleNode], id: &str) -> Option<&'a RuleNode> {
  for node in nodes {
    if node.id() == id {
      return Some(node);
    }
    if let RuleNode::Group(group) = node {
      if let Some(found) = find(&group.rule_list, id) {
        return Some(found);
      }
    }
  }
  None
}

pub fn find_mut<'a>(nodes: &'a mut [RuleNode], id: &str) -> Option<&'a mut RuleNode> {
  for node in nodes.iter_mut() {
    if node.id() == id {
      return Some(node);
    }
    if let RuleNode::Group(group) = node {
      if let Some(found) = find_mut(&mut group.rule_list, id) {
        return Some(found);
      }
    }
  }
  None
}

/// Detach the node with `id` from the list that directly owns it
pub fn remove(nodes: &mut Vec<RuleNode>, id: &str) -> Option<RuleNode> {
  if let Some(index) = nodes.iter().position(|n| n.id() == id) {
    return Some(nodes.remove(index));
  }
  nodes.iter_mut().find_map(|node| match node {
    RuleNode::Group(group) => remove(&mut group.rule_list, id),
    RuleNode::Rule(_) => None,
  })
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
  (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn tree() -> Vec<RuleNode> {
    serde_json::from_value(json!([
      {"kind": "rule", "id": "r1", "name": "top"},
      {"kind": "group", "id": "g1", "name": "group", "ruleList": [
        {"kind": "rule", "id": "r2", "name": "inner", "enable": false},
        {"kind": "group", "id": "g2", "name": "nested", "ruleList": [
          {"kind": "rule", "id": "r3", "name": "deep"}
        ]}
      ]}
    ]))
    .unwrap()
  }

  #[test]
  fn deserializes_tagged_tree_with_defaults() {
    let nodes = tree();
    assert!(nodes[0].enabled());
    assert!(nodes[1].is_group());
    assert!(!find(&nodes, "r2").unwrap().enabled());
    assert_eq!(find(&nodes, "r3").unwrap().name(), "deep");
  }

  #[test]
  fn actions_use_type_discriminator() {
    let actions: Vec<RuleAction> = serde_json::from_value(json!([
      {"type": "setResponseBody", "body": "{}", "contentType": "application/json"},
      {"type": "mock", "body": "hi"},
      {"type": "delay", "ms": 10}
    ]))
    .unwrap();
    assert_eq!(
      actions[0],
      RuleAction::SetResponseBody {
        body: "{}".to_string(),
        content_type: Some("application/json".to_string())
      }
    );
    assert!(matches!(actions[1], RuleAction::Mock { status: 200, .. }));
    let back = serde_json::to_value(&actions[0]).unwrap();
    assert_eq!(back["contentType"], "application/json");
  }

  #[test]
  fn remove_detaches_from_owner_only() {
    let mut nodes = tree();
    let removed = remove(&mut nodes, "r3").unwrap();
    assert_eq!(removed.id(), "r3");
    assert!(find(&nodes, "g2").is_some());
    assert!(find(&nodes, "r3").is_none());
    assert!(remove(&mut nodes, "missing").is_none());
    assert_eq!(nodes.len(), 2);
  }
}

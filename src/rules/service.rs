//! Rule storage operations
//!
//! Every mutation is a read-modify-write of the whole [`RuleStorage`] blob
//! under one writer lock. After a successful write the runtime snapshot is
//! rebuilt; a failed write leaves both the blob and the snapshot untouched.

use super::engine::RuleEngine;
use super::model::{self, now_millis, RuleNode, RuleStorage};
use crate::config::RULE_STORAGE_KEY;
use crate::error::{Error, Result};
use crate::persist::KeyValueStore;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

const USER_DATA_NOT_FOUND: &str = "User data not found";
const RULES_NOT_FOUND: &str = "Rules not found";
const RULE_NOT_FOUND: &str = "Rule not found";
const GROUP_NOT_FOUND: &str = "Group not found";

#[derive(Debug, Clone, Default)]
pub struct AddRuleOptions {
  /// Append into this group instead of the top level
  pub group_id: Option<String>,
  /// Alternate storage key; defaults to `"rules"`
  pub storage_key: Option<String>,
}

pub struct RuleService {
  store: Arc<dyn KeyValueStore>,
  engine: Arc<RuleEngine>,
  write_lock: Mutex<()>,
}

impl RuleService {
  pub fn new(store: Arc<dyn KeyValueStore>, engine: Arc<RuleEngine>) -> Self {
    Self {
      store,
      engine,
      write_lock: Mutex::new(()),
    }
  }

  pub fn engine(&self) -> &Arc<RuleEngine> {
    &self.engine
  }

  /// Publish the stored rules to the engine; used at startup
  pub async fn load_runtime_rules(&self) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    let rules = self
      .load(RULE_STORAGE_KEY)?
      .map(|s| s.api_rules)
      .unwrap_or_default();
    self.engine.update(&rules);
    tracing::info!("[rules] loaded {} top-level rule nodes", rules.len());
    Ok(())
  }

  fn load(&self, key: &str) -> Result<Option<RuleStorage>> {
    match self.store.get(key)? {
      Some(value) => Ok(Some(serde_json::from_value(value)?)),
      None => Ok(None),
    }
  }

  fn load_existing(&self) -> Result<RuleStorage> {
    let storage = self
      .load(RULE_STORAGE_KEY)?
      .ok_or_else(|| Error::not_found(USER_DATA_NOT_FOUND))?;
    if storage.api_rules.is_empty() {
      return Err(Error::not_found(RULES_NOT_FOUND));
    }
    Ok(storage)
  }

  fn commit(&self, key: &str, storage: &RuleStorage) -> Result<()> {
    self.store.set(key, &serde_json::to_value(storage)?)?;
    if key == RULE_STORAGE_KEY {
      self.engine.update(&storage.api_rules);
    }
    Ok(())
  }

  /// Add a rule or group, returning it with its assigned id
  pub async fn add_rule(&self, mut rule: RuleNode, opts: AddRuleOptions) -> Result<RuleNode> {
    let _guard = self.write_lock.lock().await;
    let key = opts.storage_key.as_deref().unwrap_or(RULE_STORAGE_KEY);
    let mut storage = self.load(key)?.unwrap_or_default();

    let mut taken = HashSet::new();
    collect_ids(&storage.api_rules, &mut taken);
    rule.set_id(uuid::Uuid::new_v4().to_string());
    if let RuleNode::Group(group) = &mut rule {
      assign_missing_ids(&mut group.rule_list, &mut taken);
    }
    let now = now_millis();
    rule.touch(now);

    match &opts.group_id {
      Some(group_id) => match model::find_mut(&mut storage.api_rules, group_id) {
        Some(RuleNode::Group(group)) => group.rule_list.push(rule.clone()),
        _ => return Err(Error::not_found(GROUP_NOT_FOUND)),
      },
      None => storage.api_rules.push(rule.clone()),
    }
    storage.updated_at = now;
    self.commit(key, &storage)?;
    tracing::debug!("[rules] added {} {}", if rule.is_group() { "group" } else { "rule" }, rule.id());
    Ok(rule)
  }

  /// Shallow-merge `patch` into the node with `id`; `id` and `kind` are kept
  pub async fn update_rule(&self, id: &str, patch: Value) -> Result<RuleNode> {
    let Value::Object(patch) = patch else {
      return Err(Error::invalid_request("rule patch must be a JSON object"));
    };
    let _guard = self.write_lock.lock().await;
    let mut storage = self.load_existing()?;
    let node = model::find_mut(&mut storage.api_rules, id).ok_or_else(|| Error::not_found(RULE_NOT_FOUND))?;

    let now = now_millis();
    let mut merged = serde_json::to_value(&*node)?;
    if let Value::Object(fields) = &mut merged {
      for (k, v) in patch {
        if k != "id" && k != "kind" {
          fields.insert(k, v);
        }
      }
      fields.insert("updateTime".to_string(), Value::from(now));
    }
    let updated: RuleNode = serde_json::from_value(merged)
      .map_err(|e| Error::invalid_request(format!("invalid rule patch: {}", e)))?;
    *node = updated.clone();
    ensure_unique_ids(&storage.api_rules)?;
    storage.updated_at = now;
    self.commit(RULE_STORAGE_KEY, &storage)?;
    Ok(updated)
  }

  pub async fn enable_rule(&self, id: &str, enable: bool) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    let mut storage = self.load_existing()?;
    let node = model::find_mut(&mut storage.api_rules, id).ok_or_else(|| Error::not_found(RULE_NOT_FOUND))?;
    let now = now_millis();
    node.set_enable(enable);
    node.touch(now);
    storage.updated_at = now;
    self.commit(RULE_STORAGE_KEY, &storage)
  }

  pub async fn rename_group(&self, id: &str, name: &str) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    let mut storage = self.load_existing()?;
    let node = model::find_mut(&mut storage.api_rules, id).ok_or_else(|| Error::not_found(RULE_NOT_FOUND))?;
    let now = now_millis();
    node.set_name(name.to_string());
    node.touch(now);
    storage.updated_at = now;
    self.commit(RULE_STORAGE_KEY, &storage)
  }

  /// Remove a rule or a whole group from the list that owns it
  pub async fn delete_rule(&self, id: &str) -> Result<RuleNode> {
    let _guard = self.write_lock.lock().await;
    let mut storage = self.load_existing()?;
    let removed = model::remove(&mut storage.api_rules, id).ok_or_else(|| Error::not_found(RULE_NOT_FOUND))?;
    storage.updated_at = now_millis();
    self.commit(RULE_STORAGE_KEY, &storage)?;
    tracing::debug!("[rules] deleted {}", id);
    Ok(removed)
  }

  /// Stored tree, empty when nothing was saved yet
  pub fn get_api_rules(&self) -> Result<Vec<RuleNode>> {
    Ok(self.load(RULE_STORAGE_KEY)?.map(|s| s.api_rules).unwrap_or_default())
  }

  pub fn get_rule_storage(&self) -> Result<Option<RuleStorage>> {
    self.load(RULE_STORAGE_KEY)
  }

  pub async fn set_sync_info(&self, sync_info: Value) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    let mut storage = self
      .load(RULE_STORAGE_KEY)?
      .ok_or_else(|| Error::not_found(USER_DATA_NOT_FOUND))?;
    storage.sync_info = Some(sync_info);
    self.commit(RULE_STORAGE_KEY, &storage)
  }

  /// Drop synced rules; only allowed while sync info is present
  pub async fn clean_rule_data(&self) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    let mut storage = self
      .load(RULE_STORAGE_KEY)?
      .filter(|s| s.sync_info.is_some())
      .ok_or_else(|| Error::not_found(USER_DATA_NOT_FOUND))?;
    storage.sync_info = None;
    storage.api_rules.clear();
    storage.updated_at = 0;
    self.commit(RULE_STORAGE_KEY, &storage)
  }

  /// Replace the tree with rules pulled from the sync service
  pub async fn init_server_rules(&self, rules: Vec<RuleNode>, sync_info: Value) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    let mut storage = self
      .load(RULE_STORAGE_KEY)?
      .ok_or_else(|| Error::not_found(USER_DATA_NOT_FOUND))?;
    ensure_unique_ids(&rules)?;
    storage.updated_at = sync_date_millis(&sync_info).unwrap_or_else(now_millis);
    storage.api_rules = rules;
    storage.sync_info = Some(sync_info);
    self.commit(RULE_STORAGE_KEY, &storage)
  }
}

fn collect_ids(nodes: &[RuleNode], out: &mut HashSet<String>) {
  for node in nodes {
    out.insert(node.id().to_string());
    if let RuleNode::Group(group) = node {
      collect_ids(&group.rule_list, out);
    }
  }
}

/// Every node in the tree must carry its own id
fn ensure_unique_ids(nodes: &[RuleNode]) -> Result<()> {
  let mut seen = HashSet::new();
  let mut pending: Vec<&RuleNode> = nodes.iter().collect();
  while let Some(node) = pending.pop() {
    if !seen.insert(node.id()) {
      return Err(Error::invalid_request(format!("duplicate rule id {}", node.id())));
    }
    if let RuleNode::Group(group) = node {
      pending.extend(group.rule_list.iter());
    }
  }
  Ok(())
}

fn assign_missing_ids(nodes: &mut [RuleNode], taken: &mut HashSet<String>) {
  for node in nodes.iter_mut() {
    if node.id().is_empty() || !taken.insert(node.id().to_string()) {
      let id = uuid::Uuid::new_v4().to_string();
      taken.insert(id.clone());
      node.set_id(id);
    }
    if let RuleNode::Group(group) = node {
      assign_missing_ids(&mut group.rule_list, taken);
    }
  }
}

/// `syncDate` as epoch millis, given as a number or an RFC 3339 string
fn sync_date_millis(sync_info: &Value) -> Option<i64> {
  match sync_info.get("syncDate")? {
    Value::Number(n) => n.as_i64(),
    Value::String(s) => {
      let date = time::OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339).ok()?;
      Some((date.unix_timestamp_nanos() / 1_000_000) as i64)
    }
    _ => None,
  }
}

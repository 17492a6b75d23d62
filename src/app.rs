//! Application facade
//!
//! [`ApiTune`] wires every component together and exposes the operations a
//! desktop shell would bind to its UI: certificate management, rule storage,
//! settings, the listener port and the capture stores.

use crate::ca::{CertificateManager, RootCaPaths, SystemTrustStore, TrustStore};
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, ProxyEvent};
use crate::exchange::ExchangeLog;
use crate::forward::Forwarder;
use crate::persist::{JsonFileStore, KeyValueStore};
use crate::pipeline::stages;
use crate::rules::{AddRuleOptions, RuleEngine, RuleNode, RuleService, RuleStorage};
use crate::script::{PrintLog, ScriptRunner, TestResult};
use crate::server::{Dispatcher, ProxyServer};
use crate::settings::{self, Settings, Theme};
use crate::store::Captures;
use serde::Serialize;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Root CA state as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaStatus {
  pub exists: bool,
  pub trusted: bool,
  pub installed: bool,
  pub cert_path: PathBuf,
}

/// Builder for [`ApiTune`]; persistence and trust store can be swapped out
#[derive(Default)]
pub struct ApiTuneBuilder {
  config: Option<ProxyConfig>,
  store: Option<Arc<dyn KeyValueStore>>,
  trust_store: Option<Arc<dyn TrustStore>>,
}

impl ApiTuneBuilder {
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = Some(config);
    self
  }

  pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn trust_store(mut self, trust_store: Arc<dyn TrustStore>) -> Self {
    self.trust_store = Some(trust_store);
    self
  }

  /// Build the core and load persisted rules. The listener is not started.
  pub async fn build(self) -> Result<ApiTune> {
    let config = self.config.unwrap_or_default();
    let store: Arc<dyn KeyValueStore> = match self.store {
      Some(store) => store,
      None => Arc::new(JsonFileStore::new(config.storage_path())?),
    };
    let trust_store = self
      .trust_store
      .unwrap_or_else(|| Arc::new(SystemTrustStore::default()));
    let certs = Arc::new(CertificateManager::with_trust_store(&config, trust_store));
    let engine = Arc::new(RuleEngine::new());
    let rules = RuleService::new(store.clone(), engine.clone());
    rules.load_runtime_rules().await?;

    let captures = Arc::new(Captures::new(&config));
    let events = EventBus::default();
    let forwarder = Forwarder::new(&config)?;
    let pipeline = stages::standard(
      engine,
      forwarder.clone(),
      ScriptRunner::new(config.script_timeout),
      captures.clone(),
      events.clone(),
    );
    let dispatcher = Arc::new(Dispatcher::new(&config, certs.clone(), pipeline, forwarder));
    let server = ProxyServer::new(dispatcher, config.listen_host);
    Ok(ApiTune {
      config,
      store,
      certs,
      rules,
      captures,
      events,
      server,
    })
  }
}

pub struct ApiTune {
  config: ProxyConfig,
  store: Arc<dyn KeyValueStore>,
  certs: Arc<CertificateManager>,
  rules: RuleService,
  captures: Arc<Captures>,
  events: EventBus,
  server: ProxyServer,
}

impl ApiTune {
  pub fn builder() -> ApiTuneBuilder {
    ApiTuneBuilder::default()
  }

  /// Core with file-backed persistence under `config.data_dir`
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    Self::builder().config(config).build().await
  }

  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  pub fn certificates(&self) -> &Arc<CertificateManager> {
    &self.certs
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
    self.events.subscribe()
  }

  /// Start listening on `port`, or on the persisted port when `None`.
  /// With interception enabled the root CA is loaded or created first.
  pub async fn start(&self, port: Option<u16>) -> Result<SocketAddr> {
    if self.config.enable_https_interception {
      self.certs.ensure_root_ca().await?;
    }
    let port = match port {
      Some(port) => port,
      None => self.settings()?.port,
    };
    self.server.start(port).await
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.server.local_addr()
  }

  pub async fn shutdown(&self) {
    self.server.shutdown().await;
  }

  // certificates

  pub fn ca_status(&self) -> CaStatus {
    CaStatus {
      exists: self.certs.root_ca_exists(),
      trusted: self.certs.is_root_ca_trusted(),
      installed: self.certs.is_leaf_cert_installed(),
      cert_path: self.certs.cert_path(),
    }
  }

  pub async fn generate_root_ca(&self) -> Result<RootCaPaths> {
    let paths = self.certs.generate_root_ca().await?;
    tracing::info!("[ca] generated root CA at {}", paths.cert_path.display());
    Ok(paths)
  }

  /// Install the root into the OS trust store
  pub async fn trust_root_ca(&self) -> Result<()> {
    if !self.certs.root_ca_exists() {
      return Err(Error::RootCaMissing);
    }
    if self.certs.is_root_ca_trusted() {
      return Err(Error::TrustStore("Root CA is already trusted".to_string()));
    }
    self.certs.install_root_ca().await
  }

  pub async fn export_root_ca(&self, dest: impl AsRef<Path>) -> Result<()> {
    self.certs.export_root_ca(dest).await
  }

  // rules

  pub async fn add_rule(&self, rule: RuleNode, opts: AddRuleOptions) -> Result<RuleNode> {
    self.rules.add_rule(rule, opts).await
  }

  pub async fn update_rule(&self, id: &str, patch: Value) -> Result<RuleNode> {
    self.rules.update_rule(id, patch).await
  }

  pub async fn enable_rule(&self, id: &str, enable: bool) -> Result<()> {
    self.rules.enable_rule(id, enable).await
  }

  pub async fn rename_group(&self, id: &str, name: &str) -> Result<()> {
    self.rules.rename_group(id, name).await
  }

  pub async fn delete_rule(&self, id: &str) -> Result<RuleNode> {
    self.rules.delete_rule(id).await
  }

  pub fn get_api_rules(&self) -> Result<Vec<RuleNode>> {
    self.rules.get_api_rules()
  }

  pub fn get_rule_storage(&self) -> Result<Option<RuleStorage>> {
    self.rules.get_rule_storage()
  }

  pub async fn set_sync_info(&self, sync_info: Value) -> Result<()> {
    self.rules.set_sync_info(sync_info).await
  }

  pub async fn clean_rule_data(&self) -> Result<()> {
    self.rules.clean_rule_data().await
  }

  pub async fn init_server_rules(&self, rules: Vec<RuleNode>, sync_info: Value) -> Result<()> {
    self.rules.init_server_rules(rules, sync_info).await
  }

  // settings

  pub fn settings(&self) -> Result<Settings> {
    Settings::load(self.store.as_ref())
  }

  /// Move the listener to `port`. The new port is persisted only once it is
  /// serving; on failure the old listener keeps running.
  pub async fn change_port(&self, port: u16) -> Result<()> {
    settings::validate_port(port)?;
    let previous = self
      .server
      .local_addr()
      .filter(|addr| addr.port() != port && self.server.is_running());
    if previous.is_some() {
      self.server.rebind(port).await?;
    }
    if let Err(e) = Settings::update(self.store.as_ref(), |s| s.port = port) {
      // an unsaved port must not stay live
      if let Some(previous) = previous {
        if let Err(rollback) = self.server.rebind(previous.port()).await {
          tracing::error!("[proxy] could not return to port {}: {}", previous.port(), rollback);
        }
      }
      return Err(e);
    }
    Ok(())
  }

  pub fn app_theme(&self) -> Result<Theme> {
    Ok(self.settings()?.theme)
  }

  pub fn change_theme(&self, theme: Theme) -> Result<()> {
    Settings::update(self.store.as_ref(), |s| s.theme = theme).map(|_| ())
  }

  pub fn language(&self) -> Result<String> {
    Ok(self.settings()?.language)
  }

  pub fn change_language(&self, language: &str) -> Result<()> {
    Settings::update(self.store.as_ref(), |s| s.language = language.to_string()).map(|_| ())
  }

  /// LAN address other devices can use to reach the proxy
  pub fn local_ip(&self) -> Option<IpAddr> {
    // connecting a UDP socket sends nothing, it only selects the outbound interface
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
  }

  // capture stores

  pub fn proxy_logs(&self) -> Vec<ExchangeLog> {
    self.captures.logs.get_all()
  }

  pub fn proxy_log(&self, id: &str) -> Result<ExchangeLog> {
    self
      .captures
      .logs
      .get(id)
      .ok_or_else(|| Error::not_found(format!("Log {} not found", id)))
  }

  pub fn clear_proxy_logs(&self) {
    self.captures.logs.clear();
  }

  pub fn test_results(&self) -> Vec<TestResult> {
    self.captures.test_results.get_all()
  }

  pub fn test_result(&self, id: &str) -> Result<TestResult> {
    self
      .captures
      .test_results
      .get(id)
      .ok_or_else(|| Error::not_found(format!("Test result {} not found", id)))
  }

  pub fn clear_test_results(&self) {
    self.captures.test_results.clear();
  }

  pub fn print_logs(&self) -> Vec<PrintLog> {
    self.captures.prints.get_all()
  }

  pub fn clear_print_logs(&self) {
    self.captures.prints.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::persist::MemoryStore;
  use std::path::Path;

  struct NeverTrusted;

  impl TrustStore for NeverTrusted {
    fn contains(&self, _cert: &rustls_pki_types::CertificateDer<'_>) -> bool {
      false
    }

    fn install(&self, _cert_path: &Path) -> Result<()> {
      Err(Error::TrustStore("user cancelled".to_string()))
    }

    fn is_installed(&self, _cert_path: &Path) -> bool {
      false
    }
  }

  async fn app(dir: &Path) -> ApiTune {
    let config = ProxyConfig {
      data_dir: dir.to_path_buf(),
      listen_host: "127.0.0.1".parse().unwrap(),
      ..Default::default()
    };
    ApiTune::builder()
      .config(config)
      .store(Arc::new(MemoryStore::new()))
      .trust_store(Arc::new(NeverTrusted))
      .build()
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn ca_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path()).await;
    assert!(!app.ca_status().exists);
    assert!(matches!(app.trust_root_ca().await, Err(Error::RootCaMissing)));
    assert!(app.export_root_ca(dir.path().join("out.crt")).await.is_err());

    app.generate_root_ca().await.unwrap();
    assert!(matches!(app.generate_root_ca().await, Err(Error::RootCaExists(_))));
    let status = app.ca_status();
    assert!(status.exists && !status.trusted && !status.installed);
    assert!(matches!(app.trust_root_ca().await, Err(Error::TrustStore(_))));

    let out = dir.path().join("out.crt");
    app.export_root_ca(&out).await.unwrap();
    let pem = std::fs::read_to_string(out).unwrap();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    assert!(!pem.contains("PRIVATE KEY"));
  }

  #[tokio::test]
  async fn port_change_persists_only_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path()).await;
    assert!(matches!(app.change_port(80).await, Err(Error::InvalidPort(80))));

    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();
    let addr = app.start(Some(0)).await.unwrap();
    if (settings::MIN_PORT..=settings::MAX_PORT).contains(&taken) {
      assert!(app.change_port(taken).await.is_err());
      assert_eq!(app.local_addr(), Some(addr));
      assert_ne!(app.settings().unwrap().port, taken);
    }
    app.shutdown().await;
    assert!(app.local_addr().is_none());
  }

  struct ReadOnlyStore;

  impl KeyValueStore for ReadOnlyStore {
    fn get(&self, _key: &str) -> Result<Option<serde_json::Value>> {
      Ok(None)
    }

    fn set(&self, _key: &str, _value: &serde_json::Value) -> Result<()> {
      Err(Error::Storage("read-only".to_string()))
    }
  }

  #[tokio::test]
  async fn unsaved_port_change_returns_to_the_old_port() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
      data_dir: dir.path().to_path_buf(),
      listen_host: "127.0.0.1".parse().unwrap(),
      enable_https_interception: false,
      ..Default::default()
    };
    let app = ApiTune::builder()
      .config(config)
      .store(Arc::new(ReadOnlyStore))
      .trust_store(Arc::new(NeverTrusted))
      .build()
      .await
      .unwrap();
    let mut ports = (20000..40000)
      .step_by(89)
      .filter(|port| std::net::TcpListener::bind(("127.0.0.1", *port)).is_ok());
    let (old, new) = (ports.next().unwrap(), ports.next().unwrap());
    app.start(Some(old)).await.unwrap();

    let err = app.change_port(new).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert_eq!(app.local_addr().unwrap().port(), old);
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", new)).await.is_err());
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", old)).await.is_ok());
    app.shutdown().await;
  }

  #[tokio::test]
  async fn settings_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path()).await;
    assert_eq!(app.app_theme().unwrap(), Theme::System);
    app.change_theme(Theme::Dark).unwrap();
    app.change_language("zh").unwrap();
    let settings = app.settings().unwrap();
    assert_eq!(settings.theme, Theme::Dark);
    assert_eq!(settings.language, "zh");
    assert_eq!(settings.port, settings::DEFAULT_PORT);
  }

  #[tokio::test]
  async fn missing_entries_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path()).await;
    assert!(matches!(app.proxy_log("nope"), Err(Error::NotFound(_))));
    assert!(matches!(app.test_result("nope"), Err(Error::NotFound(_))));
    assert!(app.proxy_logs().is_empty());
  }
}

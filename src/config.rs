//! Proxy configuration

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Header stamped on every outbound request; seeing it inbound means the proxy
/// is talking to itself.
pub const PROXY_HEADER: &str = "x-apitune-proxy";

/// Storage key of the rule tree
pub const RULE_STORAGE_KEY: &str = "rules";

/// Storage key of the settings blob
pub const SETTING_STORAGE_KEY: &str = "settings";

/// Configuration for the proxy core
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// Directory holding certificates and persisted blobs
  pub data_dir: PathBuf,
  /// Address the listener binds to
  pub listen_host: IpAddr,
  /// Decrypt CONNECT tunnels; when false they are relayed blindly
  pub enable_https_interception: bool,
  /// Idle read timeout on client connections, in seconds
  pub connection_timeout: u64,
  /// Connect + response timeout for origin requests, in seconds
  pub upstream_timeout: u64,
  /// Skip origin certificate verification
  pub accept_invalid_upstream_certs: bool,
  /// Largest request or response body buffered by the pipeline
  pub max_body_size: usize,
  /// Capacity of the proxy log store
  pub log_capacity: usize,
  /// Capacity of the test result store
  pub test_result_capacity: usize,
  /// Capacity of the script print store
  pub print_capacity: usize,
  /// Upper bound on a single test script run
  pub script_timeout: Duration,
  /// Validity of issued leaf certificates
  pub leaf_cert_ttl: Duration,
  /// Maximum number of cached leaf certificates
  pub cert_cache_capacity: u64,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      data_dir: PathBuf::from(".apitune"),
      listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      enable_https_interception: true,
      connection_timeout: 60,
      upstream_timeout: 30,
      accept_invalid_upstream_certs: false,
      max_body_size: 32 * 1024 * 1024,
      log_capacity: 1000,
      test_result_capacity: 1000,
      print_capacity: 500,
      script_timeout: Duration::from_secs(3),
      leaf_cert_ttl: Duration::from_secs(365 * 24 * 60 * 60),
      cert_cache_capacity: 1000,
    }
  }
}

impl ProxyConfig {
  /// Directory holding `rootCA.crt` / `rootCA.key`
  pub fn ca_storage_path(&self) -> PathBuf {
    self.data_dir.join("certs")
  }

  /// Directory holding the JSON blobs of the persistence store
  pub fn storage_path(&self) -> PathBuf {
    self.data_dir.join("storage")
  }
}

//! Certificate Authority management
//!
//! Owns the persisted root CA (`rootCA.crt` / `rootCA.key`) and issues
//! per-host leaf certificates for intercepted tunnels. Leaves are cached by
//! hostname until they expire; concurrent first requests for the same host
//! share a single issuance.

mod trust;

pub use trust::{SystemTrustStore, TrustStore};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use moka::future::Cache;
use parking_lot::RwLock;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::ServerConfig;

/// File name of the persisted root certificate
pub const ROOT_CA_CERT_FILE: &str = "rootCA.crt";
/// File name of the persisted root private key
pub const ROOT_CA_KEY_FILE: &str = "rootCA.key";
/// Common name of the generated root
pub const ROOT_CA_NAME: &str = "ApiTune Proxy CA";

/// Root validity in days (10 years)
const ROOT_TTL_DAYS: i64 = 3650;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// Paths of a freshly generated root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCaPaths {
  pub key_path: PathBuf,
  pub cert_path: PathBuf,
}

/// A loaded root CA able to sign leaves
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
}

impl CertificateAuthority {
  /// Load a root from its PEM files
  pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;
    let ca_cert_der = parse_cert_pem(&cert_pem)?;

    Ok(Self {
      issuer,
      ca_cert_der,
    })
  }

  /// Generate a new root and write it to `cert_path` / `key_path`
  pub async fn generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_CA_NAME);
    dn.push(DnType::OrganizationName, "ApiTune");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    write_file(cert_path, cert_pem.as_bytes()).await?;
    write_file(key_path, key_pem.as_bytes()).await?;
    restrict_permissions(key_path).await;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to create issuer: {}", e)))?;

    tracing::info!("[ca] generated root CA at {}", cert_path.display());
    Ok(Self {
      issuer,
      ca_cert_der: CertificateDer::from(cert.der().to_vec()),
    })
  }

  /// DER of the root certificate
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Sign a leaf for `hostname` valid for `ttl`
  pub fn issue(&self, hostname: &str, ttl: std::time::Duration) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", hostname))
      })?)]
    };
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];

    let now = OffsetDateTime::now_utc();
    let not_after = now + Duration::milliseconds(ttl.as_millis() as i64);
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign server cert: {}", e)))?;
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize server key"))?;

    let cert_chain = vec![
      CertificateDer::from(cert.der().to_vec()),
      self.ca_cert_der.clone(),
    ];
    let server_config = crate::tls::server_config(cert_chain.clone(), key)?;

    tracing::debug!("[ca] issued leaf certificate for {}", hostname);
    Ok(LeafCertificate {
      hostname: hostname.to_string(),
      cert_chain,
      not_after,
      server_config: Arc::new(server_config),
    })
  }
}

/// A cached leaf certificate and the TLS config presenting it
pub struct LeafCertificate {
  pub hostname: String,
  /// `[leaf, root]`
  pub cert_chain: Vec<CertificateDer<'static>>,
  pub not_after: OffsetDateTime,
  server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
  pub fn leaf_der(&self) -> &CertificateDer<'static> {
    &self.cert_chain[0]
  }

  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }

  pub fn is_expired(&self) -> bool {
    OffsetDateTime::now_utc() >= self.not_after
  }
}

impl std::fmt::Debug for LeafCertificate {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafCertificate")
      .field("hostname", &self.hostname)
      .field("not_after", &self.not_after)
      .finish()
  }
}

/// Root CA lifecycle plus the leaf certificate cache
pub struct CertificateManager {
  storage_path: PathBuf,
  authority: RwLock<Option<Arc<CertificateAuthority>>>,
  cert_cache: Cache<String, Arc<LeafCertificate>>,
  leaf_ttl: std::time::Duration,
  trust_store: Arc<dyn TrustStore>,
}

impl CertificateManager {
  /// Manager over `config.ca_storage_path()` using the system trust store.
  /// Nothing is read or generated until first use.
  pub fn new(config: &ProxyConfig) -> Self {
    Self::with_trust_store(config, Arc::new(SystemTrustStore::default()))
  }

  pub fn with_trust_store(config: &ProxyConfig, trust_store: Arc<dyn TrustStore>) -> Self {
    let cert_cache = Cache::builder()
      .max_capacity(config.cert_cache_capacity)
      .time_to_live(config.leaf_cert_ttl)
      .build();
    Self {
      storage_path: config.ca_storage_path(),
      authority: RwLock::new(None),
      cert_cache,
      leaf_ttl: config.leaf_cert_ttl,
      trust_store,
    }
  }

  pub fn cert_path(&self) -> PathBuf {
    self.storage_path.join(ROOT_CA_CERT_FILE)
  }

  pub fn key_path(&self) -> PathBuf {
    self.storage_path.join(ROOT_CA_KEY_FILE)
  }

  /// Both root files are present on disk
  pub fn root_ca_exists(&self) -> bool {
    self.cert_path().exists() && self.key_path().exists()
  }

  /// The root is among the roots the OS trusts
  pub fn is_root_ca_trusted(&self) -> bool {
    if !self.root_ca_exists() {
      return false;
    }
    match read_cert_der(&self.cert_path()) {
      Ok(der) => self.trust_store.contains(&der),
      Err(_) => false,
    }
  }

  /// The root has been placed in the platform's install location
  pub fn is_leaf_cert_installed(&self) -> bool {
    self.root_ca_exists() && self.trust_store.is_installed(&self.cert_path())
  }

  /// Generate a new root; refuses to overwrite an existing one
  pub async fn generate_root_ca(&self) -> Result<RootCaPaths> {
    if self.root_ca_exists() {
      return Err(Error::RootCaExists(self.cert_path().display().to_string()));
    }
    fs::create_dir_all(&self.storage_path).await?;
    let authority = CertificateAuthority::generate(&self.cert_path(), &self.key_path()).await?;
    *self.authority.write() = Some(Arc::new(authority));
    // Leaves signed by a previous root would no longer chain
    self.cert_cache.invalidate_all();
    Ok(RootCaPaths {
      key_path: self.key_path(),
      cert_path: self.cert_path(),
    })
  }

  /// Load the root if present, otherwise generate one
  pub async fn ensure_root_ca(&self) -> Result<()> {
    if self.root_ca_exists() {
      self.authority().await.map(|_| ())
    } else {
      self.generate_root_ca().await.map(|_| ())
    }
  }

  /// Ask the OS to trust the root
  pub async fn install_root_ca(&self) -> Result<()> {
    if !self.root_ca_exists() {
      return Err(Error::RootCaMissing);
    }
    let trust_store = self.trust_store.clone();
    let cert_path = self.cert_path();
    tokio::task::spawn_blocking(move || trust_store.install(&cert_path))
      .await
      .map_err(|e| Error::other(format!("trust store task failed: {}", e)))?
  }

  /// Copy the root certificate (never the key) to `dest`
  pub async fn export_root_ca(&self, dest: impl AsRef<Path>) -> Result<()> {
    if !self.root_ca_exists() {
      return Err(Error::RootCaMissing);
    }
    fs::copy(self.cert_path(), dest.as_ref()).await?;
    tracing::info!("[ca] exported root CA to {}", dest.as_ref().display());
    Ok(())
  }

  /// Root certificate in PEM form
  pub async fn root_ca_pem(&self) -> Result<String> {
    if !self.root_ca_exists() {
      return Err(Error::RootCaMissing);
    }
    Ok(fs::read_to_string(self.cert_path()).await?)
  }

  /// Leaf for `hostname`, issued on first use and reused until it expires
  pub async fn issue_leaf_certificate(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
    let host = normalize_host(hostname);
    if host.is_empty() {
      return Err(Error::certificate_error("Empty hostname"));
    }
    let authority = self.authority().await?;

    let leaf = self.get_or_issue(&host, authority.clone()).await?;
    if !leaf.is_expired() {
      return Ok(leaf);
    }
    self.cert_cache.invalidate(&host).await;
    self.get_or_issue(&host, authority).await
  }

  async fn get_or_issue(
    &self,
    host: &str,
    authority: Arc<CertificateAuthority>,
  ) -> Result<Arc<LeafCertificate>> {
    let ttl = self.leaf_ttl;
    let name = host.to_string();
    self
      .cert_cache
      .try_get_with(host.to_string(), async move {
        authority.issue(&name, ttl).map(Arc::new)
      })
      .await
      .map_err(|e| Error::Certificate(format!("Failed to issue certificate for {}: {}", host, e)))
  }

  async fn authority(&self) -> Result<Arc<CertificateAuthority>> {
    let current = self.authority.read().clone();
    if let Some(authority) = current {
      return Ok(authority);
    }
    if !self.root_ca_exists() {
      return Err(Error::RootCaMissing);
    }
    let loaded = Arc::new(CertificateAuthority::load(&self.cert_path(), &self.key_path()).await?);
    let mut slot = self.authority.write();
    Ok(slot.get_or_insert(loaded).clone())
  }
}

fn normalize_host(hostname: &str) -> String {
  hostname
    .trim()
    .trim_start_matches('[')
    .trim_end_matches(']')
    .trim_end_matches('.')
    .to_ascii_lowercase()
}

fn parse_cert_pem(pem: &str) -> Result<CertificateDer<'static>> {
  rustls_pemfile::certs(&mut pem.as_bytes())
    .next()
    .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
    .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))
}

pub(crate) fn read_cert_der(path: &Path) -> Result<CertificateDer<'static>> {
  let pem = std::fs::read_to_string(path)?;
  parse_cert_pem(&pem)
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
  let mut file = fs::File::create(path).await?;
  file.write_all(contents).await?;
  file.flush().await?;
  Ok(())
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
  use std::os::unix::fs::PermissionsExt;
  if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
    tracing::warn!("[ca] could not restrict {}: {}", path.display(), e);
  }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}

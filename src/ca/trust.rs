//! Operating-system trust store access
use crate::error::{Error, Result};
use rustls_pki_types::CertificateDer;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Read and write access to the set of roots the OS trusts
pub trait TrustStore: Send + Sync {
  /// Whether `ca` is currently one of the trusted roots
  fn contains(&self, ca: &CertificateDer<'_>) -> bool;
  /// Ask the OS to trust the PEM certificate at `cert_path`
  fn install(&self, cert_path: &Path) -> Result<()>;
  /// Whether the certificate at `cert_path` sits in the platform's install location
  fn is_installed(&self, cert_path: &Path) -> bool;
}

/// Trust store backed by the platform's native roots and install tooling
#[derive(Debug, Clone)]
pub struct SystemTrustStore {
  anchor_name: String,
}

impl Default for SystemTrustStore {
  fn default() -> Self {
    Self {
      anchor_name: "apitune-root-ca.crt".to_string(),
    }
  }
}

impl SystemTrustStore {
  /// Location `update-ca-certificates` picks local anchors up from
  fn linux_anchor_path(&self) -> PathBuf {
    PathBuf::from("/usr/local/share/ca-certificates").join(&self.anchor_name)
  }

  fn run(program: &str, args: &[&str]) -> Result<()> {
    tracing::info!("[ca] running {} {}", program, args.join(" "));
    let output = Command::new(program).args(args).output().map_err(|e| {
      Error::TrustStore(format!("failed to run {}: {}", program, e))
    })?;
    if output.status.success() {
      return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let reason = if stderr.is_empty() {
      format!("{} exited with {}", program, output.status)
    } else {
      stderr
    };
    tracing::warn!("[ca] trust store rejected the root CA: {}", reason);
    Err(Error::TrustStore(reason))
  }

  fn install_linux(&self, cert_path: &Path) -> Result<()> {
    let anchor = self.linux_anchor_path();
    std::fs::copy(cert_path, &anchor).map_err(|e| {
      Error::TrustStore(format!(
        "cannot write {} ({}), run with elevated privileges",
        anchor.display(),
        e
      ))
    })?;
    Self::run("update-ca-certificates", &[])
  }
}

impl TrustStore for SystemTrustStore {
  fn contains(&self, ca: &CertificateDer<'_>) -> bool {
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
      tracing::debug!("[ca] skipping native certificate: {}", error);
    }
    native.certs.iter().any(|c| c.as_ref() == ca.as_ref())
  }

  fn install(&self, cert_path: &Path) -> Result<()> {
    let path = cert_path.to_string_lossy();
    if cfg!(target_os = "macos") {
      let home = std::env::var("HOME").unwrap_or_default();
      let keychain = format!("{}/Library/Keychains/login.keychain-db", home);
      Self::run(
        "security",
        &["add-trusted-cert", "-r", "trustRoot", "-k", &keychain, &path],
      )
    } else if cfg!(target_os = "windows") {
      Self::run("certutil", &["-user", "-addstore", "Root", &path])
    } else {
      self.install_linux(cert_path)
    }
  }

  fn is_installed(&self, cert_path: &Path) -> bool {
    if cfg!(any(target_os = "macos", target_os = "windows")) {
      return match super::read_cert_der(cert_path) {
        Ok(der) => self.contains(&der),
        Err(_) => false,
      };
    }
    match (
      std::fs::read(cert_path),
      std::fs::read(self.linux_anchor_path()),
    ) {
      (Ok(ours), Ok(anchor)) => ours == anchor,
      _ => false,
    }
  }
}

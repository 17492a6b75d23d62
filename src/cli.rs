//! Command line front end

use crate::app::ApiTune;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::settings;
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
  name = "apitune",
  version,
  about = "Local MITM proxy for API debugging: rules, mocks, traffic logs and scripted tests"
)]
pub struct Cli {
  #[command(flatten)]
  pub proxy: ProxyArgs,

  #[command(subcommand)]
  pub command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
  /// Directory holding certificates, rules and settings
  #[arg(long, global = true, default_value = ".apitune")]
  pub data_dir: PathBuf,

  /// Listen port; defaults to the persisted setting
  #[arg(short, long, global = true, value_parser = parse_port)]
  pub port: Option<u16>,

  /// Listen address
  #[arg(long, global = true, default_value = "0.0.0.0")]
  pub host: IpAddr,

  /// Relay CONNECT tunnels without decrypting them
  #[arg(long, global = true, default_value_t = false)]
  pub no_https_interception: bool,

  /// Accept invalid origin certificates
  #[arg(long, global = true, default_value_t = false)]
  pub insecure_upstream: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// Run the proxy (default)
  Serve,
  /// Manage the root certificate
  #[command(subcommand)]
  Ca(CaCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum CaCommand {
  /// Show whether the root exists and is trusted
  Status,
  /// Generate a new root
  Generate,
  /// Add the root to the OS trust store
  Trust,
  /// Copy the root certificate to a file
  Export { path: PathBuf },
}

fn parse_port(value: &str) -> std::result::Result<u16, String> {
  let port = value.parse::<u16>().map_err(|e| e.to_string())?;
  settings::validate_port(port).map_err(|e| e.to_string())?;
  Ok(port)
}

impl ProxyArgs {
  pub fn proxy_config(&self) -> ProxyConfig {
    ProxyConfig {
      data_dir: self.data_dir.clone(),
      listen_host: self.host,
      enable_https_interception: !self.no_https_interception,
      accept_invalid_upstream_certs: self.insecure_upstream,
      ..Default::default()
    }
  }
}

/// Run a certificate subcommand and print its outcome
pub async fn run_ca(app: &ApiTune, command: &CaCommand) -> Result<()> {
  match command {
    CaCommand::Status => {
      let status = app.ca_status();
      println!("{}", serde_json::to_string_pretty(&status)?);
    }
    CaCommand::Generate => {
      let paths = app.generate_root_ca().await?;
      println!("certificate: {}", paths.cert_path.display());
      println!("private key: {}", paths.key_path.display());
    }
    CaCommand::Trust => {
      app.trust_root_ca().await?;
      println!("root CA trusted");
    }
    CaCommand::Export { path } => {
      app.export_root_ca(path).await?;
      println!("exported to {}", path.display());
    }
  }
  Ok(())
}

#![cfg_attr(docsrs, feature(doc_cfg))]

//! # apitune
//!
//! A local man-in-the-middle proxy for API debugging.
//!
//! Clients point their HTTP proxy at ApiTune. Plain HTTP requests, decrypted
//! CONNECT tunnels and WebSocket upgrades all flow through one dispatcher.
//! Every request then runs through a fixed pipeline of stages:
//!
//! - user rules rewrite, redirect, delay or mock the traffic
//! - the origin is contacted when no mock answered
//! - each exchange is logged and broadcast to subscribers
//! - rule test scripts assert on the finished exchange
//!
//! HTTPS interception needs a local root certificate. The
//! [`CertificateManager`] generates it, issues per-host leaves signed by it
//! and installs it into the OS trust store.
//!
//! ```no_run
//! # async fn run() -> apitune::Result<()> {
//! let app = apitune::ApiTune::new(apitune::ProxyConfig::default()).await?;
//! let addr = app.start(None).await?;
//! println!("proxy listening on {}", addr);
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod ca;
pub mod cli;
pub mod codec;
pub mod config;
mod error;
pub mod events;
pub mod exchange;
pub mod forward;
pub mod persist;
pub mod pipeline;
pub mod rules;
pub mod script;
pub mod server;
pub mod settings;
pub mod store;
pub mod tls;

pub use app::{ApiTune, ApiTuneBuilder, CaStatus};
pub use ca::{CertificateManager, RootCaPaths, SystemTrustStore, TrustStore};
pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use events::{EventBus, ProxyEvent};
pub use exchange::{Exchange, ExchangeLog, ExchangeResponse};
pub use persist::{JsonFileStore, KeyValueStore, MemoryStore};
pub use rules::{AddRuleOptions, RuleEngine, RuleNode, RuleService, RuleStorage};
pub use script::{PrintLog, TestResult};
pub use settings::{Settings, Theme};

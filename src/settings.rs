//! User-facing settings persisted under the `"settings"` key

use crate::config::SETTING_STORAGE_KEY;
use crate::error::{Error, Result};
use crate::persist::KeyValueStore;
use serde::{Deserialize, Serialize};

/// Lowest port the listener may move to
pub const MIN_PORT: u16 = 1024;
/// Highest port the listener may move to
pub const MAX_PORT: u16 = 49152;
/// Port used until the user picks another
pub const DEFAULT_PORT: u16 = 8899;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
  #[default]
  System,
  Light,
  Dark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
  pub port: u16,
  pub theme: Theme,
  /// UI language code; empty until chosen, then derived from the locale
  pub language: String,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      port: DEFAULT_PORT,
      theme: Theme::System,
      language: String::new(),
    }
  }
}

impl Settings {
  /// Stored settings, or defaults when nothing was saved yet.
  /// A missing language is filled from the process locale.
  pub fn load(store: &dyn KeyValueStore) -> Result<Self> {
    let mut settings = match store.get(SETTING_STORAGE_KEY)? {
      Some(value) => serde_json::from_value(value)?,
      None => Settings::default(),
    };
    if settings.language.is_empty() {
      settings.language = locale_language();
    }
    Ok(settings)
  }

  pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
    store.set(SETTING_STORAGE_KEY, &serde_json::to_value(self)?)
  }

  /// Load, apply `change`, save
  pub fn update(store: &dyn KeyValueStore, change: impl FnOnce(&mut Settings)) -> Result<Settings> {
    let mut settings = Settings::load(store)?;
    change(&mut settings);
    settings.save(store)?;
    Ok(settings)
  }
}

pub fn validate_port(port: u16) -> Result<()> {
  if (MIN_PORT..=MAX_PORT).contains(&port) {
    Ok(())
  } else {
    Err(Error::InvalidPort(port))
  }
}

/// `zh` for Chinese locales, `en` otherwise
pub fn locale_language() -> String {
  let locale = ["LC_ALL", "LC_MESSAGES", "LANG"]
    .iter()
    .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
    .unwrap_or_default();
  if locale.to_ascii_lowercase().starts_with("zh") {
    "zh".to_string()
  } else {
    "en".to_string()
  }
}

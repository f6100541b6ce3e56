//! CLI-facing configuration: a human-edited, read-only TOML file carrying timeout overrides, a
//! preferred packet-size override, and a default log filter. Never written by this crate.

use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level configuration file shape.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
  #[serde(default)]
  pub timeouts: Timeouts,
  /// Overrides the device-preferred packet size reported during version negotiation.
  #[serde(default)]
  pub packet_size_override: Option<u32>,
  /// Default `tracing-subscriber` `EnvFilter` directive string used when `RUST_LOG` is unset.
  #[serde(default)]
  pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timeouts {
  #[serde(default = "default_command_timeout_secs")]
  pub command_secs: u64,
  #[serde(default = "default_finalizer_timeout_secs")]
  pub finalizer_secs: u64,
}

impl Default for Timeouts {
  fn default() -> Self {
    Self { command_secs: default_command_timeout_secs(), finalizer_secs: default_finalizer_timeout_secs() }
  }
}

fn default_command_timeout_secs() -> u64 {
  60
}

fn default_finalizer_timeout_secs() -> u64 {
  120
}

impl Config {
  /// Load and parse a TOML configuration file.
  pub fn load(path: &Path) -> Result<Self> {
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_when_file_is_empty() {
    let config: Config = toml::from_str("").unwrap();
    assert_eq!(config.timeouts.command_secs, 60);
    assert_eq!(config.timeouts.finalizer_secs, 120);
    assert!(config.packet_size_override.is_none());
    assert!(config.log_filter.is_none());
  }

  #[test]
  fn parses_overrides() {
    let text = r#"
      packet_size_override = 4096
      log_filter = "dlflash=debug"

      [timeouts]
      command_secs = 30
      finalizer_secs = 90
    "#;
    let config: Config = toml::from_str(text).unwrap();
    assert_eq!(config.packet_size_override, Some(4096));
    assert_eq!(config.log_filter.as_deref(), Some("dlflash=debug"));
    assert_eq!(config.timeouts.command_secs, 30);
    assert_eq!(config.timeouts.finalizer_secs, 90);
  }

  #[test]
  fn rejects_unknown_fields() {
    let text = "bogus_field = 1";
    assert!(toml::from_str::<Config>(text).is_err());
  }

  #[test]
  fn load_reports_config_error_for_bad_path() {
    let err = Config::load(Path::new("/nonexistent/dlflash.toml")).unwrap_err();
    assert!(matches!(err, Error::IoError(_)));
  }
}

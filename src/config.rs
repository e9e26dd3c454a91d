use std::env;
use std::num::{NonZeroU64, NonZeroUsize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: Option<String>,
  pub server_port: u16,
  pub output_dir: PathBuf,
  pub temp_dir: PathBuf,
  pub download_timeout: Duration,
  pub stale_after: Duration,
  pub recovery_batch_limit: usize,
  pub redrive_on_boot: bool,
  pub recovery_interval: Option<Duration>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      database_url: None,
      server_port: 8080,
      output_dir: PathBuf::from("./output"),
      temp_dir: PathBuf::from("./temp"),
      download_timeout: Duration::from_secs(30),
      stale_after: Duration::from_secs(300),
      recovery_batch_limit: 10,
      redrive_on_boot: false,
      recovery_interval: None,
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    dotenvy::dotenv().ok();
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let defaults = Self::default();
    Ok(Self {
      database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
      server_port: parse_or(&lookup, "SERVER_PORT", defaults.server_port)?,
      output_dir: lookup("OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
      temp_dir: lookup("TEMP_DIR").map(PathBuf::from).unwrap_or(defaults.temp_dir),
      download_timeout: parse_secs(&lookup, "DOWNLOAD_TIMEOUT_SECS")?.unwrap_or(defaults.download_timeout),
      stale_after: parse_secs(&lookup, "STALE_AFTER_SECS")?.unwrap_or(defaults.stale_after),
      recovery_batch_limit: parse::<NonZeroUsize>(&lookup, "RECOVERY_BATCH_LIMIT")?
        .map_or(defaults.recovery_batch_limit, NonZeroUsize::get),
      redrive_on_boot: parse_or(&lookup, "REDRIVE_ON_BOOT", defaults.redrive_on_boot)?,
      recovery_interval: parse_secs(&lookup, "RECOVERY_INTERVAL_SECS")?,
    })
  }

  /// The configured database URL, for binaries that are meaningless against
  /// a fresh in-memory store.
  pub fn require_database_url(&self, purpose: &str) -> Result<&str> {
    self
      .database_url
      .as_deref()
      .with_context(|| format!("DATABASE_URL must be set for {}", purpose))
  }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  lookup(key)
    .map(|raw| {
      raw
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {}: {:?}", key, raw))
    })
    .transpose()
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  Ok(parse(lookup, key)?.unwrap_or(default))
}

/// Whole seconds; zero is rejected.
fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
  Ok(parse::<NonZeroU64>(lookup, key)?.map(|secs| Duration::from_secs(secs.get())))
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use super::*;

  fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key| vars.get(key).cloned()
  }

  #[test]
  fn defaults_apply_when_unset() {
    let config = Config::from_lookup(lookup_from(&[])).unwrap();
    assert!(config.database_url.is_none());
    assert_eq!(config.server_port, 8080);
    assert_eq!(config.stale_after, Duration::from_secs(300));
    assert_eq!(config.recovery_batch_limit, 10);
    assert!(!config.redrive_on_boot);
    assert!(config.recovery_interval.is_none());
  }

  #[test]
  fn overrides_are_parsed() {
    let config = Config::from_lookup(lookup_from(&[
      ("DATABASE_URL", "postgres://localhost/imgq"),
      ("SERVER_PORT", "9000"),
      ("STALE_AFTER_SECS", "60"),
      ("REDRIVE_ON_BOOT", "true"),
      ("RECOVERY_INTERVAL_SECS", "120"),
    ]))
    .unwrap();
    assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/imgq"));
    assert_eq!(config.server_port, 9000);
    assert_eq!(config.stale_after, Duration::from_secs(60));
    assert!(config.redrive_on_boot);
    assert_eq!(config.recovery_interval, Some(Duration::from_secs(120)));
  }

  #[test]
  fn malformed_values_are_rejected() {
    let cases = [
      ("SERVER_PORT", "eighty"),
      ("STALE_AFTER_SECS", "-5"),
      ("RECOVERY_INTERVAL_SECS", "0"),
      ("DOWNLOAD_TIMEOUT_SECS", "0"),
      ("STALE_AFTER_SECS", "0"),
      ("RECOVERY_BATCH_LIMIT", "0"),
      ("REDRIVE_ON_BOOT", "sometimes"),
    ];
    for (key, value) in cases {
      let err = Config::from_lookup(lookup_from(&[(key, value)])).unwrap_err();
      assert!(err.to_string().contains(key), "{}={} gave {}", key, value, err);
    }
  }

  #[test]
  fn database_url_can_be_required() {
    let config = Config::from_lookup(lookup_from(&[])).unwrap();
    let err = config.require_database_url("the worker").unwrap_err();
    assert!(err.to_string().contains("DATABASE_URL"));

    let config = Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://db/imgq")])).unwrap();
    assert_eq!(config.require_database_url("the worker").unwrap(), "postgres://db/imgq");
  }
}

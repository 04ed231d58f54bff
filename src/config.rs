use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheConfig, KeyPolicy};
use crate::jobs::DEFAULT_POLL_INTERVAL;
use crate::key::QueryKey;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheSection,
  #[serde(default)]
  pub polling: PollingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
  pub stale_time_ms: u64,
  pub gc_time_ms: u64,
  /// Extra attempts after a failed fetch
  pub retry: u32,
  pub retry_delay_ms: u64,
  /// Per key-pattern policy, e.g. shorter stale time for `["job"]`
  pub overrides: Vec<OverrideConfig>,
}

impl Default for CacheSection {
  fn default() -> Self {
    let defaults = CacheConfig::default();
    Self {
      stale_time_ms: defaults.stale_time.as_millis() as u64,
      gc_time_ms: defaults.gc_time.as_millis() as u64,
      retry: defaults.retry,
      retry_delay_ms: defaults.retry_delay.as_millis() as u64,
      overrides: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverrideConfig {
  /// Key prefix as a list of JSON segments
  pub prefix: Vec<Value>,
  pub stale_time_ms: Option<u64>,
  pub retry: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingSection {
  pub interval_ms: u64,
}

impl Default for PollingSection {
  fn default() -> Self {
    Self {
      interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./dashsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/dashsync/config.yaml
  ///
  /// With no file found the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("dashsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("dashsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.polling.interval_ms == 0 {
      return Err(eyre!("polling.interval_ms must be greater than zero"));
    }
    Ok(config)
  }

  pub fn cache_config(&self) -> CacheConfig {
    let section = &self.cache;
    section.overrides.iter().fold(
      CacheConfig::default()
        .with_stale_time(Duration::from_millis(section.stale_time_ms))
        .with_gc_time(Duration::from_millis(section.gc_time_ms))
        .with_retry(section.retry)
        .with_retry_delay(Duration::from_millis(section.retry_delay_ms)),
      |config, o| {
        config.with_override(KeyPolicy {
          prefix: QueryKey::from_segments(o.prefix.clone()),
          stale_time: o.stale_time_ms.map(Duration::from_millis),
          retry: o.retry,
        })
      },
    )
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.polling.interval_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_yaml_uses_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    let cache = config.cache_config();
    assert_eq!(cache.stale_time, Duration::from_secs(60));
    assert_eq!(cache.gc_time, Duration::from_secs(300));
    assert_eq!(cache.retry, 1);
    assert_eq!(config.poll_interval(), Duration::from_millis(2000));
  }

  #[test]
  fn test_overrides() {
    let config = Config::from_yaml(
      r#"
cache:
  stale_time_ms: 0
  retry: 2
  overrides:
    - prefix: ["job"]
      retry: 0
    - prefix: ["product", 7]
      stale_time_ms: 600000
polling:
  interval_ms: 500
"#,
    )
    .unwrap();

    let cache = config.cache_config();
    assert_eq!(cache.stale_time, Duration::ZERO);
    assert_eq!(cache.retry_for(&QueryKey::root("job").with("J1")), 0);
    assert_eq!(cache.retry_for(&QueryKey::root("tasks")), 2);
    assert_eq!(
      cache.stale_time_for(&QueryKey::root("product").with(7).with("members")),
      Duration::from_secs(600)
    );
    assert_eq!(config.poll_interval(), Duration::from_millis(500));
  }

  #[test]
  fn test_zero_interval_is_rejected() {
    assert!(Config::from_yaml("polling:\n  interval_ms: 0\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/dashsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}

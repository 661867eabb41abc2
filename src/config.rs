use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  pub url: String,
  /// Passed to the aggregate RPCs when set
  pub business_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false nothing is persisted and offline reads always miss
  pub enabled: bool,
  /// Database location (defaults to the user data directory)
  pub path: Option<PathBuf>,
  /// Online freshness window for generic fetches
  pub stale_time_secs: u64,
  pub kpi_ttl_secs: u64,
  pub kpi_debounce_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      stale_time_secs: 0,
      kpi_ttl_secs: 300,
      kpi_debounce_ms: 2000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
  pub max_attempts: u32,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self { max_attempts: 3 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lpgcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lpgcache/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/lpgcache/config.yaml\n\
                 with at least `backend.url` set."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("lpgcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lpgcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks LPGCACHE_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("LPGCACHE_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set LPGCACHE_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }

  /// Get the session refresh token from environment variables.
  ///
  /// Checks LPGCACHE_REFRESH_TOKEN.
  pub fn get_refresh_token() -> Result<String> {
    std::env::var("LPGCACHE_REFRESH_TOKEN").map_err(|_| {
      eyre!("Refresh token not found. Set LPGCACHE_REFRESH_TOKEN environment variable.")
    })
  }
}

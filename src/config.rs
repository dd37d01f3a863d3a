//! Tool configuration.
//!
//! Settings come from an optional `config.json` and are then overridden by
//! command-line flags. The merged value is passed explicitly into the engine.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

const APP_DIR: &str = "assetpatch";
const DEFAULT_BRANCH: &str = "public";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_DOWNLOAD_JOBS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub schema_version: u32,
    /// Manifest mirrors, tried in order.
    pub manifest_urls: Vec<String>,
    /// Manifest platform key; defaults to the running OS.
    pub platform: Option<String>,
    pub branch: String,
    /// Patch cache root; defaults to the user cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Hashing threads; 0 uses one per CPU.
    pub jobs: usize,
    pub download_jobs: usize,
    pub timeout_secs: u64,
    /// Attempts per URL for transient network failures.
    pub retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            manifest_urls: Vec::new(),
            platform: None,
            branch: DEFAULT_BRANCH.to_string(),
            cache_dir: None,
            jobs: 0,
            download_jobs: DEFAULT_DOWNLOAD_JOBS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn platform(&self) -> String {
        self.platform
            .clone()
            .unwrap_or_else(|| default_platform().to_string())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn hash_threads(&self) -> usize {
        if self.jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.jobs
        }
    }
}

/// Manifest platform key for the running OS.
pub fn default_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macos",
        "windows" => "windows",
        _ => "linux",
    }
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.json"))
}

/// Render a pretty JSON config stub.
pub fn config_stub() -> Result<String> {
    serde_json::to_string_pretty(&Config::default()).context("serialize config stub")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: Config = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config JSON {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Load an explicit config, or the default location if it exists, or defaults.
pub fn resolve_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    match default_config_path() {
        Some(path) if path.is_file() => load_config(&path),
        _ => Ok(Config::default()),
    }
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    if config.branch.trim().is_empty() {
        return Err(anyhow!("branch must be non-empty"));
    }
    if let Some(platform) = config.platform.as_deref() {
        if platform.trim().is_empty() {
            return Err(anyhow!("platform must be non-empty when set"));
        }
    }
    if config.download_jobs == 0 {
        return Err(anyhow!("download_jobs must be at least 1"));
    }
    if config.timeout_secs == 0 {
        return Err(anyhow!("timeout_secs must be at least 1"));
    }
    if config.retries == 0 {
        return Err(anyhow!("retries must be at least 1"));
    }
    for url in &config.manifest_urls {
        if !url.contains("://") {
            return Err(anyhow!("manifest URL {url:?} is not absolute"));
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

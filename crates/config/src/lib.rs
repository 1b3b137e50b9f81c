//! Layered configuration for kura.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults (platform cache/data directories via `directories`)
//! 2. an optional TOML, YAML or JSON file, picked by extension
//! 3. environment variables prefixed `KURA_`, with `__` separating sections
//!    (`KURA_CACHE__SIZE_LIMIT=1073741824`)

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "KURA_";

struct Dirs {
    cache: PathBuf,
    data: PathBuf,
}

fn default_dirs() -> Dirs {
    match ProjectDirs::from("", "", "kura") {
        Some(dirs) => Dirs { cache: dirs.cache_dir().to_path_buf(), data: dirs.data_dir().to_path_buf() },
        None => {
            // No home directory (containers, service accounts).
            let fallback = std::env::temp_dir().join("kura");
            Dirs { cache: fallback.clone(), data: fallback }
        },
    }
}

/// Primary asset cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Total size budget in bytes.
    pub size_limit: u64,
    /// Records examined per eviction batch.
    pub eviction_batch: u64,
    pub eviction_debounce_ms: u64,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_dirs().cache.join("assets"),
            size_limit: 512 * 1024 * 1024,
            eviction_batch: 50,
            eviction_debounce_ms: 250,
        }
    }
}
impl CacheConfig {
    pub fn eviction_debounce(&self) -> Duration {
        Duration::from_millis(self.eviction_debounce_ms)
    }
}

/// Cover thumbnail cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoverConfig {
    pub dir: PathBuf,
    pub ttl_secs: u64,
    pub jpeg_quality: u8,
}
impl Default for CoverConfig {
    fn default() -> Self {
        Self { dir: default_dirs().cache.join("covers"), ttl_secs: 24 * 60 * 60, jpeg_quality: 80 }
    }
}
impl CoverConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Record store snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub flush_debounce_ms: u64,
}
impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_dirs().data.join("records.db"), flush_debounce_ms: 500 }
    }
}
impl StoreConfig {
    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }
}

/// Outbound HTTP used by the default fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
}
impl Default for HttpConfig {
    fn default() -> Self {
        Self { user_agent: concat!("kura/", env!("CARGO_PKG_VERSION")).to_string(), timeout_secs: 30 }
    }
}
impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Complete configuration.
///
/// # Examples
///
/// ```
/// use kura_config::Config;
///
/// let config = Config::default();
/// assert_eq!(config.cache.size_limit, 512 * 1024 * 1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cache: CacheConfig,
    pub covers: CoverConfig,
    pub store: StoreConfig,
    pub http: HttpConfig,
}

impl Config {
    /// The merged sources, before extraction.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            if !file.is_file() {
                exn::bail!(ErrorKind::MissingFile(file.to_path_buf()));
            }
            let extension = file.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
            figment = match extension.as_deref() {
                Some("toml") => figment.merge(Toml::file(file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(file.to_path_buf())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(file)?.extract().or_raise(|| ErrorKind::Parse)?;
        config.validate()?;
        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, dir) in
            [("cache.dir", &self.cache.dir), ("covers.dir", &self.covers.dir), ("store.path", &self.store.path)]
        {
            if !dir.is_absolute() {
                exn::bail!(ErrorKind::invalid(field, format!("{} is not an absolute path", dir.display())));
            }
        }
        if self.cache.eviction_batch == 0 {
            exn::bail!(ErrorKind::invalid("cache.eviction_batch", "must be at least 1"));
        }
        if self.covers.ttl_secs == 0 {
            exn::bail!(ErrorKind::invalid("covers.ttl_secs", "must be at least 1"));
        }
        if !(1..=100).contains(&self.covers.jpeg_quality) {
            exn::bail!(ErrorKind::invalid("covers.jpeg_quality", "must be between 1 and 100"));
        }
        // Clearing either cache purges its whole directory.
        if self.covers.dir.starts_with(&self.cache.dir) || self.cache.dir.starts_with(&self.covers.dir) {
            exn::bail!(ErrorKind::invalid("covers.dir", "must not contain or be inside cache.dir"));
        }
        for (name, dir) in [("cache.dir", &self.cache.dir), ("covers.dir", &self.covers.dir)] {
            if self.store.path.starts_with(dir) {
                exn::bail!(ErrorKind::invalid("store.path", format!("must not be inside {name}")));
            }
        }
        Ok(())
    }
}

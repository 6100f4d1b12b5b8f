//! Configuration types for newhelm

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CACHE_SCHEMA_VERSION, DiskCache, NoCache, ResponseCache};
use crate::error::{NewhelmError, Result};
use crate::retry::RetryConfig;
use crate::secrets::RawSecrets;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NewhelmConfig {
    /// Response cache
    pub cache: CacheConfig,

    /// Test asset downloads
    pub dependencies: DependencyConfig,

    /// Retry policy for SUT and annotator calls
    pub retry: RetryConfig,

    /// TOML file with secret values, one table per scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets_path: Option<PathBuf>,
}

fn default_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("newhelm")
}

/// Response cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disable to run every call fresh
    pub enabled: bool,

    /// Root directory; entries live under `v<schema_version>/`
    pub dir: PathBuf,

    /// Bump to invalidate every existing entry
    pub schema_version: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_root().join("cache"),
            schema_version: CACHE_SCHEMA_VERSION,
        }
    }
}

/// Dependency manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    /// Where verified assets are stored
    pub data_dir: PathBuf,

    /// Per-request timeout for HTTP downloads
    #[serde(with = "humantime_serde")]
    pub download_timeout: Duration,

    /// Retry policy for transient download failures
    pub retry: RetryConfig,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            data_dir: default_root().join("data"),
            download_timeout: Duration::from_secs(300),
            retry: RetryConfig::default().with_max_attempts(3),
        }
    }
}

/// Builder for NewhelmConfig
pub struct ConfigBuilder {
    config: NewhelmConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: NewhelmConfig::default(),
        }
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    pub fn dependencies(mut self, config: DependencyConfig) -> Self {
        self.config.dependencies = config;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    pub fn secrets_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.secrets_path = Some(path.into());
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<NewhelmConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NewhelmConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `newhelm.toml` in the working directory
    /// 3. The file named by `NEWHELM_CONFIG_PATH`
    /// 4. `NEWHELM_*` environment variables, `__` between nesting levels
    ///    (`NEWHELM_CACHE__SCHEMA_VERSION=2`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or the merged
    /// result fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(NewhelmConfig::default()))
            .merge(Toml::file("newhelm.toml"));

        if let Ok(path) = std::env::var("NEWHELM_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(
            Env::prefixed("NEWHELM_")
                .ignore(&["CONFIG_PATH"])
                .split("__"),
        );

        let config: NewhelmConfig = figment.extract().map_err(|e| {
            NewhelmError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, on top of defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: NewhelmConfig = Figment::from(Serialized::defaults(NewhelmConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                NewhelmError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Rejects zero attempt budgets, backoff multipliers below 1 and a zero
    /// cache schema version.
    pub fn validate(&self) -> Result<()> {
        validate_retry("retry", &self.retry)?;
        validate_retry("dependencies.retry", &self.dependencies.retry)?;

        if self.cache.schema_version == 0 {
            return Err(NewhelmError::Configuration(
                "cache.schema_version must be at least 1".to_string(),
            ));
        }
        if self.dependencies.download_timeout.is_zero() {
            return Err(NewhelmError::Configuration(
                "dependencies.download_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Open the configured response cache
    pub fn open_cache(&self) -> Result<Arc<dyn ResponseCache>> {
        if !self.cache.enabled {
            tracing::info!("response cache disabled");
            return Ok(Arc::new(NoCache));
        }
        Ok(Arc::new(DiskCache::open_with_version(
            &self.cache.dir,
            self.cache.schema_version,
        )?))
    }

    /// Load secrets from `secrets_path`, or none if unset
    pub fn load_secrets(&self) -> Result<RawSecrets> {
        match &self.secrets_path {
            Some(path) => RawSecrets::from_file(path),
            None => Ok(RawSecrets::new()),
        }
    }
}

fn validate_retry(section: &str, retry: &RetryConfig) -> Result<()> {
    retry
        .validate()
        .map_err(|reason| NewhelmError::Configuration(format!("{}.{}", section, reason)))
}

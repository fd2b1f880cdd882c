//! Configuration for the Strata engine.
//!
//! Configuration is read from a TOML file, then overridden by `STRATA_*`
//! environment variables and validated.
//!
//! # Configuration Location
//!
//! The CLI passes an explicit path when given one. Otherwise the
//! `STRATA_CONFIG_PATH` environment variable is consulted, then
//! `<config dir>/strata/config.toml`. When none of these exist the built-in
//! defaults apply.
//!
//! # Example
//!
//! ```toml
//! [general]
//! log_level = "info"
//!
//! [cache]
//! enabled = true
//! directory = ".strata/cache"
//! stale_max_age_days = 30
//!
//! [scheduler]
//! parallel_enabled = true
//! max_workers = 8
//! strategy = "adaptive"
//! max_retries = 3
//!
//! [memory]
//! max_memory_mb = 2048
//!
//! [chunking]
//! large_file_threshold_bytes = 1048576
//! chunk_max_lines = 1000
//! chunk_overlap_lines = 10
//! ```

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The current configuration version
pub const CONFIG_VERSION: &str = "0.1.0";

/// Version of the on-disk cache layout; part of the config digest
pub const CACHE_FORMAT_VERSION: u32 = 1;

// Environment variable names
pub const ENV_CONFIG_PATH: &str = "STRATA_CONFIG_PATH";
pub const ENV_LOG_LEVEL: &str = "STRATA_LOG_LEVEL";
pub const ENV_CACHE_ENABLED: &str = "STRATA_CACHE_ENABLED";
pub const ENV_CACHE_DIR: &str = "STRATA_CACHE_DIR";
pub const ENV_PARALLEL_ENABLED: &str = "STRATA_PARALLEL_ENABLED";
pub const ENV_MAX_WORKERS: &str = "STRATA_MAX_WORKERS";
pub const ENV_STRATEGY: &str = "STRATA_STRATEGY";
pub const ENV_MAX_MEMORY_MB: &str = "STRATA_MAX_MEMORY_MB";
pub const ENV_MAX_RETRIES: &str = "STRATA_MAX_RETRIES";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Execution strategy requested for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Fixed pool of OS threads
    Pooled,
    /// Work-stealing pool for CPU-heavy parsing
    CpuBound,
    /// Large files on the work-stealing pool, the rest on the thread pool
    Hybrid,
    /// Pick one of the above from the workload
    #[default]
    Adaptive,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pooled => "pooled",
            Self::CpuBound => "cpu-bound",
            Self::Hybrid => "hybrid",
            Self::Adaptive => "adaptive",
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pooled" | "thread" | "threads" => Ok(Self::Pooled),
            "cpu-bound" | "cpu_bound" | "cpu" | "process" => Ok(Self::CpuBound),
            "hybrid" => Ok(Self::Hybrid),
            "adaptive" | "auto" => Ok(Self::Adaptive),
            _ => Err(StrataError::Config(format!(
                "Invalid strategy '{}'. Must be one of: pooled, cpu-bound, hybrid, adaptive",
                s
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    general: GeneralConfig,
    cache: CacheConfig,
    scheduler: SchedulerConfig,
    memory: MemoryConfig,
    chunking: ChunkingConfig,
    discovery: DiscoveryConfig,
}

/// General configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Configuration version
    pub version: String,
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

/// Content-hash cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    /// Entries older than this are removed by stale-cache cleanup
    pub stale_max_age_days: u64,
    /// Parsed payloads kept in memory after a load or store
    pub payload_cache_entries: usize,
}

/// Task scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub parallel_enabled: bool,
    pub max_workers: usize,
    pub strategy: Strategy,
    pub max_retries: u32,
}

/// Advisory memory budget settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Budget shared by all in-flight tasks
    pub max_memory_mb: u64,
    /// Process RSS above which the chunked parser triggers cleanup
    pub cleanup_threshold_mb: u64,
}

/// Large-file chunking settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Files above this size go through the chunked parser
    pub large_file_threshold_bytes: u64,
    pub chunk_max_lines: usize,
    pub chunk_max_bytes: usize,
    pub chunk_overlap_lines: usize,
    /// Prefer top-level construct boundaries when splitting
    pub detect_boundaries: bool,
}

/// File discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub skip_hidden: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_cache_dir(),
            stale_max_age_days: 30,
            payload_cache_entries: 256,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel_enabled: true,
            max_workers: 8,
            strategy: Strategy::Adaptive,
            max_retries: 3,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 2048,
            cleanup_threshold_mb: 1536,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            large_file_threshold_bytes: 1024 * 1024,
            chunk_max_lines: 1000,
            chunk_max_bytes: 512 * 1024,
            chunk_overlap_lines: 10,
            detect_boundaries: true,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            include: vec!["**/*.py".to_string()],
            exclude: vec![
                "**/__pycache__/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/.venv/**".to_string(),
            ],
            skip_hidden: true,
        }
    }
}

/// Default cache location (`<cache dir>/strata`, or `.strata/cache`)
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("strata"))
        .unwrap_or_else(|| PathBuf::from(".strata").join("cache"))
}

/// Default configuration file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("strata").join("config.toml"))
}

/// The subset of settings that changes parse output.
#[derive(Serialize)]
struct ParseSettings<'a> {
    format_version: u32,
    chunking: &'a ChunkingConfig,
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StrataError::Config(format!(
            "Invalid boolean '{}' for {}",
            value, key
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| StrataError::Config(format!("Invalid value for {}: {}", key, e)))
}

impl StrataConfig {
    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or fails validation
    pub fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .map_err(|e| StrataError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Self = toml::from_str(&content)
            .map_err(|e| StrataError::Config(format!("Failed to parse config file: {}", e)))?;

        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Resolve and load configuration.
    ///
    /// Uses `explicit` when given, then `STRATA_CONFIG_PATH`, then the default
    /// location. Falls back to defaults (with env overrides) when no file exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }

        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            return Self::load_from_path(Path::new(&path));
        }

        if let Some(path) = default_config_path().filter(|p| p.exists()) {
            return Self::load_from_path(&path);
        }

        debug!("No configuration file found, using defaults");
        let mut config = Self::default();
        config.merge_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path atomically
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or cannot be written
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StrataError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| StrataError::Config(format!("Failed to serialize config: {}", e)))?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, content)
            .map_err(|e| StrataError::Config(format!("Failed to write config file: {}", e)))?;
        std::fs::rename(&temp_path, path)
            .map_err(|e| StrataError::Config(format!("Failed to rename config file: {}", e)))?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.general.log_level.as_str()) {
            return Err(StrataError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.general.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.scheduler.max_workers == 0 {
            return Err(StrataError::Config(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.memory.max_memory_mb == 0 {
            return Err(StrataError::Config(
                "max_memory_mb must be greater than 0".to_string(),
            ));
        }

        if self.chunking.chunk_max_lines == 0 {
            return Err(StrataError::Config(
                "chunk_max_lines must be greater than 0".to_string(),
            ));
        }

        if self.chunking.chunk_max_bytes == 0 {
            return Err(StrataError::Config(
                "chunk_max_bytes must be greater than 0".to_string(),
            ));
        }

        if self.chunking.chunk_overlap_lines >= self.chunking.chunk_max_lines {
            return Err(StrataError::Config(format!(
                "chunk_overlap_lines ({}) must be smaller than chunk_max_lines ({})",
                self.chunking.chunk_overlap_lines, self.chunking.chunk_max_lines
            )));
        }

        if self.cache.enabled && self.cache.directory.as_os_str().is_empty() {
            return Err(StrataError::Config(
                "cache directory must be set when the cache is enabled".to_string(),
            ));
        }

        if self.memory.cleanup_threshold_mb == 0 {
            warn!("cleanup_threshold_mb is 0, every chunked parse will trigger cleanup");
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Merge `STRATA_*` environment variable overrides into the configuration
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_env_with(|key| std::env::var(key).ok())
    }

    /// Merge overrides from an arbitrary key lookup.
    pub fn merge_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            debug!("Overriding log_level from environment: {}", level);
            self.general.log_level = level;
        }

        if let Some(value) = lookup(ENV_CACHE_ENABLED) {
            self.cache.enabled = parse_bool(ENV_CACHE_ENABLED, &value)?;
        }

        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            debug!("Overriding cache directory from environment: {}", dir);
            self.cache.directory = PathBuf::from(dir);
        }

        if let Some(value) = lookup(ENV_PARALLEL_ENABLED) {
            self.scheduler.parallel_enabled = parse_bool(ENV_PARALLEL_ENABLED, &value)?;
        }

        if let Some(value) = lookup(ENV_MAX_WORKERS) {
            self.scheduler.max_workers = parse_number(ENV_MAX_WORKERS, &value)?;
        }

        if let Some(value) = lookup(ENV_STRATEGY) {
            self.scheduler.strategy = value.parse()?;
        }

        if let Some(value) = lookup(ENV_MAX_MEMORY_MB) {
            self.memory.max_memory_mb = parse_number(ENV_MAX_MEMORY_MB, &value)?;
        }

        if let Some(value) = lookup(ENV_MAX_RETRIES) {
            self.scheduler.max_retries = parse_number(ENV_MAX_RETRIES, &value)?;
        }

        Ok(())
    }

    /// Digest of the settings that affect parse output.
    ///
    /// Cache entries stored under a different digest are treated as stale.
    pub fn config_digest(&self) -> String {
        let settings = ParseSettings {
            format_version: CACHE_FORMAT_VERSION,
            chunking: &self.chunking,
        };
        // Serializing plain integers and bools cannot fail
        let bytes = serde_json::to_vec(&settings).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    /// Export configuration as TOML
    pub fn export_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| StrataError::Config(format!("Failed to serialize config: {}", e)))
    }

    // Section accessors

    pub fn general(&self) -> &GeneralConfig {
        &self.general
    }

    pub fn general_mut(&mut self) -> &mut GeneralConfig {
        &mut self.general
    }

    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CacheConfig {
        &mut self.cache
    }

    pub fn scheduler(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut SchedulerConfig {
        &mut self.scheduler
    }

    pub fn memory(&self) -> &MemoryConfig {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryConfig {
        &mut self.memory
    }

    pub fn chunking(&self) -> &ChunkingConfig {
        &self.chunking
    }

    pub fn chunking_mut(&mut self) -> &mut ChunkingConfig {
        &mut self.chunking
    }

    pub fn discovery(&self) -> &DiscoveryConfig {
        &self.discovery
    }

    pub fn discovery_mut(&mut self) -> &mut DiscoveryConfig {
        &mut self.discovery
    }
}

//! Configuration loading.
//!
//! [`LedgerConfig::load`] reads `config/config.toml` (optional) and overlays environment
//! variables prefixed `LINKLEDGER` with `__` as the section separator, e.g.
//! `LINKLEDGER__DATABASE__URL` or `LINKLEDGER__ENGINE__CACHE_TTL_SECONDS`.

use crate::error::LedgerError;
use crate::import::GroupLayout;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub use crate::pool::config::DatabaseConfig;

const DEFAULT_CONFIG_FILE: &str = "config/config.toml";
const ENV_PREFIX: &str = "LINKLEDGER";

/// Complete ledger configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// `[engine]` section: link engine, cache and import tuning
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Batch metadata cache TTL
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Codes per duplicate-detection query during import
    #[serde(default = "default_lookup_chunk_size")]
    pub lookup_chunk_size: usize,
    /// Rows per multi-row insert during import
    #[serde(default = "default_insert_chunk_size")]
    pub insert_chunk_size: usize,
    /// Capacity given to containers created by a scan or an import
    #[serde(default = "default_container_capacity")]
    pub default_container_capacity: i64,
    /// Weight recorded for every new unit
    #[serde(default = "default_unit_weight")]
    pub unit_weight: Decimal,
    /// Pattern a normalized (trimmed, upper-cased) code must match
    #[serde(default = "default_code_pattern")]
    pub code_pattern: String,
    /// Where the parent row sits within an import group
    #[serde(default)]
    pub import_layout: GroupLayout,
}

fn default_cache_ttl_seconds() -> u64 {
    30
}

fn default_lookup_chunk_size() -> usize {
    5000
}

fn default_insert_chunk_size() -> usize {
    1000
}

fn default_container_capacity() -> i64 {
    30
}

fn default_unit_weight() -> Decimal {
    Decimal::ONE
}

fn default_code_pattern() -> String {
    "^[A-Z0-9][A-Z0-9_-]{2,63}$".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl_seconds(),
            lookup_chunk_size: default_lookup_chunk_size(),
            insert_chunk_size: default_insert_chunk_size(),
            default_container_capacity: default_container_capacity(),
            unit_weight: default_unit_weight(),
            code_pattern: default_code_pattern(),
            import_layout: GroupLayout::default(),
        }
    }
}

impl EngineConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    /// Reject settings that would make the engine misbehave rather than fail loudly.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.lookup_chunk_size == 0 || self.insert_chunk_size == 0 {
            return Err(LedgerError::Config(
                "lookup_chunk_size and insert_chunk_size must be positive".to_string(),
            ));
        }
        if self.default_container_capacity <= 0 {
            return Err(LedgerError::Config(format!(
                "default_container_capacity must be positive, got {}",
                self.default_container_capacity
            )));
        }
        if self.unit_weight.is_sign_negative() {
            return Err(LedgerError::Config(format!(
                "unit_weight must not be negative, got {}",
                self.unit_weight
            )));
        }
        Ok(())
    }
}

impl LedgerConfig {
    /// Load from `config/config.toml`, falling back to env vars.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from an explicit file path (optional) plus environment overrides.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                // A file that exists but cannot be parsed is reported, then ignored
                if Path::new(path).exists() {
                    log::warn!("failed to load {path}, falling back to environment: {err}");
                }
                Config::builder()
                    .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {}, then env-only error: {}",
                            err, env_err
                        ))
                    })?
            }
        };

        settings.try_deserialize::<LedgerConfig>().map_err(|e| {
            ConfigError::Message(format!("Ledger configuration could not be loaded: {}", e))
        })
    }
}

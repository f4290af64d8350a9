use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::Db;
use crate::graph::{KindTable, RelationKind};
use crate::risk::direct::TierTable;
use crate::risk::max_propagation::MaxPropagationSettings;
use crate::risk::path_accumulation::PathSettings;
use crate::store::retry::RetryPolicy;
use crate::store::StoreSettings;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub riskprop: RiskpropConfig,
    #[serde(default)]
    pub propagation: PropagationConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub weights: WeightsConfig,
    #[serde(default)]
    pub tiers: TiersConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
}

/// Core settings
#[derive(Debug, Clone, Deserialize)]
pub struct RiskpropConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Max-propagation settings
#[derive(Debug, Clone, Deserialize)]
pub struct PropagationConfig {
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    #[serde(default = "default_true")]
    pub stop_at_fixpoint: bool,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            stop_at_fixpoint: true,
        }
    }
}

fn default_rounds() -> usize {
    3
}

fn default_true() -> bool {
    true
}

/// Path-accumulation settings
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_fan_out")]
    pub max_fan_out: usize,
    #[serde(default = "default_max_paths")]
    pub max_paths_per_entity: usize,
    /// Nodes whose upstream neighbors stay cached during a path run
    #[serde(default = "default_upstream_cache_size")]
    pub upstream_cache_size: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_fan_out: default_max_fan_out(),
            max_paths_per_entity: default_max_paths(),
            upstream_cache_size: default_upstream_cache_size(),
        }
    }
}

fn default_max_depth() -> usize {
    3
}

fn default_max_fan_out() -> usize {
    1000
}

fn default_max_paths() -> usize {
    10_000
}

fn default_upstream_cache_size() -> usize {
    10_000
}

/// Per-kind propagation weights
#[derive(Debug, Clone, Deserialize)]
pub struct WeightsConfig {
    #[serde(default = "default_ownership_weight")]
    pub ownership: f64,
    #[serde(default = "default_leadership_weight")]
    pub leadership: f64,
    #[serde(default = "default_kinship_weight")]
    pub kinship: f64,
    #[serde(default = "default_operation_weight")]
    pub operation: f64,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            ownership: default_ownership_weight(),
            leadership: default_leadership_weight(),
            kinship: default_kinship_weight(),
            operation: default_operation_weight(),
        }
    }
}

fn default_ownership_weight() -> f64 {
    1.0
}

fn default_leadership_weight() -> f64 {
    0.8
}

fn default_kinship_weight() -> f64 {
    0.5
}

fn default_operation_weight() -> f64 {
    1.0
}

impl WeightsConfig {
    pub fn weight(&self, kind: RelationKind) -> f64 {
        match kind {
            RelationKind::Ownership => self.ownership,
            RelationKind::Leadership => self.leadership,
            RelationKind::Kinship => self.kinship,
            RelationKind::Operation => self.operation,
        }
    }
}

/// Sanctions list tier scores. An empty `scores` table means the built-in OFAC tiers.
#[derive(Debug, Clone, Deserialize)]
pub struct TiersConfig {
    #[serde(default = "default_tier_score")]
    pub default_score: f64,
    #[serde(default)]
    pub scores: HashMap<String, f64>,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            default_score: default_tier_score(),
            scores: HashMap::new(),
        }
    }
}

fn default_tier_score() -> f64 {
    0.1
}

/// Batch write settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Run reporting settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportingConfig {
    /// Skips above this count fail the run. Unset means skips only warn.
    #[serde(default)]
    pub max_skipped: Option<u64>,
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in RISKPROP_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config_path = std::env::var("RISKPROP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.propagation.rounds == 0 {
            anyhow::bail!("propagation.rounds must be greater than 0");
        }

        if self.paths.max_depth == 0 {
            anyhow::bail!("paths.max_depth must be greater than 0");
        }

        if self.paths.max_fan_out == 0 || self.paths.max_paths_per_entity == 0 {
            anyhow::bail!(
                "paths.max_fan_out and paths.max_paths_per_entity must be greater than 0"
            );
        }

        if self.paths.upstream_cache_size == 0 {
            anyhow::bail!("paths.upstream_cache_size must be greater than 0");
        }

        for kind in RelationKind::ALL {
            let w = self.weights.weight(kind);
            if !(w > 0.0 && w <= 1.0) {
                anyhow::bail!("weights.{} must be in (0, 1], got {}", kind.name(), w);
            }
        }

        if !(0.0..=1.0).contains(&self.tiers.default_score) {
            anyhow::bail!("tiers.default_score must be between 0.0 and 1.0");
        }

        for (tier, score) in &self.tiers.scores {
            if !(0.0..=1.0).contains(score) {
                anyhow::bail!("tiers.scores.{} must be between 0.0 and 1.0, got {}", tier, score);
            }
        }

        if self.storage.batch_size == 0 {
            anyhow::bail!("storage.batch_size must be greater than 0");
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.riskprop.db_path
    }

    /// Database handle with the configured busy timeout
    pub fn open_db(&self) -> Db {
        Db::new(self.db_path())
            .with_busy_timeout(Duration::from_millis(self.storage.busy_timeout_ms))
    }

    /// Get migrations directory
    pub fn migrations_dir(&self) -> &Path {
        &self.riskprop.migrations_dir
    }

    /// Declarative relation-kind table built from `[weights]`
    pub fn kind_table(&self) -> KindTable {
        KindTable::with_weights(
            self.weights.ownership,
            self.weights.leadership,
            self.weights.kinship,
            self.weights.operation,
        )
    }

    /// Tier table built from `[tiers]`
    pub fn tier_table(&self) -> TierTable {
        if self.tiers.scores.is_empty() {
            TierTable::ofac(self.tiers.default_score)
        } else {
            TierTable::new(self.tiers.scores.clone(), self.tiers.default_score)
        }
    }

    /// Retry policy for batch writes
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.storage.max_retries,
            base_delay: Duration::from_millis(self.storage.retry_base_delay_ms),
        }
    }

    /// Batch size and retry policy for entity writes
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            batch_size: self.storage.batch_size,
            retry: self.retry_policy(),
        }
    }

    pub fn max_propagation_settings(&self) -> MaxPropagationSettings {
        MaxPropagationSettings {
            rounds: self.propagation.rounds,
            stop_at_fixpoint: self.propagation.stop_at_fixpoint,
        }
    }

    pub fn path_settings(&self) -> PathSettings {
        PathSettings {
            max_depth: self.paths.max_depth,
            max_fan_out: self.paths.max_fan_out,
            max_paths_per_entity: self.paths.max_paths_per_entity,
            upstream_cache_size: self.paths.upstream_cache_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    const MINIMAL: &str = r#"
[riskprop]
db_path = "./risk.db"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.propagation.rounds, 3);
        assert!(config.propagation.stop_at_fixpoint);
        assert_eq!(config.paths.max_depth, 3);
        assert_eq!(config.paths.upstream_cache_size, 10_000);
        assert_eq!(config.weights.leadership, 0.8);
        assert_eq!(config.tiers.default_score, 0.1);
        assert_eq!(config.storage.batch_size, 1000);
        assert!(config.reporting.max_skipped.is_none());
        assert_eq!(config.migrations_dir(), Path::new("migrations"));
    }

    #[test]
    fn test_zero_rounds_rejected() {
        let text = format!("{}\n[propagation]\nrounds = 0\n", MINIMAL);
        let err = Config::from_toml(&text).unwrap_err();
        assert!(err.to_string().contains("propagation.rounds"));
    }

    #[test]
    fn test_zero_depth_rejected() {
        let text = format!("{}\n[paths]\nmax_depth = 0\n", MINIMAL);
        assert!(Config::from_toml(&text).is_err());
    }

    #[test]
    fn test_upstream_cache_size_flows_into_path_settings() {
        let text = format!("{}\n[paths]\nupstream_cache_size = 64\n", MINIMAL);
        let config = Config::from_toml(&text).unwrap();
        assert_eq!(config.path_settings().upstream_cache_size, 64);

        let text = format!("{}\n[paths]\nupstream_cache_size = 0\n", MINIMAL);
        let err = Config::from_toml(&text).unwrap_err();
        assert!(err.to_string().contains("paths.upstream_cache_size"));
    }

    #[test]
    fn test_weight_out_of_range_rejected() {
        let text = format!("{}\n[weights]\nkinship = 0.0\n", MINIMAL);
        let err = Config::from_toml(&text).unwrap_err();
        assert!(err.to_string().contains("weights.kinship"));

        let text = format!("{}\n[weights]\noperation = 1.5\n", MINIMAL);
        assert!(Config::from_toml(&text).is_err());
    }

    #[test]
    fn test_custom_tiers_replace_ofac_table() {
        let text = format!(
            "{}\n[tiers]\ndefault_score = 0.2\n[tiers.scores]\nSDN = 1.0\n",
            MINIMAL
        );
        let config = Config::from_toml(&text).unwrap();
        let tiers = config.tier_table();
        assert_eq!(tiers.score("SDN"), (1.0, true));
        assert_eq!(tiers.score("1550"), (0.2, false));
    }

    #[test]
    fn test_operation_weight_flows_into_kind_table() {
        let text = format!("{}\n[weights]\noperation = 0.6\n", MINIMAL);
        let config = Config::from_toml(&text).unwrap();
        assert_eq!(config.kind_table().rule(RelationKind::Operation).weight, 0.6);
    }

    #[test]
    fn test_config_load_from_env_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("riskprop.toml");
        fs::write(&config_path, format!("{}\n[propagation]\nrounds = 7\n", MINIMAL)).unwrap();

        let original = std::env::var("RISKPROP_CONFIG").ok();
        std::env::set_var("RISKPROP_CONFIG", config_path.to_str().unwrap());
        let config = Config::load();
        std::env::remove_var("RISKPROP_CONFIG");
        if let Some(v) = original {
            std::env::set_var("RISKPROP_CONFIG", v);
        }

        let config = config.unwrap();
        assert_eq!(config.propagation.rounds, 7);
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("RISKPROP_CONFIG").ok();
        std::env::set_var("RISKPROP_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        std::env::remove_var("RISKPROP_CONFIG");
        if let Some(v) = original {
            std::env::set_var("RISKPROP_CONFIG", v);
        }
    }
}

//! Configuration management with validation and defaults
//!
//! `GameConfig` is loaded from an optional TOML file, then overridden from
//! `COLORBET_*` environment variables, then validated.

use crate::errors::{ColorbetResult, ConfigurationError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GameConfig {
    pub round: RoundConfig,
    pub payout: PayoutConfig,
    pub storage: StorageConfig,
    pub notifications: NotificationConfig,
    pub outcome: OutcomeConfig,
    pub history: HistoryConfig,
}

/// Round clock cadence
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoundConfig {
    /// Countdown a fresh round starts from
    pub round_duration_secs: u32,
    pub tick_interval_ms: u64,
    /// Extra lateness allowed before a tick is reported as drift
    pub drift_tolerance_ms: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            round_duration_secs: 30,
            tick_interval_ms: 1_000,
            drift_tolerance_ms: 1_000,
        }
    }
}

impl RoundConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn drift_tolerance(&self) -> Duration {
        Duration::from_millis(self.drift_tolerance_ms)
    }
}

/// Multipliers and house fee applied to winning bets
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PayoutConfig {
    pub number_multiplier: u64,
    pub color_multiplier: u64,
    pub size_multiplier: u64,
    /// House fee in basis points of the gross payout (300 = 3%)
    pub house_fee_bps: u64,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            number_multiplier: 9,
            color_multiplier: 2,
            size_multiplier: 2,
            house_fee_bps: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Rocksdb,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_directory: String,
    /// Upper bound for any single store call
    pub timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_directory: "./DB/colorbet_data".to_string(),
            timeout_ms: 2_000,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    pub broadcast_capacity: usize,
    pub per_user_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            per_user_capacity: 64,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStrategy {
    Uniform,
    /// Optional extension: draw among the numbers with the lowest liability
    MinimizePayout,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutcomeConfig {
    pub strategy: OutcomeStrategy,
    /// Fixed RNG seed; leave unset in production
    pub seed: Option<u64>,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            strategy: OutcomeStrategy::Uniform,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 500,
        }
    }
}

impl HistoryConfig {
    /// Resolve a caller-supplied limit against the default and the cap
    pub fn clamp(&self, requested: Option<usize>) -> usize {
        requested
            .filter(|limit| *limit > 0)
            .unwrap_or(self.default_limit)
            .min(self.max_limit)
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> ColorbetResult<GameConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            self.load_from_file(path)?
        } else {
            GameConfig::default()
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> ColorbetResult<GameConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_env_overrides(&self, config: &mut GameConfig) -> ColorbetResult<()> {
        if let Some(secs) = parse_env::<u32>("COLORBET_ROUND_SECS")? {
            config.round.round_duration_secs = secs;
        }
        if let Some(ms) = parse_env::<u64>("COLORBET_TICK_MS")? {
            config.round.tick_interval_ms = ms;
        }
        if let Ok(data_dir) = env::var("COLORBET_DATA_DIR") {
            config.storage.data_directory = data_dir;
        }
        if let Ok(backend) = env::var("COLORBET_STORAGE_BACKEND") {
            config.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "rocksdb" => StorageBackend::Rocksdb,
                _ => {
                    return Err(ConfigurationError::InvalidValue {
                        field: "COLORBET_STORAGE_BACKEND".to_string(),
                        value: backend,
                        reason: "Expected memory or rocksdb".to_string(),
                    }
                    .into())
                }
            };
        }
        if let Some(ms) = parse_env::<u64>("COLORBET_STORAGE_TIMEOUT_MS")? {
            config.storage.timeout_ms = ms;
        }
        if let Some(seed) = parse_env::<u64>("COLORBET_OUTCOME_SEED")? {
            config.outcome.seed = Some(seed);
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self, config: &GameConfig) -> ColorbetResult<()> {
        if config.round.round_duration_secs == 0 {
            return Err(invalid("round.round_duration_secs", "0", "Round must last at least one tick"));
        }
        if config.round.tick_interval_ms < 10 {
            return Err(invalid(
                "round.tick_interval_ms",
                &config.round.tick_interval_ms.to_string(),
                "Tick interval must be at least 10ms",
            ));
        }
        if config.payout.house_fee_bps >= 10_000 {
            return Err(invalid(
                "payout.house_fee_bps",
                &config.payout.house_fee_bps.to_string(),
                "House fee must be below 100%",
            ));
        }
        for (field, value) in [
            ("payout.number_multiplier", config.payout.number_multiplier),
            ("payout.color_multiplier", config.payout.color_multiplier),
            ("payout.size_multiplier", config.payout.size_multiplier),
        ] {
            if value == 0 {
                return Err(invalid(field, "0", "Multiplier cannot be zero"));
            }
        }
        if config.storage.timeout_ms == 0 {
            return Err(invalid("storage.timeout_ms", "0", "Storage timeout cannot be zero"));
        }
        if config.storage.backend == StorageBackend::Rocksdb && config.storage.data_directory.is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_directory".to_string()).into());
        }
        if config.notifications.broadcast_capacity == 0 || config.notifications.per_user_capacity == 0 {
            return Err(invalid("notifications", "0", "Channel capacities cannot be zero"));
        }
        if config.history.default_limit == 0 || config.history.default_limit > config.history.max_limit {
            return Err(invalid(
                "history.default_limit",
                &config.history.default_limit.to_string(),
                "Default limit must be between 1 and history.max_limit",
            ));
        }

        Ok(())
    }

    pub fn save(&self, config: &GameConfig, path: &str) -> ColorbetResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> ColorbetResult<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw.parse().map(Some).map_err(|_| {
            ConfigurationError::InvalidValue {
                field: name.to_string(),
                value: raw,
                reason: "Not a valid number".to_string(),
            }
            .into()
        }),
        Err(_) => Ok(None),
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> crate::errors::ColorbetError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Builder pattern for creating configurations
pub struct ConfigBuilder {
    config: GameConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: GameConfig::default(),
        }
    }

    pub fn round_duration_secs(mut self, secs: u32) -> Self {
        self.config.round.round_duration_secs = secs;
        self
    }

    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.config.round.tick_interval_ms = ms;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn storage_timeout_ms(mut self, ms: u64) -> Self {
        self.config.storage.timeout_ms = ms;
        self
    }

    pub fn payout(mut self, payout: PayoutConfig) -> Self {
        self.config.payout = payout;
        self
    }

    pub fn outcome(mut self, strategy: OutcomeStrategy, seed: Option<u64>) -> Self {
        self.config.outcome = OutcomeConfig { strategy, seed };
        self
    }

    pub fn build(self) -> GameConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = GameConfig::default();
        assert_eq!(config.round.round_duration_secs, 30);
        assert_eq!(config.round.tick_interval_ms, 1_000);
        assert_eq!(config.payout.house_fee_bps, 300);
        assert_eq!(config.outcome.strategy, OutcomeStrategy::Uniform);
    }

    #[test]
    fn test_config_validation() {
        let loader = ConfigLoader::new();
        let mut config = GameConfig::default();
        assert!(loader.validate(&config).is_ok());

        config.round.round_duration_secs = 0;
        assert!(loader.validate(&config).is_err());

        let mut config = GameConfig::default();
        config.payout.house_fee_bps = 10_000;
        assert!(loader.validate(&config).is_err());

        let mut config = GameConfig::default();
        config.payout.number_multiplier = 0;
        assert!(loader.validate(&config).is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .round_duration_secs(5)
            .tick_interval_ms(50)
            .outcome(OutcomeStrategy::MinimizePayout, Some(42))
            .build();

        assert_eq!(config.round.round_duration_secs, 5);
        assert_eq!(config.round.tick_interval(), Duration::from_millis(50));
        assert_eq!(config.outcome.seed, Some(42));
    }

    #[test]
    fn test_history_clamp() {
        let history = HistoryConfig::default();
        assert_eq!(history.clamp(None), 50);
        assert_eq!(history.clamp(Some(0)), 50);
        assert_eq!(history.clamp(Some(10)), 10);
        assert_eq!(history.clamp(Some(10_000)), 500);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = ConfigBuilder::new().round_duration_secs(45).build();
        let loader = ConfigLoader::new();
        loader.save(&config, &path).unwrap();

        let loaded = ConfigLoader::new().with_path(&path).load_from_file(&path).unwrap();
        assert_eq!(loaded.round.round_duration_secs, 45);
        assert_eq!(loaded.payout, config.payout);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[round]\nround_duration_secs = 12\n").unwrap();

        let loaded = ConfigLoader::new()
            .load_from_file(&file.path().to_string_lossy())
            .unwrap();
        assert_eq!(loaded.round.round_duration_secs, 12);
        assert_eq!(loaded.round.tick_interval_ms, 1_000);
        assert_eq!(loaded.history.default_limit, 50);
    }
}

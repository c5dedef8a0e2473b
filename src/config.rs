//! Configuration management with validation and defaults
//!
//! Values come from defaults, an optional TOML file, then `WAGER_*`
//! environment variables, and are validated once before the engine starts.

use crate::common::types::UserId;
use crate::errors::{ConfigurationError, WagerResult};
use crate::games::slots::BetLadder;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WagerConfig {
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    pub sessions: SessionConfig,
    pub blackjack: BlackjackConfig,
    pub slots: SlotsConfig,
    pub prediction: PredictionConfig,
    pub logging: LoggingConfig,
}

/// Where the balance, event and profile record sets live
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub balances_file: String,
    pub predictions_file: String,
    pub profiles_file: String,
    /// Keep everything in memory; nothing survives a restart.
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./wager_data".to_string(),
            balances_file: "points.json".to_string(),
            predictions_file: "predictions.json".to_string(),
            profiles_file: "profiles.json".to_string(),
            in_memory: false,
        }
    }
}

impl StorageConfig {
    pub fn balances_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.balances_file)
    }

    pub fn predictions_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.predictions_file)
    }

    pub fn profiles_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.profiles_file)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Points credited for one unit of chat activity.
    pub activity_reward: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { activity_reward: 1 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 180,
            reap_interval_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> chrono::Duration {
        window(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackjackConfig {
    pub min_stake: u64,
}

impl Default for BlackjackConfig {
    fn default() -> Self {
        Self { min_stake: 10 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotsConfig {
    pub bet_ladder: Vec<u64>,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            bet_ladder: BetLadder::default().rungs().to_vec(),
        }
    }
}

impl SlotsConfig {
    pub fn ladder(&self) -> WagerResult<BetLadder> {
        BetLadder::new(self.bet_ladder.clone())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub max_open_per_host: usize,
    pub min_dwell_secs: u64,
    /// Winners receive `stake * payout_multiplier`.
    pub payout_multiplier: u64,
    /// Users allowed to resolve any event, not just their own.
    pub moderators: Vec<UserId>,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            max_open_per_host: 5,
            min_dwell_secs: 60,
            payout_multiplier: 2,
            moderators: Vec::new(),
        }
    }
}

impl PredictionConfig {
    pub fn min_dwell(&self) -> chrono::Duration {
        window(self.min_dwell_secs)
    }

    pub fn is_moderator(&self, user: UserId) -> bool {
        self.moderators.contains(&user)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    data_dir: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            data_dir: None,
        }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Override the data directory after the file and environment are read
    pub fn with_data_dir<S: Into<String>>(mut self, dir: S) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> WagerResult<WagerConfig> {
        let mut config = match self.config_path {
            Some(ref path) => self.load_from_file(path)?,
            None => WagerConfig::default(),
        };

        self.apply_overrides(&mut config, |key| env::var(key).ok())?;
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = dir.clone();
        }
        self.validate(&config)?;
        Ok(config)
    }

    fn load_from_file(&self, path: &Path) -> WagerResult<WagerConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    /// Apply `WAGER_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&self, config: &mut WagerConfig, lookup: F) -> WagerResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(data_dir) = lookup("WAGER_DATA_DIR") {
            config.storage.data_dir = data_dir;
        }
        if let Some(timeout) = lookup("WAGER_IDLE_TIMEOUT_SECS") {
            config.sessions.idle_timeout_secs = parse_secs("WAGER_IDLE_TIMEOUT_SECS", timeout)?;
        }
        if let Some(dwell) = lookup("WAGER_MIN_DWELL_SECS") {
            config.prediction.min_dwell_secs = parse_secs("WAGER_MIN_DWELL_SECS", dwell)?;
        }
        if let Some(level) = lookup("WAGER_LOG_LEVEL") {
            config.logging.level = level;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self, config: &WagerConfig) -> WagerResult<()> {
        if !config.storage.in_memory {
            if config.storage.data_dir.is_empty() {
                return Err(ConfigurationError::MissingRequired("storage.data_dir".to_string()).into());
            }
            let files = [
                ("storage.balances_file", &config.storage.balances_file),
                ("storage.predictions_file", &config.storage.predictions_file),
                ("storage.profiles_file", &config.storage.profiles_file),
            ];
            for (i, (field, name)) in files.iter().enumerate() {
                if name.is_empty() {
                    return Err(ConfigurationError::MissingRequired(field.to_string()).into());
                }
                if files[..i].iter().any(|(_, earlier)| earlier == name) {
                    return Err(invalid(field, name, "must differ from the other storage files"));
                }
            }
        }

        if config.sessions.idle_timeout_secs == 0 {
            return Err(invalid("sessions.idle_timeout_secs", "0", "Idle timeout cannot be zero"));
        }
        if config.sessions.reap_interval_secs == 0 {
            return Err(invalid("sessions.reap_interval_secs", "0", "Reap interval cannot be zero"));
        }

        if config.blackjack.min_stake == 0 {
            return Err(invalid("blackjack.min_stake", "0", "Minimum stake cannot be zero"));
        }

        config.slots.ladder()?;

        if config.prediction.max_open_per_host == 0 {
            return Err(invalid(
                "prediction.max_open_per_host",
                "0",
                "Hosts must be allowed at least one open event",
            ));
        }
        if config.prediction.payout_multiplier == 0 {
            return Err(invalid(
                "prediction.payout_multiplier",
                "0",
                "Winners must be paid something",
            ));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, config: &WagerConfig, path: P) -> WagerResult<()> {
        let path = path.as_ref();
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path.display(), e)).into()
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds as a chrono duration, saturating at a century.
fn window(secs: u64) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_secs(secs)).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn invalid(field: &str, value: &str, reason: &str) -> crate::errors::WagerError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn parse_secs(field: &str, value: String) -> WagerResult<u64> {
    value.parse().map_err(|_| {
        ConfigurationError::InvalidValue {
            field: field.to_string(),
            value,
            reason: "Invalid number of seconds".to_string(),
        }
        .into()
    })
}

/// Generate a sample configuration file
pub fn generate_sample_config<P: AsRef<Path>>(path: P) -> WagerResult<()> {
    ConfigLoader::new().save(&WagerConfig::default(), path)
}

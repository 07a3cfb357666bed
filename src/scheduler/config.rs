//! Schedule configuration and its persisted store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::provider::ProviderId;
use crate::storage::{read_optional, write_json_atomic, StorageError};

pub const CONFIG_FILE: &str = "config.json";

/// Which providers a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSelection {
    OpenSpeedTest,
    SpeedSmart,
    Both,
}

impl ProviderSelection {
    /// Providers in the order a cycle invokes them.
    pub fn providers(&self) -> Vec<ProviderId> {
        match self {
            ProviderSelection::OpenSpeedTest => vec![ProviderId::OpenSpeedTest],
            ProviderSelection::SpeedSmart => vec![ProviderId::SpeedSmart],
            ProviderSelection::Both => vec![ProviderId::OpenSpeedTest, ProviderId::SpeedSmart],
        }
    }
}

impl fmt::Display for ProviderSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderSelection::OpenSpeedTest => f.write_str("openspeedtest"),
            ProviderSelection::SpeedSmart => f.write_str("speedsmart"),
            ProviderSelection::Both => f.write_str("both"),
        }
    }
}

impl FromStr for ProviderSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openspeedtest" => Ok(ProviderSelection::OpenSpeedTest),
            "speedsmart" => Ok(ProviderSelection::SpeedSmart),
            "both" => Ok(ProviderSelection::Both),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

/// The automatic testing schedule. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub provider: ProviderSelection,
    pub delay_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 86_400,
            provider: ProviderSelection::Both,
            delay_secs: 300,
        }
    }
}

/// Upper bound for `interval_secs` and `delay_secs`: ten years.
pub const MAX_SCHEDULE_SECS: u64 = 10 * 365 * 86_400;

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        if self.interval_secs > MAX_SCHEDULE_SECS {
            return Err(ConfigError::IntervalTooLarge(self.interval_secs));
        }
        if self.delay_secs > MAX_SCHEDULE_SECS {
            return Err(ConfigError::DelayTooLarge(self.delay_secs));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("interval must be greater than zero seconds")]
    InvalidInterval,

    #[error("interval of {0}s exceeds the maximum of {MAX_SCHEDULE_SECS}s")]
    IntervalTooLarge(u64),

    #[error("delay of {0}s exceeds the maximum of {MAX_SCHEDULE_SECS}s")]
    DelayTooLarge(u64),

    #[error("unknown provider selection '{0}' (expected openspeedtest, speedsmart or both)")]
    UnknownProvider(String),

    #[error("failed to persist schedule config: {0}")]
    Storage(#[from] StorageError),
}

/// Holds the current [`ScheduleConfig`] and persists every accepted update.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: watch::Sender<ScheduleConfig>,
    write: Mutex<()>,
}

impl ConfigStore {
    /// Load the persisted config under `data_dir`, or persist `defaults` if
    /// there is none (or it is unusable).
    pub async fn load(data_dir: &Path, defaults: ScheduleConfig) -> Result<Self, ConfigError> {
        defaults.validate()?;
        let path = data_dir.join(CONFIG_FILE);

        let persisted = match read_optional(&path).await? {
            None => None,
            Some(bytes) => match serde_json::from_slice::<ScheduleConfig>(&bytes) {
                Ok(cfg) => match cfg.validate() {
                    Ok(()) => Some(cfg),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "persisted schedule config invalid, using defaults");
                        None
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "persisted schedule config unreadable, using defaults");
                    None
                }
            },
        };

        let config = match persisted {
            Some(cfg) => {
                info!(path = %path.display(), ?cfg, "loaded schedule config");
                cfg
            }
            None => {
                write_json_atomic(&path, &defaults).await?;
                info!(path = %path.display(), cfg = ?defaults, "initialized schedule config from defaults");
                defaults
            }
        };

        let (current, _) = watch::channel(config);
        Ok(Self {
            path,
            current,
            write: Mutex::new(()),
        })
    }

    pub fn get(&self) -> ScheduleConfig {
        *self.current.borrow()
    }

    /// Validate, persist, then publish `candidate`. On any error the previous
    /// config stays in effect.
    pub async fn set(&self, candidate: ScheduleConfig) -> Result<ScheduleConfig, ConfigError> {
        candidate.validate()?;
        let _guard = self.write.lock().await;
        self.commit(candidate).await
    }

    /// Build a candidate from the current config and [`set`](Self::set) it
    /// without another writer interleaving.
    pub async fn update<F>(&self, f: F) -> Result<ScheduleConfig, ConfigError>
    where
        F: FnOnce(ScheduleConfig) -> Result<ScheduleConfig, ConfigError>,
    {
        let _guard = self.write.lock().await;
        let candidate = f(self.get())?;
        candidate.validate()?;
        self.commit(candidate).await
    }

    pub fn subscribe(&self) -> watch::Receiver<ScheduleConfig> {
        self.current.subscribe()
    }

    async fn commit(&self, candidate: ScheduleConfig) -> Result<ScheduleConfig, ConfigError> {
        write_json_atomic(&self.path, &candidate).await?;
        self.current.send_replace(candidate);
        info!(cfg = ?candidate, "schedule config updated");
        Ok(candidate)
    }
}

//! TOML configuration for the speedchecker daemon.
//!
//! Every section has defaults, so an empty (or absent) file is a valid
//! configuration. The schedule section only seeds the persisted schedule on
//! first startup; after that the schedule is owned by the config store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::provider::{CommandProbe, ProbeSet, ProviderId};
use crate::scheduler::{profiles, RunnerSettings, ScheduleConfig};

pub const CONFIG_ENV: &str = "SPEEDCHECKER_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/speedchecker/speedchecker.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub probes: ProbesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "profiles::defaults")]
    pub schedule: ScheduleConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .schedule
            .validate()
            .with_context(|| format!("invalid [schedule] in {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit` (a `--config` flag); failure to load it is an error.
    /// 2. The path in `SPEEDCHECKER_CONFIG`.
    /// 3. `/etc/speedchecker/speedchecker.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SPEEDCHECKER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Schedule used when no persisted schedule exists yet: the `[schedule]`
    /// section overlaid with `AUTO_TEST_*` environment variables.
    pub fn schedule_defaults(&self) -> ScheduleConfig {
        profiles::apply_env(self.schedule, |k| std::env::var(k).ok())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3667".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the history files and the persisted schedule.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the loop re-evaluates whether a cycle is due.
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// External program implementing one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbesConfig {
    /// Upper bound for a single probe attempt.
    pub timeout_secs: u64,
    /// Attempts per provider invocation before recording a failure.
    pub attempts: u32,
    /// Pause between attempts.
    pub retry_delay_secs: u64,
    pub openspeedtest: ProbeCommand,
    pub speedsmart: ProbeCommand,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            attempts: 3,
            retry_delay_secs: 2,
            openspeedtest: ProbeCommand {
                program: "python3".to_string(),
                args: vec!["/app/probes/openspeedtest.py".to_string()],
            },
            speedsmart: ProbeCommand {
                program: "python3".to_string(),
                args: vec!["/app/probes/speedsmart.py".to_string()],
            },
        }
    }
}

impl ProbesConfig {
    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            attempts: self.attempts.max(1),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    pub fn command(&self, id: ProviderId) -> &ProbeCommand {
        match id {
            ProviderId::OpenSpeedTest => &self.openspeedtest,
            ProviderId::SpeedSmart => &self.speedsmart,
        }
    }

    /// One [`CommandProbe`] per provider, launching the configured program.
    pub fn probe_set(&self) -> ProbeSet {
        ProviderId::ALL.iter().fold(ProbeSet::new(), |set, &id| {
            let cmd = self.command(id);
            set.with(
                id,
                Arc::new(CommandProbe::new(id, cmd.program.clone(), cmd.args.clone())),
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

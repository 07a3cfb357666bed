//! Scheduling: config store, run exclusion, cycle execution and the loop.

pub mod config;
pub mod engine;
pub mod gate;
pub mod history;
pub mod profiles;
pub mod runner;

use thiserror::Error;

// Re-export common types
pub use self::config::{ConfigError, ConfigStore, ProviderSelection, ScheduleConfig};
pub use self::engine::{Scheduler, SchedulerStatus, TickOutcome};
pub use self::gate::{RunGate, RunToken};
pub use self::history::{ActiveProbe, CycleReport, CycleStatus, CycleTrigger};
pub use self::runner::{ProbeRunner, RunnerSettings};

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Another cycle holds the run token. Expected; not an internal fault.
    #[error("a measurement cycle is already in progress")]
    CycleInProgress,

    #[error("measurement cycle crashed: {0}")]
    CycleCrashed(String),
}

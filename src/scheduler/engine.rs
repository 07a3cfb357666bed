//! The scheduling loop.
//!
//! One [`Scheduler`] re-reads the schedule on every tick and starts a cycle
//! when one is due. Manual runs enter through the same [`RunGate`], so a
//! scheduled and a manual cycle can never overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConfigStore, ProviderSelection, ScheduleConfig};
use super::gate::{RunGate, RunToken};
use super::history::{ActiveProbe, CycleReport, CycleStatus, CycleTrigger};
use super::runner::ProbeRunner;
use super::SchedulerError;
use crate::clock::Clock;
use crate::storage::StorageError;

/// `last + interval_secs`, or `None` if that is not representable.
pub fn next_due_after(last: DateTime<Utc>, interval_secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(interval_secs).ok()?;
    last.checked_add_signed(chrono::Duration::try_seconds(secs)?)
}

/// Whether a cycle is due under `config`, given the last completion time.
/// With no previous run a cycle is due immediately; an interval that
/// overflows the calendar is never due.
pub fn is_due(config: &ScheduleConfig, last_completed: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    if !config.enabled {
        return false;
    }
    match last_completed {
        None => true,
        Some(last) => next_due_after(last, config.interval_secs).is_some_and(|due| now >= due),
    }
}

/// Result of a single scheduling decision.
#[derive(Debug)]
pub enum TickOutcome {
    Disabled,
    NotDue { next_due_at: DateTime<Utc> },
    /// A cycle (probably manual) already holds the run token.
    Busy,
    Ran(CycleReport),
    /// The cycle task panicked; the run token has been released.
    Crashed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub interval_secs: u64,
    pub provider: ProviderSelection,
    pub delay_secs: u64,
    pub running: bool,
    pub running_trigger: Option<CycleTrigger>,
    pub running_since: Option<DateTime<Utc>>,
    /// Provider being measured right now (absent during the inter-provider delay).
    pub active_probe: Option<ActiveProbe>,
    pub last_run_completed_at: Option<DateTime<Utc>>,
    pub next_due_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// The single automatic trigger for probe cycles, plus the manual entry
/// point that shares its run token. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    config: Arc<ConfigStore>,
    runner: Arc<ProbeRunner>,
    gate: RunGate,
    clock: Arc<dyn Clock>,
    last_completed: Arc<Mutex<Option<DateTime<Utc>>>>,
    loop_started: Arc<AtomicBool>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Build the scheduler, seeding the last completion time from the newest
    /// history record so a restart does not fire immediately.
    pub async fn new(
        config: Arc<ConfigStore>,
        runner: Arc<ProbeRunner>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self, StorageError> {
        let last = runner.history().latest().await?.map(|r| r.timestamp);
        if let Some(last) = last {
            info!(%last, "resuming schedule from most recent measurement");
        }
        Ok(Self {
            config,
            runner,
            gate: RunGate::new(),
            clock,
            last_completed: Arc::new(Mutex::new(last)),
            loop_started: Arc::new(AtomicBool::new(false)),
            poll_interval,
            shutdown,
        })
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn runner(&self) -> &Arc<ProbeRunner> {
        &self.runner
    }

    pub fn gate(&self) -> &RunGate {
        &self.gate
    }

    pub fn last_run_completed_at(&self) -> Option<DateTime<Utc>> {
        *self.last_completed.lock()
    }

    /// Evaluate the decision rule once and run a cycle if it says so.
    /// The config is read fresh on every call.
    pub async fn tick(&self) -> TickOutcome {
        let config = self.config.get();
        if !config.enabled {
            return TickOutcome::Disabled;
        }

        let now = self.clock.now();
        let last = self.last_run_completed_at();
        if !is_due(&config, last, now) {
            let next_due_at = last
                .map(|l| next_due_after(l, config.interval_secs).unwrap_or(DateTime::<Utc>::MAX_UTC))
                .unwrap_or(now);
            return TickOutcome::NotDue { next_due_at };
        }

        let Some(token) = self.gate.try_acquire(CycleTrigger::Scheduled) else {
            return TickOutcome::Busy;
        };
        match self.spawn_cycle(token, config).await {
            Ok(report) => TickOutcome::Ran(report),
            Err(e) => TickOutcome::Crashed(e.to_string()),
        }
    }

    /// Start a manual cycle in the background.
    ///
    /// Fails immediately with [`SchedulerError::CycleInProgress`] if any
    /// cycle holds the run token; requests are never queued.
    pub fn trigger_manual(&self) -> Result<JoinHandle<Result<CycleReport, SchedulerError>>, SchedulerError> {
        let token = self
            .gate
            .try_acquire(CycleTrigger::Manual)
            .ok_or(SchedulerError::CycleInProgress)?;
        let config = self.config.get();
        info!(selection = %config.provider, "manual cycle requested");
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let result = this.spawn_cycle(token, config).await;
            match &result {
                Ok(report) => info!(
                    cycle_id = %report.cycle_id,
                    status = ?report.status,
                    "manual cycle complete"
                ),
                Err(e) => error!(error = %e, "manual cycle crashed"),
            }
            result
        }))
    }

    /// Run a manual cycle and wait for it.
    pub async fn run_now(&self) -> Result<CycleReport, SchedulerError> {
        self.trigger_manual()?
            .await
            .map_err(|e| SchedulerError::CycleCrashed(e.to_string()))?
    }

    /// Main loop: poll on a fixed tick until shutdown.
    pub async fn run(self) {
        if self.loop_started.swap(true, Ordering::SeqCst) {
            warn!("scheduler loop already running; refusing to start a second one");
            return;
        }
        info!(poll_secs = self.poll_interval.as_secs_f64(), "scheduler loop started");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick().await {
                TickOutcome::Disabled => debug!("automatic testing disabled"),
                TickOutcome::NotDue { next_due_at } => debug!(%next_due_at, "no cycle due"),
                TickOutcome::Busy => debug!("cycle already in progress, skipping tick"),
                TickOutcome::Crashed(reason) => error!(%reason, "scheduled cycle crashed"),
                TickOutcome::Ran(report) => info!(
                    cycle_id = %report.cycle_id,
                    status = ?report.status,
                    "scheduled cycle complete"
                ),
            }
        }

        self.loop_started.store(false, Ordering::SeqCst);
        info!("scheduler loop stopped");
    }

    pub fn status(&self) -> SchedulerStatus {
        let config = self.config.get();
        let now = self.clock.now();
        let last = self.last_run_completed_at();
        let holder = self.gate.holder();
        let next_due_at = if config.enabled {
            match last {
                None => Some(now),
                Some(l) => next_due_after(l, config.interval_secs),
            }
        } else {
            None
        };
        SchedulerStatus {
            enabled: config.enabled,
            interval_secs: config.interval_secs,
            provider: config.provider,
            delay_secs: config.delay_secs,
            running: self.gate.is_busy(),
            running_trigger: holder.map(|(t, _)| t),
            running_since: holder.map(|(_, since)| since),
            active_probe: self.runner.active(),
            last_run_completed_at: last,
            next_due_at,
            now,
        }
    }

    /// Run the cycle on its own task so a panicking probe cannot take the
    /// caller down with it. The token moves into the task and is released
    /// when it ends, panics included.
    async fn spawn_cycle(&self, token: RunToken, config: ScheduleConfig) -> Result<CycleReport, SchedulerError> {
        let runner = self.runner.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let report = runner.run_cycle(&token, config, &shutdown).await;
            (token, report)
        });

        let (token, report) = handle
            .await
            .map_err(|e| SchedulerError::CycleCrashed(e.to_string()))?;
        if report.status != CycleStatus::Aborted {
            *self.last_completed.lock() = Some(self.clock.now());
        }
        drop(token);
        Ok(report)
    }
}

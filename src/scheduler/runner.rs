//! Probe cycle execution.
//!
//! A cycle invokes the selected providers one after another (never in
//! parallel), waits the configured delay between them, and appends each
//! outcome to history as soon as it is known.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::config::ScheduleConfig;
use super::gate::RunToken;
use super::history::{ActiveProbe, CycleReport, CycleStatus};
use crate::clock::Clock;
use crate::provider::{ProbeError, ProbeOutcome, ProbeSet, ProviderId};
use crate::storage::{HistoryStore, MeasurementRecord};

/// Per-invocation limits.
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

pub struct ProbeRunner {
    probes: ProbeSet,
    history: HistoryStore,
    clock: Arc<dyn Clock>,
    settings: RunnerSettings,
    active: Mutex<Option<ActiveProbe>>,
}

/// Clears the runner's active provider when the invocation ends, however it ends.
struct ActiveGuard<'a>(&'a Mutex<Option<ActiveProbe>>);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

impl ProbeRunner {
    pub fn new(
        probes: ProbeSet,
        history: HistoryStore,
        clock: Arc<dyn Clock>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            probes,
            history,
            clock,
            settings,
            active: Mutex::new(None),
        }
    }

    /// Provider being measured right now, if any.
    pub fn active(&self) -> Option<ActiveProbe> {
        *self.active.lock()
    }

    fn mark_active(&self, provider: ProviderId) -> ActiveGuard<'_> {
        *self.active.lock() = Some(ActiveProbe {
            provider,
            started_at: self.clock.now(),
        });
        ActiveGuard(&self.active)
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn probes(&self) -> &ProbeSet {
        &self.probes
    }

    /// Run one cycle with the given config snapshot.
    ///
    /// The caller proves exclusivity by lending its [`RunToken`]; the token
    /// stays held for the whole cycle, inter-probe delay included. When
    /// `shutdown` fires, the in-flight probe or delay is abandoned but an
    /// append already under way is allowed to finish.
    pub async fn run_cycle(
        &self,
        token: &RunToken,
        config: ScheduleConfig,
        shutdown: &CancellationToken,
    ) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %cycle_id, trigger = ?token.trigger());
        self.run_cycle_inner(cycle_id, token, config, shutdown)
            .instrument(span)
            .await
    }

    async fn run_cycle_inner(
        &self,
        cycle_id: Uuid,
        token: &RunToken,
        config: ScheduleConfig,
        shutdown: &CancellationToken,
    ) -> CycleReport {
        let started_at = self.clock.now();
        let providers = config.provider.providers();
        info!(selection = %config.provider, delay_secs = config.delay_secs, "cycle started");

        let mut records = Vec::with_capacity(providers.len());
        let mut storage_errors = Vec::new();
        let mut aborted = false;

        for (i, provider) in providers.into_iter().enumerate() {
            if i > 0 && config.delay_secs > 0 {
                info!(next = %provider, delay_secs = config.delay_secs, "waiting before next provider");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        aborted = true;
                        break;
                    }
                    _ = tokio::time::sleep(config.delay()) => {}
                }
            }

            let active = self.mark_active(provider);
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    aborted = true;
                    break;
                }
                outcome = self.invoke(provider) => outcome,
            };
            drop(active);

            let finished = self.clock.now();
            let record = match outcome {
                Ok(outcome) => {
                    info!(
                        %provider,
                        download_mbps = ?outcome.download_mbps,
                        upload_mbps = ?outcome.upload_mbps,
                        latency_ms = ?outcome.latency_ms,
                        "probe finished"
                    );
                    MeasurementRecord::success(provider, finished, outcome)
                }
                Err(e) => {
                    warn!(%provider, error = %e, "probe failed");
                    MeasurementRecord::failed(provider, finished, e.to_string())
                }
            };

            match self.history.append(record).await {
                Ok(stored) => records.push(stored),
                Err(e) => {
                    error!(%provider, error = %e, "failed to store measurement");
                    storage_errors.push(format!("{provider}: {e}"));
                }
            }
        }

        let status = if aborted {
            CycleStatus::Aborted
        } else if !storage_errors.is_empty() || records.iter().any(|r| !r.is_success()) {
            CycleStatus::Degraded
        } else {
            CycleStatus::Success
        };

        let report = CycleReport {
            cycle_id,
            trigger: token.trigger(),
            status,
            started_at,
            finished_at: self.clock.now(),
            records,
            storage_errors,
        };
        info!(
            status = ?report.status,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "cycle finished"
        );
        report
    }

    /// Invoke one provider, retrying up to `attempts` times. Each attempt is
    /// bounded by `timeout` even if the probe ignores the limit it is given.
    async fn invoke(&self, provider: ProviderId) -> Result<ProbeOutcome, ProbeError> {
        let probe = self
            .probes
            .get(provider)
            .ok_or(ProbeError::NotRegistered(provider))?;
        let attempts = self.settings.attempts.max(1);
        let timeout = self.settings.timeout;

        let mut last_err = ProbeError::Timeout {
            secs: timeout.as_secs(),
        };
        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, probe.run(timeout)).await {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(e)) => last_err = e,
                Err(_) => {
                    last_err = ProbeError::Timeout {
                        secs: timeout.as_secs(),
                    }
                }
            }
            if attempt < attempts {
                warn!(%provider, attempt, error = %last_err, "probe attempt failed, retrying");
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }
        Err(last_err)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProbe;
    use super::*;
    use crate::clock::TokioClock;
    use crate::scheduler::config::ProviderSelection;
    use crate::scheduler::gate::RunGate;
    use crate::scheduler::history::CycleTrigger;
    use crate::storage::HistoryFilter;
    use chrono::Utc;

    fn settings() -> RunnerSettings {
        RunnerSettings {
            timeout: Duration::from_secs(30),
            attempts: 1,
            retry_delay: Duration::from_secs(2),
        }
    }

    fn config(provider: ProviderSelection, delay_secs: u64) -> ScheduleConfig {
        ScheduleConfig {
            enabled: true,
            interval_secs: 3600,
            provider,
            delay_secs,
        }
    }

    async fn runner(dir: &std::path::Path, probes: ProbeSet, settings: RunnerSettings) -> ProbeRunner {
        let history = HistoryStore::open(dir).await.unwrap();
        ProbeRunner::new(probes, history, Arc::new(TokioClock::starting_at(Utc::now())), settings)
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_runs_sequentially_with_delay() {
        let dir = tempfile::tempdir().unwrap();
        let ost = ScriptedProbe::ok(ProviderId::OpenSpeedTest, Duration::from_secs(20));
        let ss = ScriptedProbe::ok(ProviderId::SpeedSmart, Duration::from_secs(20));
        let probes = ProbeSet::new()
            .with(ProviderId::OpenSpeedTest, ost.clone())
            .with(ProviderId::SpeedSmart, ss.clone());
        let runner = runner(dir.path(), probes, settings()).await;
        let gate = RunGate::new();
        let token = gate.try_acquire(CycleTrigger::Manual).unwrap();

        let report = runner
            .run_cycle(&token, config(ProviderSelection::Both, 5), &CancellationToken::new())
            .await;

        assert_eq!(report.status, CycleStatus::Success);
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].provider, ProviderId::OpenSpeedTest);
        assert_eq!(report.records[1].provider, ProviderId::SpeedSmart);
        // Second probe starts after the delay and takes 20s itself.
        let gap = report.records[1].timestamp - report.records[0].timestamp;
        assert!(gap >= chrono::Duration::seconds(25), "gap was {gap}");
        assert_eq!((ost.calls(), ss.calls()), (1, 1));

        let stored = runner.history().list(&HistoryFilter::all()).await.unwrap();
        assert_eq!(stored, report.records);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_provider_selection() {
        let dir = tempfile::tempdir().unwrap();
        let ost = ScriptedProbe::ok(ProviderId::OpenSpeedTest, Duration::ZERO);
        let ss = ScriptedProbe::ok(ProviderId::SpeedSmart, Duration::ZERO);
        let probes = ProbeSet::new()
            .with(ProviderId::OpenSpeedTest, ost.clone())
            .with(ProviderId::SpeedSmart, ss.clone());
        let runner = runner(dir.path(), probes, settings()).await;
        let gate = RunGate::new();
        let token = gate.try_acquire(CycleTrigger::Scheduled).unwrap();

        let report = runner
            .run_cycle(&token, config(ProviderSelection::SpeedSmart, 300), &CancellationToken::new())
            .await;
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].provider, ProviderId::SpeedSmart);
        assert_eq!(ost.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_becomes_failed_record_and_cycle_continues() {
        let dir = tempfile::tempdir().unwrap();
        let probes = ProbeSet::new()
            .with(ProviderId::OpenSpeedTest, ScriptedProbe::hanging(ProviderId::OpenSpeedTest))
            .with(ProviderId::SpeedSmart, ScriptedProbe::ok(ProviderId::SpeedSmart, Duration::ZERO));
        let runner = runner(dir.path(), probes, settings()).await;
        let gate = RunGate::new();
        let token = gate.try_acquire(CycleTrigger::Scheduled).unwrap();

        let report = runner
            .run_cycle(&token, config(ProviderSelection::Both, 0), &CancellationToken::new())
            .await;

        assert_eq!(report.status, CycleStatus::Degraded);
        assert_eq!(report.records.len(), 2);
        assert!(!report.records[0].is_success());
        assert!(report.records[0].error.as_deref().unwrap().contains("timed out"));
        assert!(report.records[1].is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = ScriptedProbe::flaky(ProviderId::SpeedSmart, 2);
        let probes = ProbeSet::new().with(ProviderId::SpeedSmart, flaky.clone());
        let runner = runner(
            dir.path(),
            probes,
            RunnerSettings {
                attempts: 3,
                ..settings()
            },
        )
        .await;
        let gate = RunGate::new();
        let token = gate.try_acquire(CycleTrigger::Manual).unwrap();

        let report = runner
            .run_cycle(&token, config(ProviderSelection::SpeedSmart, 0), &CancellationToken::new())
            .await;
        assert_eq!(flaky.calls(), 3);
        assert!(report.records[0].is_success());
        assert_eq!(report.records[0].raw["attempt"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = ScriptedProbe::flaky(ProviderId::SpeedSmart, 5);
        let probes = ProbeSet::new().with(ProviderId::SpeedSmart, flaky.clone());
        let runner = runner(
            dir.path(),
            probes,
            RunnerSettings {
                attempts: 2,
                ..settings()
            },
        )
        .await;
        let gate = RunGate::new();
        let token = gate.try_acquire(CycleTrigger::Manual).unwrap();

        let report = runner
            .run_cycle(&token, config(ProviderSelection::SpeedSmart, 0), &CancellationToken::new())
            .await;
        assert_eq!(flaky.calls(), 2);
        assert_eq!(report.records[0].error.as_deref(), Some("malformed probe output: scripted failure 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_provider_is_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path(), ProbeSet::new(), settings()).await;
        let gate = RunGate::new();
        let token = gate.try_acquire(CycleTrigger::Manual).unwrap();

        let report = runner
            .run_cycle(&token, config(ProviderSelection::OpenSpeedTest, 0), &CancellationToken::new())
            .await;
        assert_eq!(report.records.len(), 1);
        assert!(report.records[0].error.as_deref().unwrap().contains("no probe registered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_provider_is_tracked_during_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let probes = ProbeSet::new()
            .with(ProviderId::OpenSpeedTest, ScriptedProbe::ok(ProviderId::OpenSpeedTest, Duration::from_secs(10)))
            .with(ProviderId::SpeedSmart, ScriptedProbe::ok(ProviderId::SpeedSmart, Duration::from_secs(10)));
        let runner = Arc::new(runner(dir.path(), probes, settings()).await);
        assert!(runner.active().is_none());

        let gate = RunGate::new();
        let token = gate.try_acquire(CycleTrigger::Manual).unwrap();
        let cycle = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .run_cycle(&token, config(ProviderSelection::Both, 30), &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        let first = runner.active().expect("openspeedtest should be running");
        assert_eq!(first.provider, ProviderId::OpenSpeedTest);

        // Inside the inter-provider delay nothing is being measured.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(runner.active().is_none());

        tokio::time::sleep(Duration::from_secs(25)).await;
        let second = runner.active().expect("speedsmart should be running");
        assert_eq!(second.provider, ProviderId::SpeedSmart);
        assert!(second.started_at > first.started_at);

        cycle.await.unwrap();
        assert!(runner.active().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_provider_cleared_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let probes = ProbeSet::new().with(ProviderId::SpeedSmart, ScriptedProbe::hanging(ProviderId::SpeedSmart));
        let runner = Arc::new(runner(dir.path(), probes, settings()).await);
        let gate = RunGate::new();
        let token = gate.try_acquire(CycleTrigger::Manual).unwrap();
        let shutdown = CancellationToken::new();

        let cycle = {
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                runner
                    .run_cycle(&token, config(ProviderSelection::SpeedSmart, 0), &shutdown)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(runner.active().is_some());

        shutdown.cancel();
        let report = cycle.await.unwrap();
        assert_eq!(report.status, CycleStatus::Aborted);
        assert!(runner.active().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_delay_keeps_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let probes = ProbeSet::new()
            .with(ProviderId::OpenSpeedTest, ScriptedProbe::ok(ProviderId::OpenSpeedTest, Duration::ZERO))
            .with(ProviderId::SpeedSmart, ScriptedProbe::ok(ProviderId::SpeedSmart, Duration::ZERO));
        let runner = runner(dir.path(), probes, settings()).await;
        let gate = RunGate::new();
        let token = gate.try_acquire(CycleTrigger::Scheduled).unwrap();
        let shutdown = CancellationToken::new();

        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            cancel.cancel();
        });

        let report = runner
            .run_cycle(&token, config(ProviderSelection::Both, 300), &shutdown)
            .await;
        assert_eq!(report.status, CycleStatus::Aborted);
        assert_eq!(report.records.len(), 1);
        assert_eq!(runner.history().len().await.unwrap(), 1);
    }
}

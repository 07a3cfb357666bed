//! Run exclusion: at most one probe cycle at a time.
//!
//! Both trigger sources (the scheduler loop and manual "run now" requests)
//! go through [`RunGate::try_acquire`]. A request that finds the gate closed
//! fails immediately instead of queueing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::history::CycleTrigger;

#[derive(Debug, Default)]
struct GateState {
    busy: AtomicBool,
    holder: Mutex<Option<(CycleTrigger, DateTime<Utc>)>>,
}

/// Shared handle to the run-exclusion flag.
#[derive(Debug, Clone, Default)]
pub struct RunGate {
    state: Arc<GateState>,
}

/// Proof that the holder is the only running cycle. Dropping it reopens the gate.
#[derive(Debug)]
pub struct RunToken {
    state: Arc<GateState>,
    trigger: CycleTrigger,
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the token, or `None` if a cycle is already running.
    pub fn try_acquire(&self, trigger: CycleTrigger) -> Option<RunToken> {
        self.state
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        *self.state.holder.lock() = Some((trigger, Utc::now()));
        Some(RunToken {
            state: self.state.clone(),
            trigger,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.state.busy.load(Ordering::Acquire)
    }

    /// Who holds the token and since when.
    pub fn holder(&self) -> Option<(CycleTrigger, DateTime<Utc>)> {
        *self.state.holder.lock()
    }
}

impl RunToken {
    pub fn trigger(&self) -> CycleTrigger {
        self.trigger
    }
}

impl Drop for RunToken {
    fn drop(&mut self) {
        *self.state.holder.lock() = None;
        self.state.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let gate = RunGate::new();
        let token = gate.try_acquire(CycleTrigger::Scheduled).unwrap();
        assert!(gate.is_busy());
        assert!(gate.try_acquire(CycleTrigger::Manual).is_none());
        assert_eq!(gate.holder().map(|(t, _)| t), Some(CycleTrigger::Scheduled));

        drop(token);
        assert!(!gate.is_busy());
        assert!(gate.holder().is_none());
        assert!(gate.try_acquire(CycleTrigger::Manual).is_some());
    }

    #[test]
    fn test_exactly_one_winner_across_threads() {
        let gate = RunGate::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    // Keep the token alive until every thread has tried.
                    let token = gate.try_acquire(CycleTrigger::Manual);
                    std::thread::sleep(std::time::Duration::from_millis(200));
                    token.is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}

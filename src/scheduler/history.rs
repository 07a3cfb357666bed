//! Execution records for probe cycles.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::provider::ProviderId;
use crate::storage::MeasurementRecord;

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    /// Every provider produced a successful record.
    Success,
    /// At least one provider failed or its record could not be stored.
    Degraded,
    /// Shutdown interrupted the cycle.
    Aborted,
}

/// The provider currently being measured, and since when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActiveProbe {
    pub provider: ProviderId,
    pub started_at: DateTime<Utc>,
}

/// Summary of one probe cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub trigger: CycleTrigger,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records in the order they were appended.
    pub records: Vec<MeasurementRecord>,
    /// Append failures, one message per lost record.
    pub storage_errors: Vec<String>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.records.len() - self.succeeded()
    }
}

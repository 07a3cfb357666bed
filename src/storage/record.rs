//! Measurement records and history queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::{ProbeOutcome, ProviderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Failed,
}

/// One persisted outcome of a probe invocation.
///
/// `error` is present exactly when `status` is [`RecordStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: ProviderId,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub isp: Option<String>,
    pub server: Option<String>,
    pub status: RecordStatus,
    pub error: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl MeasurementRecord {
    pub fn success(provider: ProviderId, timestamp: DateTime<Utc>, outcome: ProbeOutcome) -> Self {
        Self {
            timestamp,
            provider,
            download_mbps: outcome.download_mbps,
            upload_mbps: outcome.upload_mbps,
            latency_ms: outcome.latency_ms,
            jitter_ms: outcome.jitter_ms,
            isp: outcome.isp,
            server: outcome.server,
            status: RecordStatus::Success,
            error: None,
            raw: outcome.raw,
        }
    }

    pub fn failed(provider: ProviderId, timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            timestamp,
            provider,
            download_mbps: None,
            upload_mbps: None,
            latency_ms: None,
            jitter_ms: None,
            isp: None,
            server: None,
            status: RecordStatus::Failed,
            error: Some(error.into()),
            raw: serde_json::Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RecordStatus::Success
    }

    /// Whether `error` agrees with `status` and every metric survives a
    /// JSON round trip (non-finite floats would be stored as `null`).
    pub fn is_consistent(&self) -> bool {
        let status_ok = match self.status {
            RecordStatus::Success => self.error.is_none(),
            RecordStatus::Failed => self.error.is_some(),
        };
        let finite = [
            self.download_mbps,
            self.upload_mbps,
            self.latency_ms,
            self.jitter_ms,
        ]
        .iter()
        .flatten()
        .all(|v| v.is_finite());
        status_ok && finite
    }
}

/// Time range / provider filter for history reads. Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub provider: Option<ProviderId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn provider(provider: ProviderId) -> Self {
        Self {
            provider: Some(provider),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &MeasurementRecord) -> bool {
        if self.provider.is_some_and(|p| p != record.provider) {
            return false;
        }
        if self.from.is_some_and(|from| record.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.timestamp > to) {
            return false;
        }
        true
    }

    pub fn apply<'a, I>(&self, records: I) -> Vec<MeasurementRecord>
    where
        I: IntoIterator<Item = &'a MeasurementRecord>,
    {
        records.into_iter().filter(|r| self.matches(r)).cloned().collect()
    }
}

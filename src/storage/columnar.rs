//! Column-oriented rendition of the history log.
//!
//! Each record field is stored as one array; row `i` of the log is the `i`th
//! element of every array. The document carries the generation of the ground
//! truth it was built from so staleness can be detected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{MeasurementRecord, RecordStatus};
use super::StorageError;
use crate::provider::ProviderId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Columns {
    pub timestamp: Vec<DateTime<Utc>>,
    pub provider: Vec<ProviderId>,
    pub download_mbps: Vec<Option<f64>>,
    pub upload_mbps: Vec<Option<f64>>,
    pub latency_ms: Vec<Option<f64>>,
    pub jitter_ms: Vec<Option<f64>>,
    pub isp: Vec<Option<String>>,
    pub server: Vec<Option<String>>,
    pub status: Vec<RecordStatus>,
    pub error: Vec<Option<String>>,
    pub raw: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnarHistory {
    pub generation: u64,
    pub rows: usize,
    pub columns: Columns,
}

impl ColumnarHistory {
    pub fn from_records(generation: u64, records: &[MeasurementRecord]) -> Self {
        let mut c = Columns::default();
        for r in records {
            c.timestamp.push(r.timestamp);
            c.provider.push(r.provider);
            c.download_mbps.push(r.download_mbps);
            c.upload_mbps.push(r.upload_mbps);
            c.latency_ms.push(r.latency_ms);
            c.jitter_ms.push(r.jitter_ms);
            c.isp.push(r.isp.clone());
            c.server.push(r.server.clone());
            c.status.push(r.status);
            c.error.push(r.error.clone());
            c.raw.push(r.raw.clone());
        }
        Self {
            generation,
            rows: records.len(),
            columns: c,
        }
    }

    /// Reassemble rows. Fails if any column length disagrees with `rows`.
    pub fn into_records(self) -> Result<Vec<MeasurementRecord>, StorageError> {
        let c = self.columns;
        let lens = [
            c.timestamp.len(),
            c.provider.len(),
            c.download_mbps.len(),
            c.upload_mbps.len(),
            c.latency_ms.len(),
            c.jitter_ms.len(),
            c.isp.len(),
            c.server.len(),
            c.status.len(),
            c.error.len(),
            c.raw.len(),
        ];
        if lens.iter().any(|&n| n != self.rows) {
            return Err(StorageError::Corrupt(format!(
                "columnar history declares {} rows but column lengths are {:?}",
                self.rows, lens
            )));
        }

        let mut timestamp = c.timestamp.into_iter();
        let mut provider = c.provider.into_iter();
        let mut download = c.download_mbps.into_iter();
        let mut upload = c.upload_mbps.into_iter();
        let mut latency = c.latency_ms.into_iter();
        let mut jitter = c.jitter_ms.into_iter();
        let mut isp = c.isp.into_iter();
        let mut server = c.server.into_iter();
        let mut status = c.status.into_iter();
        let mut error = c.error.into_iter();
        let mut raw = c.raw.into_iter();

        let mut records = Vec::with_capacity(self.rows);
        for _ in 0..self.rows {
            // Lengths were checked above.
            let (
                Some(timestamp),
                Some(provider),
                Some(download_mbps),
                Some(upload_mbps),
                Some(latency_ms),
                Some(jitter_ms),
                Some(isp),
                Some(server),
                Some(status),
                Some(error),
                Some(raw),
            ) = (
                timestamp.next(),
                provider.next(),
                download.next(),
                upload.next(),
                latency.next(),
                jitter.next(),
                isp.next(),
                server.next(),
                status.next(),
                error.next(),
                raw.next(),
            )
            else {
                break;
            };
            records.push(MeasurementRecord {
                timestamp,
                provider,
                download_mbps,
                upload_mbps,
                latency_ms,
                jitter_ms,
                isp,
                server,
                status,
                error,
                raw,
            });
        }
        Ok(records)
    }
}

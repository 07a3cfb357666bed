//! History export renderers.

use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::columnar::ColumnarHistory;
use super::record::{MeasurementRecord, RecordStatus};
use super::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Pretty-printed JSON array of records.
    Json,
    /// Row-oriented text with a header row.
    Csv,
    /// Column arrays, same layout as the on-disk derived cache.
    Columnar,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json | ExportFormat::Columnar => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "speedtest_history.json",
            ExportFormat::Csv => "speedtest_history.csv",
            ExportFormat::Columnar => "speedtest_history.columns.json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "columnar" | "columns" => Ok(ExportFormat::Columnar),
            other => Err(StorageError::UnsupportedFormat(other.to_string())),
        }
    }
}

pub const CSV_HEADER: &str =
    "timestamp,provider,status,download_mbps,upload_mbps,latency_ms,jitter_ms,isp,server,error";

/// Render `records` (already filtered and ordered) in `format`.
pub fn render(
    format: ExportFormat,
    generation: u64,
    records: &[MeasurementRecord],
) -> Result<Vec<u8>, StorageError> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(records)?),
        ExportFormat::Columnar => Ok(serde_json::to_vec_pretty(&ColumnarHistory::from_records(
            generation, records,
        ))?),
        ExportFormat::Csv => Ok(render_csv(records).into_bytes()),
    }
}

fn render_csv(records: &[MeasurementRecord]) -> String {
    let mut out = String::with_capacity(64 * (records.len() + 1));
    out.push_str(CSV_HEADER);
    out.push('\n');
    for r in records {
        let status = match r.status {
            RecordStatus::Success => "success",
            RecordStatus::Failed => "failed",
        };
        let fields = [
            r.timestamp.to_rfc3339(),
            r.provider.to_string(),
            status.to_string(),
            num(r.download_mbps),
            num(r.upload_mbps),
            num(r.latency_ms),
            num(r.jitter_ms),
            r.isp.clone().unwrap_or_default(),
            r.server.clone().unwrap_or_default(),
            r.error.clone().unwrap_or_default(),
        ];
        for (i, f) in fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            push_csv_field(&mut out, f);
        }
        out.push('\n');
    }
    out
}

fn num(v: Option<f64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_default()
}

fn push_csv_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        let _ = write!(out, "\"{}\"", field.replace('"', "\"\""));
    } else {
        out.push_str(field);
    }
}

//! SpeedSmart (speedsmart.net) result normalization.

use super::{ProbeError, ProbeOutcome, ProviderId, ProviderMeta};
use serde_json::Value;

pub fn meta() -> ProviderMeta {
    ProviderMeta {
        id: ProviderId::SpeedSmart,
        display_name: "SpeedSmart",
        site: "https://speedsmart.net/",
        description: "Browser-based speed test reporting ISP and server names.",
    }
}

fn number(json: &Value, key: &str) -> Result<Option<f64>, ProbeError> {
    match json.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Some(n)),
            _ => Err(ProbeError::Malformed(format!("'{key}' is not numeric: {s:?}"))),
        },
        Some(other) => Err(ProbeError::Malformed(format!("'{key}' has unexpected type: {other}"))),
    }
}

pub fn normalize(json: Value) -> Result<ProbeOutcome, ProbeError> {
    let req = |key: &str| -> Result<f64, ProbeError> {
        number(&json, key)?.ok_or_else(|| ProbeError::Malformed(format!("missing '{key}'")))
    };
    let download = req("download_speed")?;
    let upload = req("upload_speed")?;
    let ping = req("ping_speed")?;
    let jitter = number(&json, "jitter")?;
    let isp = json.get("isp_name").and_then(|v| v.as_str()).map(str::to_string);
    let server = json.get("server_name").and_then(|v| v.as_str()).map(str::to_string);

    Ok(ProbeOutcome {
        download_mbps: Some(download),
        upload_mbps: Some(upload),
        latency_ms: Some(ping),
        jitter_ms: jitter,
        isp,
        server,
        raw: json,
    })
}

//! OpenSpeedTest (openspeedtest.com) result normalization.
//!
//! The browser script prints values as display strings, e.g.
//! `"Download Speed": "312.5 Mbps"` or `"Ping": "9 ms"`.

use super::{ProbeError, ProbeOutcome, ProviderId, ProviderMeta};
use serde_json::Value;

pub fn meta() -> ProviderMeta {
    ProviderMeta {
        id: ProviderId::OpenSpeedTest,
        display_name: "OpenSpeedTest",
        site: "https://openspeedtest.com/",
        description: "HTML5 speed test served from the nearest OpenSpeedTest server.",
    }
}

/// Parse the leading number of a display string such as `"312.5 Mbps"`.
fn leading_number(json: &Value, key: &str) -> Result<Option<f64>, ProbeError> {
    let Some(v) = json.get(key) else {
        return Ok(None);
    };
    if let Some(n) = v.as_f64() {
        return Ok(Some(n));
    }
    let text = v
        .as_str()
        .ok_or_else(|| ProbeError::Malformed(format!("'{key}' is not a string")))?;
    let token = text.split_whitespace().next().unwrap_or_default();
    match token.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(Some(n)),
        _ => Err(ProbeError::Malformed(format!(
            "'{key}' has no numeric value: {text:?}"
        ))),
    }
}

fn required(json: &Value, key: &str) -> Result<f64, ProbeError> {
    leading_number(json, key)?.ok_or_else(|| ProbeError::Malformed(format!("missing '{key}'")))
}

fn text(json: &Value, key: &str) -> Option<String> {
    json.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn normalize(json: Value) -> Result<ProbeOutcome, ProbeError> {
    Ok(ProbeOutcome {
        download_mbps: Some(required(&json, "Download Speed")?),
        upload_mbps: Some(required(&json, "Upload Speed")?),
        latency_ms: Some(required(&json, "Ping")?),
        jitter_ms: leading_number(&json, "Jitter")?,
        isp: text(&json, "Server Location"),
        server: text(&json, "Server Name"),
        raw: json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_display_strings() {
        let out = normalize(json!({
            "Download Speed": "312.5 Mbps",
            "Upload Speed": "41.07 Mbps",
            "Ping": "9 ms",
            "Jitter": "1.2 ms",
            "Server Location": " Example ISP ",
            "Server Name": "Frankfurt"
        }))
        .unwrap();

        assert_eq!(out.download_mbps, Some(312.5));
        assert_eq!(out.upload_mbps, Some(41.07));
        assert_eq!(out.latency_ms, Some(9.0));
        assert_eq!(out.jitter_ms, Some(1.2));
        assert_eq!(out.isp.as_deref(), Some("Example ISP"));
        assert_eq!(out.server.as_deref(), Some("Frankfurt"));
        assert_eq!(out.raw["Ping"], "9 ms");
    }

    #[test]
    fn test_missing_download_is_malformed() {
        let err = normalize(json!({ "Upload Speed": "1 Mbps", "Ping": "3 ms" })).unwrap_err();
        assert!(matches!(err, ProbeError::Malformed(_)));
    }

    #[test]
    fn test_non_numeric_value_is_malformed() {
        let err = normalize(json!({
            "Download Speed": "-- Mbps",
            "Upload Speed": "1 Mbps",
            "Ping": "3 ms"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Download Speed"));
    }

    #[test]
    fn test_nan_and_infinity_are_malformed() {
        for bad in ["NaN Mbps", "inf Mbps"] {
            let err = normalize(json!({
                "Download Speed": bad,
                "Upload Speed": "1 Mbps",
                "Ping": "3 ms"
            }))
            .unwrap_err();
            assert!(matches!(err, ProbeError::Malformed(_)), "{bad}");
        }
    }
}
